use std::fmt::{self, Display, Formatter};

use pkcs11_sys::{
    CK_FLAGS, CK_INFO, CK_KEY_TYPE, CK_OBJECT_CLASS, CK_SLOT_ID, CK_TOKEN_INFO, CK_USER_TYPE,
    CKF_LOGIN_REQUIRED, CKF_PROTECTED_AUTHENTICATION_PATH, CKF_RNG, CKF_TOKEN_INITIALIZED,
    CKF_USER_PIN_LOCKED, CKF_WRITE_PROTECTED, CKK_EC, CKK_RSA, CKO_CERTIFICATE, CKO_DATA,
    CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKO_SECRET_KEY, CKU_SO, CKU_USER,
};
use serde::{Deserialize, Serialize};

/// `CKK_EC_EDWARDS`, introduced by PKCS#11 v3.0
pub(crate) const CKK_EC_EDWARDS: CK_KEY_TYPE = 0x0000_0040;

/// Native slot identifier
pub type SlotId = CK_SLOT_ID;

/// PKCS#11 strings are fixed width and padded with blanks, not NUL terminated
pub(crate) fn padded_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(bytes.get(..end).unwrap_or_default())
        .trim_end()
        .to_owned()
}

/// Fill a fixed width PKCS#11 string field, blank padded
pub(crate) fn pad_into(dst: &mut [u8], value: &str) {
    dst.fill(b' ');
    for (d, s) in dst.iter_mut().zip(value.as_bytes()) {
        *d = *s;
    }
}

/// Information about the loaded module, as returned by `C_GetInfo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub cryptoki_version: (u8, u8),
    pub manufacturer_id: String,
    pub library_description: String,
    pub library_version: (u8, u8),
}

impl From<CK_INFO> for ModuleInfo {
    fn from(info: CK_INFO) -> Self {
        Self {
            cryptoki_version: (info.cryptokiVersion.major, info.cryptokiVersion.minor),
            manufacturer_id: padded_str(&info.manufacturerID),
            library_description: padded_str(&info.libraryDescription),
            library_version: (info.libraryVersion.major, info.libraryVersion.minor),
        }
    }
}

impl Display for ModuleInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cryptoki Version: {}.{}\nManufacturer ID: {}\nLibrary Description: {}\nLibrary \
             Version: {}.{}",
            self.cryptoki_version.0,
            self.cryptoki_version.1,
            self.manufacturer_id,
            self.library_description,
            self.library_version.0,
            self.library_version.1
        )
    }
}

/// The token present in a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub slot_id: SlotId,
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
    pub flags: CK_FLAGS,
}

impl TokenInfo {
    pub(crate) fn from_native(slot_id: SlotId, info: &CK_TOKEN_INFO) -> Self {
        Self {
            slot_id,
            label: padded_str(&info.label),
            manufacturer_id: padded_str(&info.manufacturerID),
            model: padded_str(&info.model),
            serial_number: padded_str(&info.serialNumber),
            flags: info.flags,
        }
    }

    #[must_use]
    pub const fn login_required(&self) -> bool {
        self.flags & CKF_LOGIN_REQUIRED != 0
    }

    #[must_use]
    pub const fn has_rng(&self) -> bool {
        self.flags & CKF_RNG != 0
    }

    #[must_use]
    pub const fn write_protected(&self) -> bool {
        self.flags & CKF_WRITE_PROTECTED != 0
    }

    #[must_use]
    pub const fn protected_authentication_path(&self) -> bool {
        self.flags & CKF_PROTECTED_AUTHENTICATION_PATH != 0
    }

    #[must_use]
    pub const fn initialized(&self) -> bool {
        self.flags & CKF_TOKEN_INITIALIZED != 0
    }

    #[must_use]
    pub const fn user_pin_locked(&self) -> bool {
        self.flags & CKF_USER_PIN_LOCKED != 0
    }
}

impl Display for TokenInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot {}: {} ({} {}, serial {}){}",
            self.slot_id,
            self.label,
            self.manufacturer_id,
            self.model,
            self.serial_number,
            if self.login_required() {
                " [login required]"
            } else {
                ""
            }
        )
    }
}

/// Read-only or read-write session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// The PKCS#11 user types a session can be authenticated as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserKind {
    User,
    SecurityOfficer,
}

impl UserKind {
    pub(crate) const fn ck_user_type(self) -> CK_USER_TYPE {
        match self {
            Self::User => CKU_USER,
            Self::SecurityOfficer => CKU_SO,
        }
    }
}

/// Key types the signing engine understands
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ec,
    Eddsa,
}

impl KeyType {
    #[must_use]
    pub const fn ck_key_type(self) -> CK_KEY_TYPE {
        match self {
            Self::Rsa => CKK_RSA,
            Self::Ec => CKK_EC,
            Self::Eddsa => CKK_EC_EDWARDS,
        }
    }

    #[must_use]
    pub const fn from_ck_key_type(key_type: CK_KEY_TYPE) -> Option<Self> {
        match key_type {
            CKK_RSA => Some(Self::Rsa),
            CKK_EC => Some(Self::Ec),
            CKK_EC_EDWARDS => Some(Self::Eddsa),
            _ => None,
        }
    }
}

/// Object classes the catalog searches for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ObjectClass {
    Data,
    Certificate,
    PublicKey,
    PrivateKey,
    SecretKey,
}

impl ObjectClass {
    #[must_use]
    pub const fn ck_object_class(self) -> CK_OBJECT_CLASS {
        match self {
            Self::Data => CKO_DATA,
            Self::Certificate => CKO_CERTIFICATE,
            Self::PublicKey => CKO_PUBLIC_KEY,
            Self::PrivateKey => CKO_PRIVATE_KEY,
            Self::SecretKey => CKO_SECRET_KEY,
        }
    }

    #[must_use]
    pub const fn from_ck_object_class(class: CK_OBJECT_CLASS) -> Option<Self> {
        match class {
            CKO_DATA => Some(Self::Data),
            CKO_CERTIFICATE => Some(Self::Certificate),
            CKO_PUBLIC_KEY => Some(Self::PublicKey),
            CKO_PRIVATE_KEY => Some(Self::PrivateKey),
            CKO_SECRET_KEY => Some(Self::SecretKey),
            _ => None,
        }
    }
}

/// A signing key as listed by the client facade
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub label: String,
    /// `CKA_ID`, hex encoded
    pub id: String,
    pub key_type: Option<KeyType>,
    pub class: ObjectClass,
}

impl Display for KeyInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let key_type = self
            .key_type
            .map_or_else(|| "unknown".to_owned(), |k| k.to_string());
        write!(f, "{}\tid={}\t{}\t{}", self.label, self.id, key_type, self.class)
    }
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::{CK_TOKEN_INFO, CKF_LOGIN_REQUIRED, CKF_TOKEN_INITIALIZED};

    use super::{KeyType, TokenInfo, pad_into, padded_str};

    #[test]
    fn test_padded_strings() {
        let mut field = [0_u8; 32];
        pad_into(&mut field, "signing token");
        assert_eq!(field[31], b' ');
        assert_eq!(padded_str(&field), "signing token");
        assert_eq!(padded_str(b"abc\0\0\0"), "abc");
    }

    #[test]
    fn test_token_info_from_native() {
        let mut native = CK_TOKEN_INFO::default();
        pad_into(&mut native.label, "alpha");
        pad_into(&mut native.serialNumber, "0001");
        native.flags = CKF_LOGIN_REQUIRED | CKF_TOKEN_INITIALIZED;
        let info = TokenInfo::from_native(3, &native);
        assert_eq!(info.slot_id, 3);
        assert_eq!(info.label, "alpha");
        assert_eq!(info.serial_number, "0001");
        assert!(info.login_required());
        assert!(info.initialized());
        assert!(!info.user_pin_locked());
    }

    #[test]
    fn test_key_type_codes() {
        for kt in [KeyType::Rsa, KeyType::Ec, KeyType::Eddsa] {
            assert_eq!(KeyType::from_ck_key_type(kt.ck_key_type()), Some(kt));
        }
        assert_eq!("ec".parse::<KeyType>().ok(), Some(KeyType::Ec));
        assert_eq!(KeyType::from_ck_key_type(0x1234), None);
    }
}
