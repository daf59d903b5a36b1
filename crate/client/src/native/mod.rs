//! The raw Cryptoki boundary.
//!
//! [`NativeModule`] mirrors the subset of the PKCS#11 function table the client uses.
//! It carries no policy: every method returns the module's `CK_RV` untouched on failure
//! and the [`crate::Gateway`] translates it. [`Pkcs11Library`] implements it over a
//! dynamically loaded shared library.

mod library;

pub use library::Pkcs11Library;
use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_FALSE, CK_FLAGS, CK_INFO, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE,
    CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID, CK_TOKEN_INFO, CK_TRUE, CK_ULONG, CK_USER_TYPE,
    CKA_CLASS, CKA_ID, CKA_KEY_TYPE, CKA_LABEL,
};

use crate::{
    mechanism::Mechanism,
    types::{KeyType, ObjectClass},
};

pub type RvResult<T> = Result<T, CK_RV>;

/// One entry of a search template: an attribute type and its encoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: CK_ATTRIBUTE_TYPE,
    pub value: Vec<u8>,
}

impl Attribute {
    #[must_use]
    pub fn ulong(kind: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        Self {
            kind,
            value: value.to_ne_bytes().to_vec(),
        }
    }

    #[must_use]
    pub fn bool(kind: CK_ATTRIBUTE_TYPE, value: bool) -> Self {
        let value: CK_BBOOL = if value { CK_TRUE } else { CK_FALSE };
        Self {
            kind,
            value: vec![value],
        }
    }

    #[must_use]
    pub fn bytes(kind: CK_ATTRIBUTE_TYPE, value: &[u8]) -> Self {
        Self {
            kind,
            value: value.to_vec(),
        }
    }

    #[must_use]
    pub fn class(class: ObjectClass) -> Self {
        Self::ulong(CKA_CLASS, class.ck_object_class())
    }

    #[must_use]
    pub fn key_type(key_type: KeyType) -> Self {
        Self::ulong(CKA_KEY_TYPE, key_type.ck_key_type())
    }

    #[must_use]
    pub fn label(label: &str) -> Self {
        Self::bytes(CKA_LABEL, label.as_bytes())
    }

    #[must_use]
    pub fn id(id: &[u8]) -> Self {
        Self::bytes(CKA_ID, id)
    }
}

/// Decode a `CK_ULONG` attribute value
#[must_use]
pub fn decode_ulong(value: &[u8]) -> Option<CK_ULONG> {
    let bytes = value.try_into().ok()?;
    Some(CK_ULONG::from_ne_bytes(bytes))
}

/// Decode a `CK_BBOOL` attribute value
#[must_use]
pub fn decode_bool(value: &[u8]) -> Option<bool> {
    match value {
        [b] => Some(*b != CK_FALSE),
        _ => None,
    }
}

/// Entry points of a PKCS#11 module.
///
/// Implementations must be callable from several threads; the module is
/// initialized with `CKF_OS_LOCKING_OK`.
pub trait NativeModule: Send + Sync {
    fn initialize(&self) -> RvResult<()>;

    fn finalize(&self) -> RvResult<()>;

    fn info(&self) -> RvResult<CK_INFO>;

    fn slot_list(&self, token_present: bool) -> RvResult<Vec<CK_SLOT_ID>>;

    fn token_info(&self, slot: CK_SLOT_ID) -> RvResult<CK_TOKEN_INFO>;

    fn mechanism_list(&self, slot: CK_SLOT_ID) -> RvResult<Vec<CK_MECHANISM_TYPE>>;

    fn open_session(&self, slot: CK_SLOT_ID, flags: CK_FLAGS) -> RvResult<CK_SESSION_HANDLE>;

    fn close_session(&self, session: CK_SESSION_HANDLE) -> RvResult<()>;

    /// `pin` is `None` for a protected authentication path
    fn login(
        &self,
        session: CK_SESSION_HANDLE,
        user_type: CK_USER_TYPE,
        pin: Option<&[u8]>,
    ) -> RvResult<()>;

    fn logout(&self, session: CK_SESSION_HANDLE) -> RvResult<()>;

    fn find_objects_init(&self, session: CK_SESSION_HANDLE, template: &[Attribute])
    -> RvResult<()>;

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        max_count: CK_ULONG,
    ) -> RvResult<Vec<CK_OBJECT_HANDLE>>;

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> RvResult<()>;

    /// Values in the order of `kinds`; `None` when the attribute is sensitive or
    /// does not exist on the object
    fn attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        kinds: &[CK_ATTRIBUTE_TYPE],
    ) -> RvResult<Vec<Option<Vec<u8>>>>;

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> RvResult<()>;

    fn sign_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> RvResult<()>;

    fn sign_final(&self, session: CK_SESSION_HANDLE) -> RvResult<Vec<u8>>;

    fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> RvResult<Vec<u8>>;

    /// Terminate an active sign operation.
    ///
    /// Cryptoki v2.40 has no cancel call: completing the operation and discarding
    /// the signature is the portable way to end it.
    fn abort_sign(&self, session: CK_SESSION_HANDLE) -> RvResult<()> {
        self.sign_final(session).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::{CKA_CLASS, CKA_SIGN, CKO_PRIVATE_KEY};

    use super::{Attribute, decode_bool, decode_ulong};
    use crate::types::ObjectClass;

    #[test]
    fn test_attribute_encoding() {
        let class = Attribute::class(ObjectClass::PrivateKey);
        assert_eq!(class.kind, CKA_CLASS);
        assert_eq!(decode_ulong(&class.value), Some(CKO_PRIVATE_KEY));
        assert_eq!(decode_ulong(&[1, 2, 3]), None);

        let sign = Attribute::bool(CKA_SIGN, true);
        assert_eq!(decode_bool(&sign.value), Some(true));
        assert_eq!(decode_bool(&[]), None);
    }
}
