//! Signature mechanisms.
//!
//! A [`Mechanism`] names the algorithm the token runs and the key type it requires.
//! Standard schemes are plain variants; deployment specific mechanisms use
//! [`Mechanism::Custom`] with raw parameter bytes handed to the module untouched.
//!
//! The textual form is a kebab-case name (`sha256-rsa-pkcs`) or
//! `custom:<hex mechanism type>:<key type>[:<hex parameter>]`.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use pkcs11_sys::{
    CK_MECHANISM_TYPE, CK_RSA_PKCS_MGF_TYPE, CK_RSA_PKCS_PSS_PARAMS, CK_ULONG, CKG_MGF1_SHA256,
    CKG_MGF1_SHA384, CKG_MGF1_SHA512, CKM_ECDSA, CKM_ECDSA_SHA256, CKM_ECDSA_SHA384,
    CKM_ECDSA_SHA512, CKM_RSA_PKCS, CKM_SHA1_RSA_PKCS, CKM_SHA256, CKM_SHA256_RSA_PKCS,
    CKM_SHA256_RSA_PKCS_PSS, CKM_SHA384, CKM_SHA384_RSA_PKCS, CKM_SHA384_RSA_PKCS_PSS, CKM_SHA512,
    CKM_SHA512_RSA_PKCS, CKM_SHA512_RSA_PKCS_PSS,
};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{PError, types::KeyType};

/// `CKM_EDDSA`, introduced by PKCS#11 v3.0
pub(crate) const CKM_EDDSA: CK_MECHANISM_TYPE = 0x0000_1057;

const CUSTOM_PREFIX: &str = "custom";

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, strum::IntoStaticStr, strum::EnumIter, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub enum Mechanism {
    #[strum(serialize = "rsa-pkcs")]
    RsaPkcs,
    #[strum(serialize = "sha1-rsa-pkcs")]
    Sha1RsaPkcs,
    #[strum(serialize = "sha256-rsa-pkcs")]
    Sha256RsaPkcs,
    #[strum(serialize = "sha384-rsa-pkcs")]
    Sha384RsaPkcs,
    #[strum(serialize = "sha512-rsa-pkcs")]
    Sha512RsaPkcs,
    #[strum(serialize = "sha256-rsa-pkcs-pss")]
    Sha256RsaPkcsPss,
    #[strum(serialize = "sha384-rsa-pkcs-pss")]
    Sha384RsaPkcsPss,
    #[strum(serialize = "sha512-rsa-pkcs-pss")]
    Sha512RsaPkcsPss,
    #[strum(serialize = "ecdsa")]
    Ecdsa,
    #[strum(serialize = "ecdsa-sha256")]
    EcdsaSha256,
    #[strum(serialize = "ecdsa-sha384")]
    EcdsaSha384,
    #[strum(serialize = "ecdsa-sha512")]
    EcdsaSha512,
    #[strum(serialize = "eddsa")]
    Eddsa,
    /// A mechanism the module defines, passed through as is
    #[strum(disabled)]
    Custom {
        mechanism_type: CK_MECHANISM_TYPE,
        parameter: Vec<u8>,
        key_type: KeyType,
    },
}

impl Mechanism {
    /// The `CKM_*` code sent to the module
    #[must_use]
    pub const fn mechanism_type(&self) -> CK_MECHANISM_TYPE {
        match self {
            Self::RsaPkcs => CKM_RSA_PKCS,
            Self::Sha1RsaPkcs => CKM_SHA1_RSA_PKCS,
            Self::Sha256RsaPkcs => CKM_SHA256_RSA_PKCS,
            Self::Sha384RsaPkcs => CKM_SHA384_RSA_PKCS,
            Self::Sha512RsaPkcs => CKM_SHA512_RSA_PKCS,
            Self::Sha256RsaPkcsPss => CKM_SHA256_RSA_PKCS_PSS,
            Self::Sha384RsaPkcsPss => CKM_SHA384_RSA_PKCS_PSS,
            Self::Sha512RsaPkcsPss => CKM_SHA512_RSA_PKCS_PSS,
            Self::Ecdsa => CKM_ECDSA,
            Self::EcdsaSha256 => CKM_ECDSA_SHA256,
            Self::EcdsaSha384 => CKM_ECDSA_SHA384,
            Self::EcdsaSha512 => CKM_ECDSA_SHA512,
            Self::Eddsa => CKM_EDDSA,
            Self::Custom { mechanism_type, .. } => *mechanism_type,
        }
    }

    /// The key type this mechanism can be used with
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::RsaPkcs
            | Self::Sha1RsaPkcs
            | Self::Sha256RsaPkcs
            | Self::Sha384RsaPkcs
            | Self::Sha512RsaPkcs
            | Self::Sha256RsaPkcsPss
            | Self::Sha384RsaPkcsPss
            | Self::Sha512RsaPkcsPss => KeyType::Rsa,
            Self::Ecdsa | Self::EcdsaSha256 | Self::EcdsaSha384 | Self::EcdsaSha512 => KeyType::Ec,
            Self::Eddsa => KeyType::Eddsa,
            Self::Custom { key_type, .. } => *key_type,
        }
    }

    /// PSS parameters; the salt is as long as the hash
    #[must_use]
    pub fn pss_params(&self) -> Option<CK_RSA_PKCS_PSS_PARAMS> {
        let (hash, mgf, salt): (CK_MECHANISM_TYPE, CK_RSA_PKCS_MGF_TYPE, CK_ULONG) = match self {
            Self::Sha256RsaPkcsPss => (CKM_SHA256, CKG_MGF1_SHA256, 32),
            Self::Sha384RsaPkcsPss => (CKM_SHA384, CKG_MGF1_SHA384, 48),
            Self::Sha512RsaPkcsPss => (CKM_SHA512, CKG_MGF1_SHA512, 64),
            _ => return None,
        };
        Some(CK_RSA_PKCS_PSS_PARAMS {
            hashAlg: hash,
            mgf,
            sLen: salt,
        })
    }

    /// Raw parameter bytes of a custom mechanism, if any
    #[must_use]
    pub fn raw_parameter(&self) -> Option<&[u8]> {
        match self {
            Self::Custom { parameter, .. } if !parameter.is_empty() => Some(parameter),
            _ => None,
        }
    }

    /// The mechanism used when the caller does not choose one
    #[must_use]
    pub const fn default_for(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Rsa => Self::Sha256RsaPkcs,
            KeyType::Ec => Self::EcdsaSha256,
            KeyType::Eddsa => Self::Eddsa,
        }
    }

    /// Look up a standard mechanism by its `CKM_*` code
    #[must_use]
    pub fn from_mechanism_type(mechanism_type: CK_MECHANISM_TYPE) -> Option<Self> {
        Self::iter().find(|m| m.mechanism_type() == mechanism_type)
    }

    /// The names of all standard mechanisms
    pub fn standard_names() -> impl Iterator<Item = &'static str> {
        Self::iter().map(<&'static str>::from)
    }

    fn parse_custom(s: &str) -> Result<Self, PError> {
        let mut parts = s.splitn(4, ':');
        let _prefix = parts.next();
        let mechanism_type = parts
            .next()
            .ok_or_else(|| PError::Configuration(format!("missing mechanism type in '{s}'")))?;
        let mechanism_type = CK_MECHANISM_TYPE::from_str_radix(
            mechanism_type.trim_start_matches("0x"),
            16,
        )
        .map_err(|e| {
            PError::Configuration(format!("invalid mechanism type '{mechanism_type}': {e}"))
        })?;
        let key_type = parts
            .next()
            .ok_or_else(|| PError::Configuration(format!("missing key type in '{s}'")))?;
        let key_type = KeyType::from_str(key_type)
            .map_err(|_| PError::Configuration(format!("unknown key type '{key_type}'")))?;
        let parameter = match parts.next() {
            Some(p) => hex::decode(p)
                .map_err(|e| PError::Configuration(format!("invalid mechanism parameter: {e}")))?,
            None => Vec::new(),
        };
        Ok(Self::Custom {
            mechanism_type,
            parameter,
            key_type,
        })
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom {
                mechanism_type,
                parameter,
                key_type,
            } => {
                write!(f, "{CUSTOM_PREFIX}:{mechanism_type:x}:{key_type}")?;
                if !parameter.is_empty() {
                    write!(f, ":{}", hex::encode(parameter))?;
                }
                Ok(())
            }
            standard => f.write_str(<&'static str>::from(standard)),
        }
    }
}

impl FromStr for Mechanism {
    type Err = PError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.split(':').next() == Some(CUSTOM_PREFIX) {
            return Self::parse_custom(s);
        }
        Self::iter()
            .find(|m| <&'static str>::from(m).eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                PError::Configuration(format!(
                    "unknown mechanism '{s}', expected one of: {}",
                    Self::standard_names().collect::<Vec<_>>().join(", ")
                ))
            })
    }
}

impl TryFrom<String> for Mechanism {
    type Error = PError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Mechanism> for String {
    fn from(mechanism: Mechanism) -> Self {
        mechanism.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pkcs11_sys::{CKM_SHA256, CKM_SHA256_RSA_PKCS};

    use super::Mechanism;
    use crate::types::KeyType;

    #[test]
    fn test_parse_standard_names() {
        let m: Mechanism = "sha256-rsa-pkcs".parse().unwrap();
        assert_eq!(m, Mechanism::Sha256RsaPkcs);
        assert_eq!(m.mechanism_type(), CKM_SHA256_RSA_PKCS);
        assert_eq!(m.key_type(), KeyType::Rsa);
        assert_eq!("ECDSA-SHA384".parse::<Mechanism>().unwrap(), Mechanism::EcdsaSha384);
        assert_eq!(Mechanism::Eddsa.to_string(), "eddsa");
        assert!("sha3-rsa".parse::<Mechanism>().is_err());
    }

    #[test]
    fn test_parse_custom() {
        let m: Mechanism = "custom:80000010:ec:0a0b".parse().unwrap();
        assert_eq!(
            m,
            Mechanism::Custom {
                mechanism_type: 0x8000_0010,
                parameter: vec![0x0a, 0x0b],
                key_type: KeyType::Ec,
            }
        );
        assert_eq!(m.to_string(), "custom:80000010:ec:0a0b");
        assert_eq!(m.raw_parameter(), Some(&[0x0a_u8, 0x0b][..]));

        let m: Mechanism = "custom:0x1:rsa".parse().unwrap();
        assert_eq!(m.mechanism_type(), 1);
        assert_eq!(m.raw_parameter(), None);

        assert!("custom:zz:rsa".parse::<Mechanism>().is_err());
        assert!("custom:10:dsa".parse::<Mechanism>().is_err());
        assert!("custom:10".parse::<Mechanism>().is_err());
    }

    #[test]
    fn test_pss_params_and_defaults() {
        let params = Mechanism::Sha256RsaPkcsPss.pss_params().unwrap();
        assert_eq!(params.hashAlg, CKM_SHA256);
        assert_eq!(params.sLen, 32);
        assert!(Mechanism::Sha256RsaPkcs.pss_params().is_none());

        assert_eq!(Mechanism::default_for(KeyType::Rsa), Mechanism::Sha256RsaPkcs);
        assert_eq!(Mechanism::default_for(KeyType::Ec), Mechanism::EcdsaSha256);
        assert_eq!(Mechanism::default_for(KeyType::Eddsa), Mechanism::Eddsa);
        assert_eq!(
            Mechanism::from_mechanism_type(CKM_SHA256_RSA_PKCS),
            Some(Mechanism::Sha256RsaPkcs)
        );
    }
}
