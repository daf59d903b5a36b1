use std::fmt::{self, Debug, Formatter};

use zeroize::Zeroizing;

use crate::types::UserKind;

/// How a session authenticates to its token.
///
/// PINs are wiped from memory when the credential is dropped and never printed.
#[derive(Clone)]
pub enum Credential {
    User(Zeroizing<String>),
    SecurityOfficer(Zeroizing<String>),
    /// The PIN is entered on the device itself (PIN pad); a null PIN is sent to the module
    ProtectedAuthenticationPath,
}

impl Credential {
    pub fn user(pin: impl Into<String>) -> Self {
        Self::User(Zeroizing::new(pin.into()))
    }

    pub fn security_officer(pin: impl Into<String>) -> Self {
        Self::SecurityOfficer(Zeroizing::new(pin.into()))
    }

    /// The PKCS#11 user type this credential logs in as
    #[must_use]
    pub const fn user_kind(&self) -> UserKind {
        match self {
            Self::User(_) | Self::ProtectedAuthenticationPath => UserKind::User,
            Self::SecurityOfficer(_) => UserKind::SecurityOfficer,
        }
    }

    pub(crate) fn pin(&self) -> Option<&[u8]> {
        match self {
            Self::User(pin) | Self::SecurityOfficer(pin) => Some(pin.as_bytes()),
            Self::ProtectedAuthenticationPath => None,
        }
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(_) => f.write_str("User(***)"),
            Self::SecurityOfficer(_) => f.write_str("SecurityOfficer(***)"),
            Self::ProtectedAuthenticationPath => f.write_str("ProtectedAuthenticationPath"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Credential;
    use crate::types::UserKind;

    #[test]
    fn test_pin_is_redacted() {
        let credential = Credential::user("123456");
        assert_eq!(format!("{credential:?}"), "User(***)");
        assert_eq!(credential.pin(), Some(&b"123456"[..]));
        assert_eq!(credential.user_kind(), UserKind::User);

        let so = Credential::security_officer("so-secret");
        assert!(!format!("{so:?}").contains("so-secret"));
        assert_eq!(so.user_kind(), UserKind::SecurityOfficer);

        assert_eq!(Credential::ProtectedAuthenticationPath.pin(), None);
    }
}
