//! Client Facade
//!
//! The operations the CLI and signing integrations call. Each of them opens a
//! session, authenticates, does its work and closes the session again; only
//! [`Client::open_session`] hands a session over to the caller.

use std::{io::Read, sync::Arc};

use pkcs11_sys::CK_MECHANISM_TYPE;
use tracing::{debug, warn};

use crate::{
    PError, PResult,
    config::ClientConfig,
    credential::Credential,
    gateway::Gateway,
    mechanism::Mechanism,
    native::NativeModule,
    session::{Session, SessionOptions},
    session_manager::{SessionManager, SlotSelector},
    types::{AccessMode, KeyInfo, ModuleInfo, ObjectClass, TokenInfo},
};

pub struct Client {
    manager: SessionManager,
    config: ClientConfig,
}

impl Client {
    /// Load and initialize the module named in the configuration
    pub fn instantiate(config: ClientConfig) -> PResult<Self> {
        let gateway = Gateway::initialize(&config)?;
        Ok(Self::from_gateway(gateway, config))
    }

    /// Use an already loaded module implementation; `config.module_path` is only
    /// checked to be set
    pub fn with_module(
        module: Box<dyn NativeModule>,
        name: &str,
        config: ClientConfig,
    ) -> PResult<Self> {
        config.validate()?;
        let gateway = Gateway::initialize_with(module, name)?;
        Ok(Self::from_gateway(gateway, config))
    }

    fn from_gateway(gateway: Arc<Gateway>, config: ClientConfig) -> Self {
        let manager = SessionManager::new(gateway, SessionOptions::from(&config));
        Self { manager, config }
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub const fn session_manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Finalize the module now rather than when the client is dropped
    pub fn finalize(&self) -> PResult<()> {
        self.manager.gateway().finalize()
    }

    pub fn module_info(&self) -> PResult<ModuleInfo> {
        self.manager.gateway().info()
    }

    pub fn list_tokens(&self) -> PResult<Vec<TokenInfo>> {
        self.manager.discover_tokens()
    }

    pub fn list_mechanisms(&self, token: &SlotSelector) -> PResult<Vec<CK_MECHANISM_TYPE>> {
        self.manager.mechanisms(token)
    }

    pub fn list_signing_keys(
        &self,
        token: &SlotSelector,
        credential: Option<&Credential>,
    ) -> PResult<Vec<KeyInfo>> {
        self.with_session(token, credential, Session::list_signing_keys)
    }

    /// Sign `data` with the private key labelled `key_label`.
    ///
    /// Without an explicit mechanism, the configured default is used, or else the
    /// default for the key type.
    pub fn sign_with_key(
        &self,
        token: &SlotSelector,
        credential: Option<&Credential>,
        key_label: &str,
        mechanism: Option<&Mechanism>,
        data: impl Read,
    ) -> PResult<Vec<u8>> {
        self.with_session(token, credential, |session| {
            let mut key = session.resolve_unique(key_label, ObjectClass::PrivateKey)?;
            let mechanism = match mechanism.or(self.config.default_mechanism.as_ref()) {
                Some(mechanism) => mechanism.clone(),
                None => {
                    let key_type = session.load_key_type(&mut key)?.ok_or_else(|| {
                        PError::MechanismMismatch {
                            mechanism: "default".to_owned(),
                            key_type: "unknown".to_owned(),
                        }
                    })?;
                    Mechanism::default_for(key_type)
                }
            };
            debug!("signing with key '{key_label}' and {mechanism}");
            session.sign(&mut key, &mechanism, data)
        })
    }

    /// DER encoding of the certificate labelled `label`
    pub fn read_certificate(
        &self,
        token: &SlotSelector,
        credential: Option<&Credential>,
        label: &str,
    ) -> PResult<Vec<u8>> {
        self.with_session(token, credential, |session| session.read_certificate(label))
    }

    /// An authenticated session the caller owns; it is closed on `close()` or drop
    pub fn open_session(
        &self,
        token: &SlotSelector,
        credential: Option<&Credential>,
        mode: AccessMode,
    ) -> PResult<Session> {
        let mut session = self.manager.open_session(token, mode)?;
        Self::login(&mut session, credential)?;
        Ok(session)
    }

    fn login(session: &mut Session, credential: Option<&Credential>) -> PResult<()> {
        match credential {
            Some(credential) => session.authenticate(credential),
            None if session.token().login_required() => Err(PError::AuthenticationFailed {
                session: session.handle(),
                reason: format!(
                    "token '{}' requires a login and no credential was given",
                    session.token().label
                ),
            }),
            None => Ok(()),
        }
    }

    fn with_session<T>(
        &self,
        token: &SlotSelector,
        credential: Option<&Credential>,
        operation: impl FnOnce(&mut Session) -> PResult<T>,
    ) -> PResult<T> {
        let mut session = self.open_session(token, credential, AccessMode::ReadOnly)?;
        let result = operation(&mut session);
        let closed = session.close();
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_error)) => {
                warn!("failed closing session after an error: {close_error}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pkcs11_sys::CKM_SHA256_RSA_PKCS;
    use serial_test::serial;

    use super::Client;
    use crate::{
        AccessMode, ClientConfig, Credential, Mechanism, PError, SlotSelector,
        mock::{MockModule, MockObject, MockToken, NativeFunction},
        types::KeyType,
    };

    fn module() -> MockModule {
        MockModule::new().with_token(
            MockToken::new(1, "alpha")
                .user_pin("1234")
                .object(MockObject::private_key("rsa", KeyType::Rsa))
                .object(MockObject::private_key("ec", KeyType::Ec))
                .object(MockObject::certificate("rsa", b"DER".to_vec())),
        )
    }

    fn client(mock: &MockModule, config: ClientConfig) -> Client {
        Client::with_module(mock.boxed(), "mock", config).unwrap()
    }

    #[test]
    #[serial]
    fn test_every_call_closes_its_session() {
        let mock = module();
        let client = client(&mock, ClientConfig::new("mock"));
        let token = SlotSelector::label("alpha");
        let pin = Credential::user("1234");

        let keys = client.list_signing_keys(&token, Some(&pin)).unwrap();
        assert_eq!(keys.len(), 2);
        let signature = client
            .sign_with_key(&token, Some(&pin), "rsa", None, &b"payload"[..])
            .unwrap();
        assert!(!signature.is_empty());
        assert_eq!(client.read_certificate(&token, Some(&pin), "rsa").unwrap(), b"DER");

        assert_eq!(mock.open_sessions(), 0);
        assert_eq!(mock.count(NativeFunction::OpenSession), 3);
        assert_eq!(mock.count(NativeFunction::CloseSession), 3);
        assert!(
            client
                .list_mechanisms(&token)
                .unwrap()
                .contains(&CKM_SHA256_RSA_PKCS)
        );
    }

    #[test]
    #[serial]
    fn test_default_mechanism_selection() {
        let mock = module();
        let token = SlotSelector::Index(0);
        let pin = Credential::user("1234");

        let by_key_type = client(&mock, ClientConfig::new("mock"));
        let ec = by_key_type
            .sign_with_key(&token, Some(&pin), "ec", None, &b"x"[..])
            .unwrap();
        let explicit = by_key_type
            .sign_with_key(&token, Some(&pin), "ec", Some(&Mechanism::EcdsaSha256), &b"x"[..])
            .unwrap();
        assert_eq!(ec, explicit);
        drop(by_key_type);

        let mut config = ClientConfig::new("mock");
        config.default_mechanism = Some(Mechanism::Sha256RsaPkcs);
        let configured = client(&mock, config);
        // the configured default applies to every key, and is checked against it
        assert!(matches!(
            configured.sign_with_key(&token, Some(&pin), "ec", None, &b"x"[..]),
            Err(PError::MechanismMismatch { .. })
        ));
        assert_eq!(mock.open_sessions(), 0);
    }

    #[test]
    #[serial]
    fn test_missing_credential_and_key_errors() {
        let mock = module();
        let client = client(&mock, ClientConfig::new("mock"));
        let token = SlotSelector::Index(0);

        assert!(matches!(
            client.list_signing_keys(&token, None),
            Err(PError::AuthenticationFailed { .. })
        ));
        assert_eq!(mock.count(NativeFunction::Login), 0);
        assert!(matches!(
            client.sign_with_key(&token, Some(&Credential::user("1234")), "nope", None, &b""[..]),
            Err(PError::KeyNotFound(_))
        ));
        assert!(matches!(
            client.list_tokens().map(|t| t.len()),
            Ok(1)
        ));
        assert_eq!(mock.open_sessions(), 0);
    }

    #[test]
    #[serial]
    fn test_long_lived_session_and_finalize() {
        let mock = module();
        let client = client(&mock, ClientConfig::new("mock"));
        let mut session = client
            .open_session(&SlotSelector::Index(0), Some(&Credential::user("1234")), AccessMode::ReadOnly)
            .unwrap();
        assert!(session.is_authenticated());
        session.close().unwrap();

        assert!(matches!(
            Client::with_module(mock.boxed(), "again", ClientConfig::new("mock")),
            Err(PError::AlreadyInitialized)
        ));
        client.finalize().unwrap();
        assert!(matches!(client.list_tokens(), Err(PError::NotInitialized)));
        assert!(matches!(client.finalize(), Err(PError::NotInitialized)));

        // the process-wide slot is free again
        let again = Client::with_module(mock.boxed(), "again", ClientConfig::new("mock")).unwrap();
        assert_eq!(again.list_tokens().unwrap().len(), 1);
    }
}
