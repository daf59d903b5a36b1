//! Session lifecycle
//!
//! A [`Session`] wraps one native session handle together with its authentication
//! state and its current sign operation. The handle is only reachable through the
//! session, and every method checks the state before anything is sent to the module:
//! a closed or abandoned session fails with [`PError::InvalidHandle`] without a
//! native call.
//!
//! Methods that talk to the module take `&mut self`, and the type is not `Sync`,
//! so one session is never used by two threads at once. Independent sessions can be
//! moved to different threads.

use std::{
    cell::Cell,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use pkcs11_sys::{
    CK_MECHANISM_TYPE, CK_SESSION_HANDLE, CKR_USER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN,
};
use tracing::{debug, warn};

use super::{SessionOptions, sign::SignOperation};
use crate::{
    PError, PResult,
    credential::Credential,
    gateway::Gateway,
    types::{AccessMode, SlotId, TokenInfo, UserKind},
};

/// Process-wide serial numbers; object references remember the serial of their session
static NEXT_SESSION_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    Authenticated(UserKind),
    /// A native call ran past the session timeout; the session cannot be used anymore
    Abandoned,
    Closed,
}

pub struct Session {
    gateway: Arc<Gateway>,
    handle: CK_SESSION_HANDLE,
    serial: u64,
    token: TokenInfo,
    mode: AccessMode,
    state: SessionState,
    pub(super) operation: SignOperation,
    pub(super) options: SessionOptions,
    mechanisms: Option<Vec<CK_MECHANISM_TYPE>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Session {
    pub(crate) fn new(
        gateway: Arc<Gateway>,
        handle: CK_SESSION_HANDLE,
        token: TokenInfo,
        mode: AccessMode,
        options: SessionOptions,
    ) -> Self {
        debug!(
            "new session {handle} on token '{}' (slot {})",
            token.label, token.slot_id
        );
        Self {
            gateway,
            handle,
            serial: NEXT_SESSION_SERIAL.fetch_add(1, Ordering::Relaxed),
            token,
            mode,
            state: SessionState::Opened,
            operation: SignOperation::Idle,
            options,
            mechanisms: None,
            _not_sync: PhantomData,
        }
    }

    /// The native session handle
    #[must_use]
    pub const fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    #[must_use]
    pub const fn token(&self) -> &TokenInfo {
        &self.token
    }

    #[must_use]
    pub const fn slot_id(&self) -> SlotId {
        self.token.slot_id
    }

    #[must_use]
    pub const fn mode(&self) -> AccessMode {
        self.mode
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, SessionState::Authenticated(_))
    }

    pub(super) fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub(super) fn ensure_usable(&self, operation: &'static str) -> PResult<()> {
        match self.state {
            SessionState::Opened | SessionState::Authenticated(_) => Ok(()),
            SessionState::Abandoned => Err(PError::InvalidHandle {
                operation,
                reason: format!(
                    "session {} was abandoned after exceeding its timeout",
                    self.handle
                ),
            }),
            SessionState::Closed => Err(PError::InvalidHandle {
                operation,
                reason: format!("session {} is closed", self.handle),
            }),
        }
    }

    /// Fail if an operation is in progress on this session
    pub(super) fn ensure_idle(&self) -> PResult<()> {
        if self.operation.is_idle() {
            Ok(())
        } else {
            Err(PError::OperationActive {
                session: self.handle,
                operation: self.operation.describe(),
            })
        }
    }

    /// Abandon the session if the call that started at `started` ran past the timeout
    pub(super) fn check_deadline(
        &mut self,
        started: Instant,
        operation: &'static str,
    ) -> PResult<()> {
        if let Some(timeout) = self.options.timeout {
            if started.elapsed() > timeout {
                self.abandon(operation);
                return Err(PError::SessionTimeout {
                    session: self.handle,
                    operation,
                    timeout_ms: timeout.as_millis(),
                });
            }
        }
        Ok(())
    }

    /// The deadline takes precedence over the result of the call
    pub(super) fn finish<T>(
        &mut self,
        started: Instant,
        operation: &'static str,
        result: PResult<T>,
    ) -> PResult<T> {
        self.check_deadline(started, operation)?;
        result
    }

    fn abandon(&mut self, operation: &'static str) {
        warn!(
            "session {} exceeded its timeout in {operation}: abandoning it, the token may be in \
             an inconsistent state",
            self.handle
        );
        self.state = SessionState::Abandoned;
        self.operation = SignOperation::Idle;
        if let Err(e) = self.gateway.close_session(self.handle) {
            warn!("failed closing abandoned session {}: {e}", self.handle);
        }
    }

    /// Log in to the token.
    ///
    /// Logging in again as the same user type is a no-op and issues no native call.
    /// A failed login is reported as is and never retried.
    pub fn authenticate(&mut self, credential: &Credential) -> PResult<()> {
        self.ensure_usable("C_Login")?;
        self.ensure_idle()?;
        let kind = credential.user_kind();
        match self.state {
            SessionState::Authenticated(current) if current == kind => {
                debug!("session {} is already authenticated as {kind:?}", self.handle);
                return Ok(());
            }
            SessionState::Authenticated(current) => {
                return Err(PError::AuthenticationFailed {
                    session: self.handle,
                    reason: format!("the session is authenticated as {current:?}; log out first"),
                });
            }
            _ => {}
        }

        debug!("logging in session {} as {kind:?}", self.handle);
        let started = Instant::now();
        let result = match self.gateway.login(self.handle, kind, credential.pin()) {
            Err(e) if e.native_code() == Some(CKR_USER_ALREADY_LOGGED_IN) => {
                // login state is shared by all the sessions of the application on a token
                warn!("user already logged in, ignoring logging");
                Ok(())
            }
            other => other,
        };
        self.finish(started, "C_Login", result)?;
        self.state = SessionState::Authenticated(kind);
        Ok(())
    }

    /// Log out, returning the session to the opened state
    pub fn logout(&mut self) -> PResult<()> {
        self.ensure_usable("C_Logout")?;
        self.ensure_idle()?;
        if !self.is_authenticated() {
            debug!("session {} is not authenticated, nothing to log out", self.handle);
            return Ok(());
        }
        let started = Instant::now();
        let result = match self.gateway.logout(self.handle) {
            Err(e) if e.native_code() == Some(CKR_USER_NOT_LOGGED_IN) => {
                warn!("session {}: user was already logged out", self.handle);
                Ok(())
            }
            other => other,
        };
        self.finish(started, "C_Logout", result)?;
        self.state = SessionState::Opened;
        Ok(())
    }

    /// Mechanisms the token advertises; read once per session
    pub fn mechanisms(&mut self) -> PResult<&[CK_MECHANISM_TYPE]> {
        self.ensure_usable("C_GetMechanismList")?;
        if self.mechanisms.is_none() {
            let started = Instant::now();
            let result = self.gateway.mechanism_list(self.token.slot_id);
            let list = self.finish(started, "C_GetMechanismList", result)?;
            self.mechanisms = Some(list);
        }
        Ok(self.mechanisms.as_deref().unwrap_or_default())
    }

    /// Close the session.
    ///
    /// The session ends up closed whatever its prior state. An active sign operation is
    /// aborted first. Closing a closed or abandoned session issues no native call.
    /// The user is not logged out: closing the handle is enough, and logging out would
    /// affect the other sessions of the application on the same token.
    pub fn close(&mut self) -> PResult<()> {
        match self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Abandoned => {
                self.state = SessionState::Closed;
                return Ok(());
            }
            SessionState::Opened | SessionState::Authenticated(_) => {}
        }
        if !self.operation.is_idle() {
            self.operation = SignOperation::Idle;
            if let Err(e) = self.gateway.abort_sign(self.handle) {
                warn!("failed aborting the sign operation of session {}: {e}", self.handle);
            }
        }
        self.state = SessionState::Closed;
        self.gateway.close_session(self.handle)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed closing session {}: {e}", self.handle);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serial_test::serial;

    use super::SessionState;
    use crate::{
        AccessMode, Credential, PError, SessionManager, SessionOptions, SlotSelector,
        gateway::Gateway,
        mock::{MockModule, MockObject, MockToken, NativeFunction},
        types::KeyType,
    };

    fn module() -> MockModule {
        MockModule::new().with_token(
            MockToken::new(1, "alpha")
                .user_pin("1234")
                .object(MockObject::private_key("signer", KeyType::Rsa)),
        )
    }

    #[test]
    #[serial]
    fn test_authenticate_twice_logs_in_once() {
        let mock = module();
        let gateway = Gateway::initialize_with(mock.boxed(), "mock").unwrap();
        let manager = SessionManager::new(gateway, SessionOptions::default());
        let mut session = manager
            .open_session(&SlotSelector::Index(0), AccessMode::ReadOnly)
            .unwrap();

        let credential = Credential::user("1234");
        session.authenticate(&credential).unwrap();
        session.authenticate(&credential).unwrap();
        assert_eq!(mock.count(NativeFunction::Login), 1);
        assert_eq!(session.state(), SessionState::Authenticated(crate::UserKind::User));

        // another user type on an authenticated session is refused without a native call
        let err = session
            .authenticate(&Credential::security_officer("0000"))
            .unwrap_err();
        assert!(matches!(err, PError::AuthenticationFailed { .. }));
        assert_eq!(mock.count(NativeFunction::Login), 1);

        session.logout().unwrap();
        assert_eq!(session.state(), SessionState::Opened);
        session.authenticate(&credential).unwrap();
        assert_eq!(mock.count(NativeFunction::Login), 2);
    }

    #[test]
    #[serial]
    fn test_wrong_pin_then_lockout() {
        let mock = MockModule::new().with_token(
            MockToken::new(1, "alpha").user_pin("1234").max_retries(2),
        );
        let gateway = Gateway::initialize_with(mock.boxed(), "mock").unwrap();
        let manager = SessionManager::new(gateway, SessionOptions::default());
        let mut session = manager
            .open_session(&SlotSelector::Index(0), AccessMode::ReadOnly)
            .unwrap();

        let bad = Credential::user("0000");
        assert!(matches!(
            session.authenticate(&bad),
            Err(PError::AuthenticationFailed { .. })
        ));
        assert!(matches!(
            session.authenticate(&bad),
            Err(PError::AuthenticationLockedOut { .. })
        ));
        // no retry happened behind the caller's back
        assert_eq!(mock.count(NativeFunction::Login), 2);
        assert_eq!(session.state(), SessionState::Opened);
        assert!(matches!(
            session.authenticate(&Credential::user("1234")),
            Err(PError::AuthenticationLockedOut { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_close_is_idempotent() {
        let mock = module();
        let gateway = Gateway::initialize_with(mock.boxed(), "mock").unwrap();
        let manager = SessionManager::new(gateway, SessionOptions::default());
        let mut session = manager
            .open_session(&SlotSelector::Index(0), AccessMode::ReadWrite)
            .unwrap();

        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        session.close().unwrap();
        assert_eq!(mock.count(NativeFunction::CloseSession), 1);

        let before = mock.total_calls();
        assert!(matches!(
            session.authenticate(&Credential::user("1234")),
            Err(PError::InvalidHandle { .. })
        ));
        assert!(matches!(session.mechanisms(), Err(PError::InvalidHandle { .. })));
        assert_eq!(mock.total_calls(), before);

        drop(session);
        assert_eq!(mock.count(NativeFunction::CloseSession), 1);
    }

    #[test]
    #[serial]
    fn test_drop_closes_the_session() {
        let mock = module();
        let gateway = Gateway::initialize_with(mock.boxed(), "mock").unwrap();
        let manager = SessionManager::new(gateway, SessionOptions::default());
        let session = manager
            .open_session(&SlotSelector::Index(0), AccessMode::ReadOnly)
            .unwrap();
        assert_eq!(mock.open_sessions(), 1);
        drop(session);
        assert_eq!(mock.open_sessions(), 0);
        assert_eq!(mock.count(NativeFunction::Logout), 0);
    }

    #[test]
    #[serial]
    fn test_mechanisms_are_cached() {
        let mock = module();
        let gateway = Gateway::initialize_with(mock.boxed(), "mock").unwrap();
        let manager = SessionManager::new(gateway, SessionOptions::default());
        let mut session = manager
            .open_session(&SlotSelector::Index(0), AccessMode::ReadOnly)
            .unwrap();
        let first = session.mechanisms().unwrap().to_vec();
        let second = session.mechanisms().unwrap().to_vec();
        assert!(!first.is_empty());
        assert_eq!(first, second);
        assert_eq!(mock.count(NativeFunction::GetMechanismList), 1);
    }
}
