//! A scriptable in-memory PKCS#11 module.
//!
//! [`MockModule`] implements [`NativeModule`] with tokens, objects and PINs defined by
//! the test. It records every call, can fail or slow down any entry point on demand,
//! and signs deterministically: the signature is the SHA3-256 digest of the key
//! handle, the mechanism type and the data, so that chunked and single-shot signing
//! can be compared.
//!
//! Clones share their state: keep one clone to inspect what the gateway did with
//! the other.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_INFO, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_RV,
    CK_SESSION_HANDLE, CK_SLOT_ID, CK_TOKEN_INFO, CK_ULONG, CK_USER_TYPE, CKA_CLASS, CKA_ID,
    CKA_KEY_TYPE, CKA_LABEL, CKA_PRIVATE, CKA_SIGN, CKA_TOKEN, CKA_VALUE, CKF_LOGIN_REQUIRED,
    CKF_PROTECTED_AUTHENTICATION_PATH, CKF_RNG, CKF_SERIAL_SESSION, CKF_TOKEN_INITIALIZED,
    CKF_USER_PIN_LOCKED, CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED,
    CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_KEY_HANDLE_INVALID, CKR_KEY_TYPE_INCONSISTENT,
    CKR_MECHANISM_INVALID, CKR_OBJECT_HANDLE_INVALID, CKR_OPERATION_ACTIVE,
    CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_INCORRECT, CKR_PIN_LOCKED,
    CKR_SESSION_HANDLE_INVALID, CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SLOT_ID_INVALID,
    CKR_TOKEN_NOT_PRESENT, CKR_USER_ALREADY_LOGGED_IN, CKR_USER_ANOTHER_ALREADY_LOGGED_IN,
    CKR_USER_NOT_LOGGED_IN, CKU_SO, CKU_USER,
};
use sha3::{Digest, Sha3_256};
use strum::IntoEnumIterator;

use crate::{
    mechanism::Mechanism,
    native::{Attribute, NativeModule, RvResult},
    types::{KeyType, ObjectClass, pad_into},
};

/// First handle given to mock objects
const FIRST_OBJECT_HANDLE: CK_OBJECT_HANDLE = 1000;

/// The entry points of the module, as recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum NativeFunction {
    #[strum(serialize = "C_Initialize")]
    Initialize,
    #[strum(serialize = "C_Finalize")]
    Finalize,
    #[strum(serialize = "C_GetInfo")]
    GetInfo,
    #[strum(serialize = "C_GetSlotList")]
    GetSlotList,
    #[strum(serialize = "C_GetTokenInfo")]
    GetTokenInfo,
    #[strum(serialize = "C_GetMechanismList")]
    GetMechanismList,
    #[strum(serialize = "C_OpenSession")]
    OpenSession,
    #[strum(serialize = "C_CloseSession")]
    CloseSession,
    #[strum(serialize = "C_Login")]
    Login,
    #[strum(serialize = "C_Logout")]
    Logout,
    #[strum(serialize = "C_FindObjectsInit")]
    FindObjectsInit,
    #[strum(serialize = "C_FindObjects")]
    FindObjects,
    #[strum(serialize = "C_FindObjectsFinal")]
    FindObjectsFinal,
    #[strum(serialize = "C_GetAttributeValue")]
    GetAttributeValue,
    #[strum(serialize = "C_SignInit")]
    SignInit,
    #[strum(serialize = "C_SignUpdate")]
    SignUpdate,
    #[strum(serialize = "C_SignFinal")]
    SignFinal,
    #[strum(serialize = "C_Sign")]
    Sign,
}

impl NativeFunction {
    const fn ends_sign_operation(self) -> bool {
        matches!(self, Self::SignUpdate | Self::SignFinal | Self::Sign)
    }
}

/// One recorded call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCall {
    pub function: NativeFunction,
    pub session: Option<CK_SESSION_HANDLE>,
}

/// An object stored on a mock token
#[derive(Debug, Clone)]
pub struct MockObject {
    handle: CK_OBJECT_HANDLE,
    class: ObjectClass,
    label: String,
    id: Vec<u8>,
    key_type: Option<KeyType>,
    can_sign: bool,
    private: bool,
    value: Option<Vec<u8>>,
}

impl MockObject {
    fn new(class: ObjectClass, label: &str) -> Self {
        Self {
            handle: 0,
            class,
            label: label.to_owned(),
            id: Vec::new(),
            key_type: None,
            can_sign: false,
            private: false,
            value: None,
        }
    }

    /// A private key allowed to sign, visible only after login
    #[must_use]
    pub fn private_key(label: &str, key_type: KeyType) -> Self {
        Self {
            key_type: Some(key_type),
            can_sign: true,
            private: true,
            ..Self::new(ObjectClass::PrivateKey, label)
        }
    }

    #[must_use]
    pub fn public_key(label: &str, key_type: KeyType) -> Self {
        Self {
            key_type: Some(key_type),
            ..Self::new(ObjectClass::PublicKey, label)
        }
    }

    /// A public certificate holding `der` as its value
    #[must_use]
    pub fn certificate(label: &str, der: Vec<u8>) -> Self {
        Self {
            value: Some(der),
            ..Self::new(ObjectClass::Certificate, label)
        }
    }

    #[must_use]
    pub fn id(mut self, id: &[u8]) -> Self {
        self.id = id.to_vec();
        self
    }

    #[must_use]
    pub const fn can_sign(mut self, can_sign: bool) -> Self {
        self.can_sign = can_sign;
        self
    }

    #[must_use]
    pub const fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    fn is_key(&self) -> bool {
        matches!(
            self.class,
            ObjectClass::PrivateKey | ObjectClass::PublicKey | ObjectClass::SecretKey
        )
    }

    fn attribute(&self, kind: CK_ATTRIBUTE_TYPE) -> Option<Vec<u8>> {
        let attribute = match kind {
            CKA_CLASS => Attribute::class(self.class),
            CKA_LABEL => Attribute::label(&self.label),
            CKA_ID => Attribute::id(&self.id),
            CKA_TOKEN => Attribute::bool(CKA_TOKEN, true),
            CKA_PRIVATE => Attribute::bool(CKA_PRIVATE, self.private),
            CKA_KEY_TYPE => Attribute::key_type(self.key_type?),
            CKA_SIGN if self.is_key() => Attribute::bool(CKA_SIGN, self.can_sign),
            CKA_VALUE => return self.value.clone(),
            _ => return None,
        };
        Some(attribute.value)
    }

    fn matches(&self, template: &[Attribute]) -> bool {
        template
            .iter()
            .all(|a| self.attribute(a.kind).as_deref() == Some(a.value.as_slice()))
    }
}

/// A token in a mock slot
#[derive(Debug, Clone)]
pub struct MockToken {
    slot_id: CK_SLOT_ID,
    label: String,
    present: bool,
    login_required: bool,
    protected_authentication_path: bool,
    user_pin: String,
    so_pin: String,
    max_retries: u32,
    mechanisms: Vec<CK_MECHANISM_TYPE>,
    objects: Vec<MockObject>,
    failed_logins: u32,
    locked: bool,
    logged_in: Option<CK_USER_TYPE>,
}

impl MockToken {
    /// A present token requiring login, advertising every standard mechanism
    #[must_use]
    pub fn new(slot_id: CK_SLOT_ID, label: &str) -> Self {
        Self {
            slot_id,
            label: label.to_owned(),
            present: true,
            login_required: true,
            protected_authentication_path: false,
            user_pin: "1234".to_owned(),
            so_pin: "12345678".to_owned(),
            max_retries: 3,
            mechanisms: Mechanism::iter().map(|m| m.mechanism_type()).collect(),
            objects: Vec::new(),
            failed_logins: 0,
            locked: false,
            logged_in: None,
        }
    }

    #[must_use]
    pub const fn present(mut self, present: bool) -> Self {
        self.present = present;
        self
    }

    #[must_use]
    pub const fn login_required(mut self, login_required: bool) -> Self {
        self.login_required = login_required;
        self
    }

    #[must_use]
    pub const fn protected_authentication_path(mut self, enabled: bool) -> Self {
        self.protected_authentication_path = enabled;
        self
    }

    #[must_use]
    pub fn user_pin(mut self, pin: &str) -> Self {
        pin.clone_into(&mut self.user_pin);
        self
    }

    #[must_use]
    pub fn so_pin(mut self, pin: &str) -> Self {
        pin.clone_into(&mut self.so_pin);
        self
    }

    /// Wrong PINs accepted before the token locks
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn mechanisms(mut self, mechanisms: &[Mechanism]) -> Self {
        self.mechanisms = mechanisms.iter().map(Mechanism::mechanism_type).collect();
        self
    }

    #[must_use]
    pub fn object(mut self, object: MockObject) -> Self {
        self.objects.push(object);
        self
    }

    fn visible(&self, object: &MockObject) -> bool {
        !object.private || self.logged_in == Some(CKU_USER)
    }

    fn visible_object(&self, handle: CK_OBJECT_HANDLE) -> Option<&MockObject> {
        self.objects
            .iter()
            .find(|o| o.handle == handle && self.visible(o))
    }

    fn native_info(&self) -> CK_TOKEN_INFO {
        let mut info = CK_TOKEN_INFO::default();
        pad_into(&mut info.label, &self.label);
        pad_into(&mut info.manufacturerID, "Mock");
        pad_into(&mut info.model, "in-memory");
        pad_into(&mut info.serialNumber, &format!("{:016}", self.slot_id));
        info.flags = CKF_TOKEN_INITIALIZED | CKF_RNG;
        if self.login_required {
            info.flags |= CKF_LOGIN_REQUIRED;
        }
        if self.protected_authentication_path {
            info.flags |= CKF_PROTECTED_AUTHENTICATION_PATH;
        }
        if self.locked {
            info.flags |= CKF_USER_PIN_LOCKED;
        }
        info
    }
}

struct MockSession {
    slot_id: CK_SLOT_ID,
    search: Option<VecDeque<CK_OBJECT_HANDLE>>,
    signing: Option<Sha3_256>,
}

#[derive(Default)]
struct MockState {
    initialized: bool,
    tokens: Vec<MockToken>,
    sessions: HashMap<CK_SESSION_HANDLE, MockSession>,
    next_session: CK_SESSION_HANDLE,
    next_object: CK_OBJECT_HANDLE,
    calls: Vec<NativeCall>,
    failures: HashMap<NativeFunction, VecDeque<CK_RV>>,
    latencies: HashMap<NativeFunction, Duration>,
}

impl MockState {
    fn ensure_initialized(&self) -> RvResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(CKR_CRYPTOKI_NOT_INITIALIZED)
        }
    }

    fn token(&self, slot_id: CK_SLOT_ID) -> RvResult<&MockToken> {
        let token = self
            .tokens
            .iter()
            .find(|t| t.slot_id == slot_id)
            .ok_or(CKR_SLOT_ID_INVALID)?;
        if token.present {
            Ok(token)
        } else {
            Err(CKR_TOKEN_NOT_PRESENT)
        }
    }

    fn token_mut(&mut self, slot_id: CK_SLOT_ID) -> RvResult<&mut MockToken> {
        let token = self
            .tokens
            .iter_mut()
            .find(|t| t.slot_id == slot_id)
            .ok_or(CKR_SLOT_ID_INVALID)?;
        if token.present {
            Ok(token)
        } else {
            Err(CKR_TOKEN_NOT_PRESENT)
        }
    }

    fn session_slot(&self, session: CK_SESSION_HANDLE) -> RvResult<CK_SLOT_ID> {
        self.sessions
            .get(&session)
            .map(|s| s.slot_id)
            .ok_or(CKR_SESSION_HANDLE_INVALID)
    }

    fn session_mut(&mut self, session: CK_SESSION_HANDLE) -> RvResult<&mut MockSession> {
        self.sessions
            .get_mut(&session)
            .ok_or(CKR_SESSION_HANDLE_INVALID)
    }

    fn take_signing(&mut self, session: CK_SESSION_HANDLE) -> RvResult<Sha3_256> {
        self.session_mut(session)?
            .signing
            .take()
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)
    }
}

#[derive(Clone, Default)]
pub struct MockModule {
    state: Arc<Mutex<MockState>>,
}

impl MockModule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token; its objects get handles unique across the module
    #[must_use]
    pub fn with_token(self, mut token: MockToken) -> Self {
        {
            let mut state = self.lock();
            for object in &mut token.objects {
                object.handle = FIRST_OBJECT_HANDLE + state.next_object;
                state.next_object += 1;
            }
            state.tokens.push(token);
        }
        self
    }

    /// A boxed handle on the same state, to hand to the gateway
    #[must_use]
    pub fn boxed(&self) -> Box<dyn NativeModule> {
        Box::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call recorded so far
    #[must_use]
    pub fn calls(&self) -> Vec<NativeCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls to `function`
    #[must_use]
    pub fn count(&self, function: NativeFunction) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.function == function)
            .count()
    }

    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make the next call to `function` fail with `rv`
    pub fn fail_next(&self, function: NativeFunction, rv: CK_RV) {
        self.lock()
            .failures
            .entry(function)
            .or_default()
            .push_back(rv);
    }

    /// Make every call to `function` take at least `latency`
    pub fn set_latency(&self, function: NativeFunction, latency: Duration) {
        self.lock().latencies.insert(function, latency);
    }

    /// Pull the token out of its slot, or put it back
    pub fn set_present(&self, slot_id: CK_SLOT_ID, present: bool) {
        if let Some(token) = self.lock().tokens.iter_mut().find(|t| t.slot_id == slot_id) {
            token.present = present;
        }
    }

    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Whether a user is logged in on the token of this slot
    #[must_use]
    pub fn is_logged_in(&self, slot_id: CK_SLOT_ID) -> bool {
        self.lock()
            .tokens
            .iter()
            .any(|t| t.slot_id == slot_id && t.logged_in.is_some())
    }

    /// Record the call, apply the injected latency and failure, and hand back the state
    fn enter(
        &self,
        function: NativeFunction,
        session: Option<CK_SESSION_HANDLE>,
    ) -> RvResult<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls.push(NativeCall { function, session });
        if let Some(latency) = state.latencies.get(&function).copied() {
            drop(state);
            thread::sleep(latency);
            state = self.lock();
        }
        let failure = state
            .failures
            .get_mut(&function)
            .and_then(VecDeque::pop_front);
        if let Some(rv) = failure {
            if function.ends_sign_operation() {
                if let Some(s) = session.and_then(|s| state.sessions.get_mut(&s)) {
                    s.signing = None;
                }
            }
            return Err(rv);
        }
        Ok(state)
    }
}

impl NativeModule for MockModule {
    fn initialize(&self) -> RvResult<()> {
        let mut state = self.enter(NativeFunction::Initialize, None)?;
        if state.initialized {
            return Err(CKR_CRYPTOKI_ALREADY_INITIALIZED);
        }
        state.initialized = true;
        Ok(())
    }

    fn finalize(&self) -> RvResult<()> {
        let mut state = self.enter(NativeFunction::Finalize, None)?;
        state.ensure_initialized()?;
        state.initialized = false;
        state.sessions.clear();
        for token in &mut state.tokens {
            token.logged_in = None;
        }
        Ok(())
    }

    fn info(&self) -> RvResult<CK_INFO> {
        let state = self.enter(NativeFunction::GetInfo, None)?;
        state.ensure_initialized()?;
        let mut info = CK_INFO::default();
        info.cryptokiVersion.major = 2;
        info.cryptokiVersion.minor = 40;
        info.libraryVersion.major = 1;
        pad_into(&mut info.manufacturerID, "Mock");
        pad_into(&mut info.libraryDescription, "In-memory PKCS#11 module");
        Ok(info)
    }

    fn slot_list(&self, token_present: bool) -> RvResult<Vec<CK_SLOT_ID>> {
        let state = self.enter(NativeFunction::GetSlotList, None)?;
        state.ensure_initialized()?;
        Ok(state
            .tokens
            .iter()
            .filter(|t| t.present || !token_present)
            .map(|t| t.slot_id)
            .collect())
    }

    fn token_info(&self, slot: CK_SLOT_ID) -> RvResult<CK_TOKEN_INFO> {
        let state = self.enter(NativeFunction::GetTokenInfo, None)?;
        state.ensure_initialized()?;
        Ok(state.token(slot)?.native_info())
    }

    fn mechanism_list(&self, slot: CK_SLOT_ID) -> RvResult<Vec<CK_MECHANISM_TYPE>> {
        let state = self.enter(NativeFunction::GetMechanismList, None)?;
        state.ensure_initialized()?;
        Ok(state.token(slot)?.mechanisms.clone())
    }

    fn open_session(&self, slot: CK_SLOT_ID, flags: CK_FLAGS) -> RvResult<CK_SESSION_HANDLE> {
        let mut state = self.enter(NativeFunction::OpenSession, None)?;
        state.ensure_initialized()?;
        if flags & CKF_SERIAL_SESSION == 0 {
            return Err(CKR_SESSION_PARALLEL_NOT_SUPPORTED);
        }
        state.token(slot)?;
        state.next_session += 1;
        let handle = state.next_session;
        state.sessions.insert(
            handle,
            MockSession {
                slot_id: slot,
                search: None,
                signing: None,
            },
        );
        Ok(handle)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> RvResult<()> {
        let mut state = self.enter(NativeFunction::CloseSession, Some(session))?;
        state.ensure_initialized()?;
        let closed = state
            .sessions
            .remove(&session)
            .ok_or(CKR_SESSION_HANDLE_INVALID)?;
        // the login state ends with the last session on the token
        if !state.sessions.values().any(|s| s.slot_id == closed.slot_id) {
            if let Some(token) = state.tokens.iter_mut().find(|t| t.slot_id == closed.slot_id) {
                token.logged_in = None;
            }
        }
        Ok(())
    }

    fn login(
        &self,
        session: CK_SESSION_HANDLE,
        user_type: CK_USER_TYPE,
        pin: Option<&[u8]>,
    ) -> RvResult<()> {
        let mut state = self.enter(NativeFunction::Login, Some(session))?;
        state.ensure_initialized()?;
        let slot = state.session_slot(session)?;
        let token = state.token_mut(slot)?;
        if token.locked {
            return Err(CKR_PIN_LOCKED);
        }
        match token.logged_in {
            Some(current) if current == user_type => return Err(CKR_USER_ALREADY_LOGGED_IN),
            Some(_) => return Err(CKR_USER_ANOTHER_ALREADY_LOGGED_IN),
            None => {}
        }
        let expected = if user_type == CKU_SO {
            &token.so_pin
        } else {
            &token.user_pin
        };
        // a null PIN stands for the PIN pad, which always succeeds here
        let accepted = pin.is_none_or(|p| p == expected.as_bytes());
        if accepted {
            token.failed_logins = 0;
            token.logged_in = Some(user_type);
            return Ok(());
        }
        token.failed_logins += 1;
        if token.failed_logins >= token.max_retries {
            token.locked = true;
            Err(CKR_PIN_LOCKED)
        } else {
            Err(CKR_PIN_INCORRECT)
        }
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> RvResult<()> {
        let mut state = self.enter(NativeFunction::Logout, Some(session))?;
        state.ensure_initialized()?;
        let slot = state.session_slot(session)?;
        let token = state.token_mut(slot)?;
        if token.logged_in.take().is_none() {
            return Err(CKR_USER_NOT_LOGGED_IN);
        }
        Ok(())
    }

    fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> RvResult<()> {
        let mut state = self.enter(NativeFunction::FindObjectsInit, Some(session))?;
        state.ensure_initialized()?;
        let slot = state.session_slot(session)?;
        let found = {
            let token = state.token(slot)?;
            token
                .objects
                .iter()
                .filter(|o| token.visible(o) && o.matches(template))
                .map(|o| o.handle)
                .collect::<VecDeque<_>>()
        };
        let mock_session = state.session_mut(session)?;
        if mock_session.search.is_some() {
            return Err(CKR_OPERATION_ACTIVE);
        }
        mock_session.search = Some(found);
        Ok(())
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        max_count: CK_ULONG,
    ) -> RvResult<Vec<CK_OBJECT_HANDLE>> {
        let mut state = self.enter(NativeFunction::FindObjects, Some(session))?;
        state.ensure_initialized()?;
        let search = state
            .session_mut(session)?
            .search
            .as_mut()
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)?;
        let count = usize::try_from(max_count)
            .unwrap_or(usize::MAX)
            .min(search.len());
        Ok(search.drain(..count).collect())
    }

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> RvResult<()> {
        let mut state = self.enter(NativeFunction::FindObjectsFinal, Some(session))?;
        state.ensure_initialized()?;
        state
            .session_mut(session)?
            .search
            .take()
            .map(drop)
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)
    }

    fn attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        kinds: &[CK_ATTRIBUTE_TYPE],
    ) -> RvResult<Vec<Option<Vec<u8>>>> {
        let state = self.enter(NativeFunction::GetAttributeValue, Some(session))?;
        state.ensure_initialized()?;
        let slot = state.session_slot(session)?;
        let object = state
            .token(slot)?
            .visible_object(object)
            .ok_or(CKR_OBJECT_HANDLE_INVALID)?;
        Ok(kinds.iter().map(|kind| object.attribute(*kind)).collect())
    }

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> RvResult<()> {
        let mut state = self.enter(NativeFunction::SignInit, Some(session))?;
        state.ensure_initialized()?;
        let slot = state.session_slot(session)?;
        {
            let token = state.token(slot)?;
            if !token.mechanisms.contains(&mechanism.mechanism_type()) {
                return Err(CKR_MECHANISM_INVALID);
            }
            let Some(object) = token.objects.iter().find(|o| o.handle == key) else {
                return Err(CKR_KEY_HANDLE_INVALID);
            };
            if !token.visible(object) {
                return Err(CKR_USER_NOT_LOGGED_IN);
            }
            if object.class != ObjectClass::PrivateKey || !object.can_sign {
                return Err(CKR_KEY_FUNCTION_NOT_PERMITTED);
            }
            if object.key_type != Some(mechanism.key_type()) {
                return Err(CKR_KEY_TYPE_INCONSISTENT);
            }
        }
        let mock_session = state.session_mut(session)?;
        if mock_session.signing.is_some() {
            return Err(CKR_OPERATION_ACTIVE);
        }
        let mut digest = Sha3_256::new();
        digest.update(key.to_le_bytes());
        digest.update(mechanism.mechanism_type().to_le_bytes());
        mock_session.signing = Some(digest);
        Ok(())
    }

    fn sign_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> RvResult<()> {
        let mut state = self.enter(NativeFunction::SignUpdate, Some(session))?;
        state.ensure_initialized()?;
        state
            .session_mut(session)?
            .signing
            .as_mut()
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)?
            .update(data);
        Ok(())
    }

    fn sign_final(&self, session: CK_SESSION_HANDLE) -> RvResult<Vec<u8>> {
        let mut state = self.enter(NativeFunction::SignFinal, Some(session))?;
        state.ensure_initialized()?;
        Ok(state.take_signing(session)?.finalize().to_vec())
    }

    fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> RvResult<Vec<u8>> {
        let mut state = self.enter(NativeFunction::Sign, Some(session))?;
        state.ensure_initialized()?;
        let mut digest = state.take_signing(session)?;
        digest.update(data);
        Ok(digest.finalize().to_vec())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pkcs11_sys::{
        CKF_SERIAL_SESSION, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DEVICE_ERROR,
        CKR_OPERATION_NOT_INITIALIZED, CKU_USER,
    };

    use super::{MockModule, MockObject, MockToken, NativeFunction};
    use crate::{mechanism::Mechanism, native::NativeModule, types::KeyType};

    #[test]
    fn test_mock_signatures_are_deterministic() {
        let mock = MockModule::new().with_token(
            MockToken::new(1, "t").object(MockObject::private_key("k", KeyType::Rsa)),
        );
        mock.initialize().unwrap();
        let session = mock.open_session(1, CKF_SERIAL_SESSION).unwrap();
        mock.login(session, CKU_USER, Some(b"1234")).unwrap();

        mock.sign_init(session, &Mechanism::Sha256RsaPkcs, 1000).unwrap();
        mock.sign_update(session, b"ab").unwrap();
        mock.sign_update(session, b"cd").unwrap();
        let chunked = mock.sign_final(session).unwrap();

        mock.sign_init(session, &Mechanism::Sha256RsaPkcs, 1000).unwrap();
        assert_eq!(mock.sign(session, b"abcd").unwrap(), chunked);
        assert_eq!(chunked.len(), 32);

        assert_eq!(mock.sign_final(session), Err(CKR_OPERATION_NOT_INITIALIZED));
        mock.finalize().unwrap();
        assert_eq!(mock.slot_list(true), Err(CKR_CRYPTOKI_NOT_INITIALIZED));
    }

    #[test]
    fn test_injected_failure_ends_the_operation() {
        let mock = MockModule::new().with_token(
            MockToken::new(1, "t").object(MockObject::private_key("k", KeyType::Ec)),
        );
        mock.initialize().unwrap();
        let session = mock.open_session(1, CKF_SERIAL_SESSION).unwrap();
        mock.login(session, CKU_USER, None).unwrap();
        mock.sign_init(session, &Mechanism::Ecdsa, 1000).unwrap();
        mock.fail_next(NativeFunction::SignUpdate, CKR_DEVICE_ERROR);
        assert_eq!(mock.sign_update(session, b"x"), Err(CKR_DEVICE_ERROR));
        assert_eq!(mock.sign_update(session, b"x"), Err(CKR_OPERATION_NOT_INITIALIZED));
        assert_eq!(mock.count(NativeFunction::SignUpdate), 2);
        assert_eq!(NativeFunction::SignUpdate.to_string(), "C_SignUpdate");
    }
}
