//! Native Module Gateway
//!
//! The only owner of the loaded PKCS#11 module. One gateway may be initialized per
//! process at a time: [`Gateway::initialize`] takes a process-wide lock that
//! [`Gateway::finalize`] (or dropping the gateway) releases.
//!
//! Every entry point checks that the module is still initialized, and every session
//! entry point checks that the handle was opened through this gateway and not closed
//! since, before anything reaches the module.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_ULONG,
    CKF_RW_SESSION, CKF_SERIAL_SESSION,
};
use tracing::{debug, info, trace, warn};

use crate::{
    PError, PResult,
    config::ClientConfig,
    pkcs11_error,
    mechanism::Mechanism,
    native::{Attribute, NativeModule, Pkcs11Library},
    types::{AccessMode, ModuleInfo, SlotId, TokenInfo, UserKind},
};

/// Name of the module currently initialized in this process, if any
static MODULE_LOCK: Mutex<Option<String>> = Mutex::new(None);

/// Attribute values keyed by attribute type; unreadable attributes are absent
pub type AttributeMap = HashMap<CK_ATTRIBUTE_TYPE, Vec<u8>>;

pub struct Gateway {
    module: Box<dyn NativeModule>,
    name: String,
    initialized: AtomicBool,
    sessions: Mutex<HashSet<CK_SESSION_HANDLE>>,
}

impl Gateway {
    /// Load the module named in the configuration and initialize it.
    ///
    /// Fails with [`PError::AlreadyInitialized`] if a gateway is already initialized
    /// in this process, without touching the file system.
    pub fn initialize(config: &ClientConfig) -> PResult<Arc<Self>> {
        config.validate()?;
        let mut lock = lock_module()?;
        if let Some(current) = lock.as_ref() {
            debug!("module {current} is already initialized");
            return Err(PError::AlreadyInitialized);
        }
        let name = config.module_path.display().to_string();
        info!("loading PKCS#11 module {name}");
        let library = Pkcs11Library::load(&config.module_path)?;
        Self::initialize_locked(&mut lock, Box::new(library), name)
    }

    /// Initialize an already loaded module implementation
    pub fn initialize_with(module: Box<dyn NativeModule>, name: &str) -> PResult<Arc<Self>> {
        let mut lock = lock_module()?;
        if lock.is_some() {
            return Err(PError::AlreadyInitialized);
        }
        Self::initialize_locked(&mut lock, module, name.to_owned())
    }

    fn initialize_locked(
        lock: &mut Option<String>,
        module: Box<dyn NativeModule>,
        name: String,
    ) -> PResult<Arc<Self>> {
        module
            .initialize()
            .map_err(|rv| PError::from_rv("C_Initialize", None, rv))?;
        info!("PKCS#11 module {name} initialized");
        *lock = Some(name.clone());
        Ok(Arc::new(Self {
            module,
            name,
            initialized: AtomicBool::new(true),
            sessions: Mutex::new(HashSet::new()),
        }))
    }

    /// Finalize the module and release the process-wide lock.
    ///
    /// Every session opened through this gateway becomes invalid. Further calls fail
    /// with [`PError::NotInitialized`].
    ///
    /// The lock serializes initialization and finalization only; native calls already
    /// running on other threads are not waited for. `C_Finalize` must not be called
    /// while other calls are in flight, so callers finalize once their sessions are done.
    pub fn finalize(&self) -> PResult<()> {
        let mut lock = lock_module()?;
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Err(PError::NotInitialized);
        }
        self.sessions
            .lock()
            .map_err(|e| pkcs11_error!("Failed to acquire the sessions lock: {e}"))?
            .clear();
        *lock = None;
        self.module
            .finalize()
            .map_err(|rv| PError::from_rv("C_Finalize", None, rv))?;
        info!("PKCS#11 module {} finalized", self.name);
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_initialized(&self) -> PResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(PError::NotInitialized)
        }
    }

    fn ensure_session(&self, session: CK_SESSION_HANDLE, operation: &'static str) -> PResult<()> {
        self.ensure_initialized()?;
        let sessions = self
            .sessions
            .lock()
            .map_err(|e| pkcs11_error!("Failed to acquire the sessions lock: {e}"))?;
        if sessions.contains(&session) {
            Ok(())
        } else {
            Err(PError::InvalidHandle {
                operation,
                reason: format!("session {session} is not open"),
            })
        }
    }

    pub fn info(&self) -> PResult<ModuleInfo> {
        self.ensure_initialized()?;
        let info = self
            .module
            .info()
            .map_err(|rv| PError::from_rv("C_GetInfo", None, rv))?;
        Ok(info.into())
    }

    /// Slot identifiers in native enumeration order
    pub fn list_slots(&self, token_present: bool) -> PResult<Vec<SlotId>> {
        self.ensure_initialized()?;
        let slots = self
            .module
            .slot_list(token_present)
            .map_err(|rv| PError::from_rv("C_GetSlotList", None, rv))?;
        trace!("C_GetSlotList returned {} slots", slots.len());
        Ok(slots)
    }

    pub fn token_info(&self, slot: SlotId) -> PResult<TokenInfo> {
        self.ensure_initialized()?;
        let info = self
            .module
            .token_info(slot)
            .map_err(|rv| PError::from_rv("C_GetTokenInfo", None, rv))?;
        Ok(TokenInfo::from_native(slot, &info))
    }

    pub fn mechanism_list(&self, slot: SlotId) -> PResult<Vec<CK_MECHANISM_TYPE>> {
        self.ensure_initialized()?;
        self.module
            .mechanism_list(slot)
            .map_err(|rv| PError::from_rv("C_GetMechanismList", None, rv))
    }

    pub fn open_session(&self, slot: SlotId, mode: AccessMode) -> PResult<CK_SESSION_HANDLE> {
        self.ensure_initialized()?;
        let flags: CK_FLAGS = match mode {
            AccessMode::ReadOnly => CKF_SERIAL_SESSION,
            AccessMode::ReadWrite => CKF_RW_SESSION | CKF_SERIAL_SESSION,
        };
        let session = self
            .module
            .open_session(slot, flags)
            .map_err(|rv| PError::from_rv("C_OpenSession", None, rv))?;
        self.sessions
            .lock()
            .map_err(|e| pkcs11_error!("Failed to acquire the sessions lock: {e}"))?
            .insert(session);
        debug!("opened session {session} on slot {slot} ({mode:?})");
        Ok(session)
    }

    /// Close a session. The handle is forgotten even if the module reports an error.
    pub fn close_session(&self, session: CK_SESSION_HANDLE) -> PResult<()> {
        self.ensure_session(session, "C_CloseSession")?;
        self.sessions
            .lock()
            .map_err(|e| pkcs11_error!("Failed to acquire the sessions lock: {e}"))?
            .remove(&session);
        self.module
            .close_session(session)
            .map_err(|rv| PError::from_rv("C_CloseSession", Some(session), rv))?;
        debug!("closed session {session}");
        Ok(())
    }

    pub fn login(
        &self,
        session: CK_SESSION_HANDLE,
        user: UserKind,
        pin: Option<&[u8]>,
    ) -> PResult<()> {
        self.ensure_session(session, "C_Login")?;
        self.module
            .login(session, user.ck_user_type(), pin)
            .map_err(|rv| PError::from_rv("C_Login", Some(session), rv))
    }

    pub fn logout(&self, session: CK_SESSION_HANDLE) -> PResult<()> {
        self.ensure_session(session, "C_Logout")?;
        self.module
            .logout(session)
            .map_err(|rv| PError::from_rv("C_Logout", Some(session), rv))
    }

    /// Run a complete search: `C_FindObjectsInit`, `C_FindObjects` until exhausted,
    /// `C_FindObjectsFinal`.
    pub fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
        batch_size: u64,
    ) -> PResult<Vec<CK_OBJECT_HANDLE>> {
        self.ensure_session(session, "C_FindObjectsInit")?;
        // CK_ULONG is 32 bits wide on some platforms
        let batch_size = CK_ULONG::try_from(batch_size).unwrap_or(CK_ULONG::MAX);
        self.module
            .find_objects_init(session, template)
            .map_err(|rv| PError::from_rv("C_FindObjectsInit", Some(session), rv))?;

        let mut handles = Vec::new();
        loop {
            match self.module.find_objects(session, batch_size) {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => {
                    trace!("found {} objects", batch.len());
                    handles.extend(batch);
                }
                Err(rv) => {
                    if let Err(final_rv) = self.module.find_objects_final(session) {
                        warn!("C_FindObjectsFinal failed after a search error: {final_rv:#x}");
                    }
                    return Err(PError::from_rv("C_FindObjects", Some(session), rv));
                }
            }
        }
        self.module
            .find_objects_final(session)
            .map_err(|rv| PError::from_rv("C_FindObjectsFinal", Some(session), rv))?;
        Ok(handles)
    }

    pub fn attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        kinds: &[CK_ATTRIBUTE_TYPE],
    ) -> PResult<AttributeMap> {
        self.ensure_session(session, "C_GetAttributeValue")?;
        let values = self
            .module
            .attribute_values(session, object, kinds)
            .map_err(|rv| PError::from_rv("C_GetAttributeValue", Some(session), rv))?;
        Ok(kinds
            .iter()
            .zip(values)
            .filter_map(|(kind, value)| value.map(|v| (*kind, v)))
            .collect())
    }

    pub fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> PResult<()> {
        self.ensure_session(session, "C_SignInit")?;
        self.module
            .sign_init(session, mechanism, key)
            .map_err(|rv| PError::from_rv("C_SignInit", Some(session), rv))
    }

    pub fn sign_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> PResult<()> {
        self.ensure_session(session, "C_SignUpdate")?;
        self.module
            .sign_update(session, data)
            .map_err(|rv| PError::from_rv("C_SignUpdate", Some(session), rv))
    }

    pub fn sign_final(&self, session: CK_SESSION_HANDLE) -> PResult<Vec<u8>> {
        self.ensure_session(session, "C_SignFinal")?;
        self.module
            .sign_final(session)
            .map_err(|rv| PError::from_rv("C_SignFinal", Some(session), rv))
    }

    pub fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> PResult<Vec<u8>> {
        self.ensure_session(session, "C_Sign")?;
        self.module
            .sign(session, data)
            .map_err(|rv| PError::from_rv("C_Sign", Some(session), rv))
    }

    pub fn abort_sign(&self, session: CK_SESSION_HANDLE) -> PResult<()> {
        self.ensure_session(session, "C_SignFinal")?;
        self.module
            .abort_sign(session)
            .map_err(|rv| PError::from_rv("C_SignFinal", Some(session), rv))
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if self.is_initialized() {
            if let Err(e) = self.finalize() {
                warn!("failed to finalize the PKCS#11 module {}: {e}", self.name);
            }
        }
    }
}

fn lock_module() -> PResult<std::sync::MutexGuard<'static, Option<String>>> {
    MODULE_LOCK
        .lock()
        .map_err(|e| pkcs11_error!("Failed to acquire the module lock: {e}"))
}
