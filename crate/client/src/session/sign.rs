//! Signing Engine
//!
//! The sign operation of a session moves `idle -> initialized -> active -> idle`.
//! `C_SignUpdate` and `C_SignFinal` are refused while idle without reaching the
//! module. A failure at any step ends the operation and leaves the session idle and
//! reusable; nothing is retried.

use std::{
    io::{ErrorKind, Read},
    time::Instant,
};

use pkcs11_sys::CK_OBJECT_HANDLE;
use tracing::{debug, trace, warn};

use super::{ObjectRef, Session};
use crate::{
    PError, PResult,
    mechanism::Mechanism,
    pkcs11_bail, pkcs11_ensure, pkcs11_error,
    types::{KeyType, ObjectClass},
};

/// Observable state of the sign operation of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignState {
    Idle,
    /// `C_SignInit` succeeded, no data yet
    Initialized,
    /// At least one `C_SignUpdate` succeeded
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum SignOperation {
    Idle,
    Initialized {
        mechanism: Mechanism,
        key: CK_OBJECT_HANDLE,
        started: Instant,
    },
    Active {
        mechanism: Mechanism,
        key: CK_OBJECT_HANDLE,
        started: Instant,
        processed: u64,
    },
}

impl SignOperation {
    pub(super) const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub(super) fn describe(&self) -> String {
        match self {
            Self::Idle => "none".to_owned(),
            Self::Initialized { mechanism, key, .. } => {
                format!("sign with {mechanism} and key {key}, initialized")
            }
            Self::Active {
                mechanism,
                key,
                processed,
                ..
            } => format!("sign with {mechanism} and key {key}, {processed} bytes processed"),
        }
    }

    const fn started(&self) -> Option<Instant> {
        match self {
            Self::Idle => None,
            Self::Initialized { started, .. } | Self::Active { started, .. } => Some(*started),
        }
    }
}

/// Fill `buffer` from `reader`, stopping short only at end of stream
fn read_chunk(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let Some(remaining) = buffer.get_mut(filled..) else {
            break;
        };
        match reader.read(remaining) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Session {
    #[must_use]
    pub const fn sign_state(&self) -> SignState {
        match self.operation {
            SignOperation::Idle => SignState::Idle,
            SignOperation::Initialized { .. } => SignState::Initialized,
            SignOperation::Active { .. } => SignState::Active,
        }
    }

    /// Start a sign operation.
    ///
    /// Every check runs before `C_SignInit`: the session must be usable and idle, the
    /// key must come from this session, the mechanism must fit the key type
    /// ([`PError::MechanismMismatch`]) and the token must advertise it
    /// ([`PError::UnsupportedMechanism`]).
    pub fn sign_init(&mut self, key: &mut ObjectRef, mechanism: &Mechanism) -> PResult<()> {
        self.ensure_usable("C_SignInit")?;
        self.ensure_idle()?;
        self.ensure_owned(key, "C_SignInit")?;
        if let Some(class) = key.class() {
            pkcs11_ensure!(
                class == ObjectClass::PrivateKey,
                PError::InvalidHandle {
                    operation: "C_SignInit",
                    reason: format!("object {} is a {class}, not a private key", key.handle()),
                }
            );
        }

        let key_type = self.load_key_type(key)?;
        let is_custom = matches!(mechanism, Mechanism::Custom { .. });
        if key_type != Some(mechanism.key_type()) && !(is_custom && key_type.is_none()) {
            pkcs11_bail!(PError::MechanismMismatch {
                mechanism: mechanism.to_string(),
                key_type: key_type.map_or_else(|| "unknown".to_owned(), |k: KeyType| k.to_string()),
            });
        }

        let mechanism_type = mechanism.mechanism_type();
        pkcs11_ensure!(
            self.mechanisms()?.contains(&mechanism_type),
            PError::UnsupportedMechanism(mechanism.to_string())
        );

        let started = Instant::now();
        let result = self
            .gateway()
            .sign_init(self.handle(), mechanism, key.handle());
        self.finish(started, "C_SignInit", result)?;
        debug!(
            "session {}: sign operation initialized with {mechanism} and key {}",
            self.handle(),
            key.handle()
        );
        self.operation = SignOperation::Initialized {
            mechanism: mechanism.clone(),
            key: key.handle(),
            started,
        };
        Ok(())
    }

    /// Feed a chunk of data to the active sign operation
    pub fn sign_update(&mut self, data: &[u8]) -> PResult<()> {
        self.ensure_usable("C_SignUpdate")?;
        let Some(started) = self.operation.started() else {
            return Err(PError::InvalidHandle {
                operation: "C_SignUpdate",
                reason: format!("no sign operation was initialized on session {}", self.handle()),
            });
        };
        let result = self.gateway().sign_update(self.handle(), data);
        if result.is_err() {
            // the module ends the operation on any C_SignUpdate error
            self.operation = SignOperation::Idle;
        }
        self.finish(started, "C_SignUpdate", result)?;
        trace!("session {}: signed {} more bytes", self.handle(), data.len());
        let operation = std::mem::replace(&mut self.operation, SignOperation::Idle);
        self.operation = match operation {
            SignOperation::Initialized {
                mechanism, key, ..
            } => SignOperation::Active {
                mechanism,
                key,
                started,
                processed: data.len() as u64,
            },
            SignOperation::Active {
                mechanism,
                key,
                processed,
                ..
            } => SignOperation::Active {
                mechanism,
                key,
                started,
                processed: processed + data.len() as u64,
            },
            SignOperation::Idle => SignOperation::Idle,
        };
        Ok(())
    }

    /// Complete the active sign operation and return the signature
    pub fn sign_final(&mut self) -> PResult<Vec<u8>> {
        self.ensure_usable("C_SignFinal")?;
        let Some(started) = self.operation.started() else {
            return Err(PError::InvalidHandle {
                operation: "C_SignFinal",
                reason: format!("no sign operation was initialized on session {}", self.handle()),
            });
        };
        let result = self.gateway().sign_final(self.handle());
        self.operation = SignOperation::Idle;
        let signature = self.finish(started, "C_SignFinal", result)?;
        debug!(
            "session {}: produced a {} bytes signature",
            self.handle(),
            signature.len()
        );
        Ok(signature)
    }

    /// Abort the sign operation, if any. The session is idle afterwards.
    pub fn abort_sign(&mut self) -> PResult<()> {
        self.ensure_usable("C_SignFinal")?;
        if self.operation.is_idle() {
            return Ok(());
        }
        self.operation = SignOperation::Idle;
        if let Err(e) = self.gateway().abort_sign(self.handle()) {
            warn!("session {}: aborting the sign operation failed: {e}", self.handle());
        }
        Ok(())
    }

    /// Sign a stream, fed to the module in chunks of the configured size
    pub fn sign(
        &mut self,
        key: &mut ObjectRef,
        mechanism: &Mechanism,
        mut data: impl Read,
    ) -> PResult<Vec<u8>> {
        self.options.check_chunk_size()?;
        self.sign_init(key, mechanism)?;
        let mut buffer = vec![0_u8; self.options.chunk_size];
        loop {
            let read = match read_chunk(&mut data, &mut buffer) {
                Ok(read) => read,
                Err(e) => {
                    self.abort_sign()?;
                    return Err(PError::Io(e));
                }
            };
            if read == 0 {
                break;
            }
            let chunk = buffer
                .get(..read)
                .ok_or_else(|| pkcs11_error!("read {read} bytes into a smaller buffer"))?;
            self.sign_update(chunk)?;
            if read < buffer.len() {
                break;
            }
        }
        self.sign_final()
    }

    /// Sign a buffer with a single `C_Sign` call
    pub fn sign_once(
        &mut self,
        key: &mut ObjectRef,
        mechanism: &Mechanism,
        data: &[u8],
    ) -> PResult<Vec<u8>> {
        self.sign_init(key, mechanism)?;
        let started = self.operation.started().unwrap_or_else(Instant::now);
        let result = self.gateway().sign(self.handle(), data);
        self.operation = SignOperation::Idle;
        self.finish(started, "C_Sign", result)
    }
}
