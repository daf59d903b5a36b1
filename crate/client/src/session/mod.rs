mod catalog;
mod session_impl;
mod sign;

use std::time::Duration;

pub use catalog::{ObjectQuery, ObjectRef};
pub use session_impl::{Session, SessionState};
pub use sign::SignState;

use crate::{
    PError, PResult,
    config::{ClientConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FIND_OBJECTS, MAX_FIND_OBJECTS_LIMIT},
    pkcs11_ensure,
};

/// Per-session tuning, derived from the [`ClientConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// A native call (or a whole sign operation) running past this is fatal to the session
    pub timeout: Option<Duration>,
    /// Size of the chunks fed to `C_SignUpdate`
    pub chunk_size: usize,
    /// Number of handles requested per `C_FindObjects`
    pub max_find_objects: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_find_objects: DEFAULT_MAX_FIND_OBJECTS,
        }
    }
}

impl SessionOptions {
    /// Reject a zero chunk size and a search batch outside `1..=MAX_FIND_OBJECTS_LIMIT`
    pub fn validate(&self) -> PResult<()> {
        self.check_chunk_size()?;
        self.check_max_find_objects()
    }

    pub(crate) fn check_chunk_size(&self) -> PResult<()> {
        pkcs11_ensure!(
            self.chunk_size > 0,
            PError::Configuration("the chunk size must be greater than zero".to_owned())
        );
        Ok(())
    }

    pub(crate) fn check_max_find_objects(&self) -> PResult<()> {
        pkcs11_ensure!(
            (1..=MAX_FIND_OBJECTS_LIMIT).contains(&self.max_find_objects),
            PError::Configuration(format!(
                "max_find_objects must be between 1 and {MAX_FIND_OBJECTS_LIMIT}, got {}",
                self.max_find_objects
            ))
        );
        Ok(())
    }
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            timeout: config.session_timeout(),
            chunk_size: config.chunk_size,
            max_find_objects: config.max_find_objects,
        }
    }
}
