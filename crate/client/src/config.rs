use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{PError, PResult, mechanism::Mechanism, pkcs11_ensure, session::SessionOptions};

/// Size of the chunks fed to `C_SignUpdate`
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Number of handles requested per `C_FindObjects` call
pub const DEFAULT_MAX_FIND_OBJECTS: u64 = 64;

/// Upper bound of `max_find_objects`: the handle buffer is allocated up front
pub const MAX_FIND_OBJECTS_LIMIT: u64 = 4096;

/// Configuration of the client.
///
/// ```toml
/// module_path = "/usr/lib/softhsm/libsofthsm2.so"
/// default_mechanism = "sha256-rsa-pkcs"
/// session_timeout_ms = 30000
/// ```
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Location of the PKCS#11 shared library
    pub module_path: PathBuf,
    /// Mechanism used when the caller does not pick one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_mechanism: Option<Mechanism>,
    /// A session whose native calls run past this threshold is abandoned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout_ms: Option<u64>,
    pub chunk_size: usize,
    pub max_find_objects: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            module_path: PathBuf::new(),
            default_mechanism: None,
            session_timeout_ms: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_find_objects: DEFAULT_MAX_FIND_OBJECTS,
        }
    }
}

impl ClientConfig {
    pub fn new(module_path: impl Into<PathBuf>) -> Self {
        Self {
            module_path: module_path.into(),
            ..Self::default()
        }
    }

    /// Load a configuration file. Missing keys take their default value; the result is
    /// validated when the module is initialized.
    pub fn from_toml(path: &Path) -> PResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            PError::Configuration(format!("cannot parse {}: {e}", path.display()))
        })
    }

    pub fn to_toml(&self, path: &Path) -> PResult<()> {
        let content = toml::to_string(self)
            .map_err(|e| PError::Configuration(format!("cannot serialize configuration: {e}")))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> PResult<()> {
        pkcs11_ensure!(
            !self.module_path.as_os_str().is_empty(),
            PError::Configuration("the PKCS#11 module path is not set".to_owned())
        );
        SessionOptions::from(self).validate()
    }

    #[must_use]
    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }
}
