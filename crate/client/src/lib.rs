//! Client side of PKCS#11 (Cryptoki v2.40).
//!
//! Load a vendor module, discover its tokens, open and authenticate sessions, look up
//! keys and certificates, and sign arbitrarily large inputs in bounded memory.
//!
//! [`Client`] is the entry point for most callers. The layers below it
//! ([`Gateway`], [`SessionManager`], [`Session`]) are public for callers that need
//! finer control, such as keeping a session open across several signatures.

#![deny(unsafe_code)]

pub use client::Client;
pub use config::{
    ClientConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FIND_OBJECTS, MAX_FIND_OBJECTS_LIMIT,
};
pub use credential::Credential;
pub use error::{PError, PResult, rv_name};
pub use gateway::{AttributeMap, Gateway};
pub use mechanism::Mechanism;
pub use session::{ObjectQuery, ObjectRef, Session, SessionOptions, SessionState, SignState};
pub use session_manager::{SessionManager, SlotSelector};
pub use signer::{SignatureProvider, TokenSigner};
pub use types::{
    AccessMode, KeyInfo, KeyType, ModuleInfo, ObjectClass, SlotId, TokenInfo, UserKind,
};

mod client;
mod config;
mod credential;
mod error;
mod gateway;
mod mechanism;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod native;
mod session;
mod session_manager;
mod signer;
mod types;

pub mod reexport {
    pub use pkcs11_sys;
}
