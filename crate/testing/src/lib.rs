//! A signing container in the style of PDF signatures, driven by a PKCS#11 token.
//!
//! A document carries a hex placeholder reserved for its signature. The container
//! signs every byte outside the placeholder through a
//! [`SignatureProvider`](pkcs11_client::SignatureProvider) and writes the hex encoded
//! signature into the placeholder. It knows nothing of the document format beyond the
//! placeholder.

pub use container::{ByteRange, PLACEHOLDER_DIGIT, SignatureContainer};
pub use error::{ContainerError, ContainerResult};

mod container;
mod error;
