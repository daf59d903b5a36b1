use pkcs11_client::PError;
use thiserror::Error;

pub type ContainerResult<R> = Result<R, ContainerError>;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("the document is already signed")]
    AlreadySigned,
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
    #[error("malformed signature placeholder: {0}")]
    MalformedPlaceholder(String),
    #[error("no signature placeholder after marker '{0}'")]
    PlaceholderNotFound(String),
    #[error("a {needed} bytes signature does not fit a {capacity} bytes placeholder")]
    PlaceholderTooSmall { needed: usize, capacity: usize },
    #[error(transparent)]
    Signing(#[from] PError),
}
