use pkcs11_client::PError;
use thiserror::Error;

pub type CliResult<R> = Result<R, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Client(#[from] PError),
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    Default(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid options: {0}")]
    Usage(String),
}

impl CliError {
    /// The process exit code reporting this error
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Configuration(_) | Self::Io(_) => 8,
            Self::Default(_) => 1,
            Self::Client(e) => match e {
                PError::TokenNotFound(_) | PError::AmbiguousSelector(_) => 3,
                PError::AuthenticationFailed { .. } | PError::AuthenticationLockedOut { .. } => 4,
                PError::KeyNotFound(_) | PError::AmbiguousKey { .. } => 5,
                PError::MechanismMismatch { .. } | PError::UnsupportedMechanism(_) => 6,
                PError::NativeLoad(_) => 7,
                PError::Configuration(_) | PError::Io(_) => 8,
                _ => 1,
            },
        }
    }
}

/// Construct a CLI error from a string.
#[macro_export]
macro_rules! cli_error {
    ($msg:literal) => {
        $crate::error::CliError::Default(::core::format_args!($msg).to_string())
    };
    ($err:expr $(,)?) => ({
        $crate::error::CliError::Default($err.to_string())
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::CliError::Default(::core::format_args!($fmt, $($arg)*).to_string())
    };
}

/// Return early with an error.
#[macro_export]
macro_rules! cli_bail {
    ($msg:literal) => {
        return ::core::result::Result::Err($crate::cli_error!($msg))
    };
    ($err:expr $(,)?) => {
        return ::core::result::Result::Err($err)
    };
    ($fmt:expr, $($arg:tt)*) => {
        return ::core::result::Result::Err($crate::cli_error!($fmt, $($arg)*))
    };
}
