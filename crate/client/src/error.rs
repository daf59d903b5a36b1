use pkcs11_sys::{
    CK_RV, CK_SESSION_HANDLE, CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_SENSITIVE,
    CKR_ATTRIBUTE_TYPE_INVALID, CKR_BUFFER_TOO_SMALL, CKR_CRYPTOKI_ALREADY_INITIALIZED,
    CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DEVICE_ERROR, CKR_DEVICE_REMOVED, CKR_FUNCTION_FAILED,
    CKR_FUNCTION_NOT_SUPPORTED, CKR_GENERAL_ERROR, CKR_HOST_MEMORY, CKR_KEY_FUNCTION_NOT_PERMITTED,
    CKR_KEY_HANDLE_INVALID, CKR_KEY_TYPE_INCONSISTENT, CKR_MECHANISM_INVALID,
    CKR_MECHANISM_PARAM_INVALID, CKR_OBJECT_HANDLE_INVALID, CKR_OK, CKR_OPERATION_ACTIVE,
    CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_EXPIRED, CKR_PIN_INCORRECT, CKR_PIN_INVALID,
    CKR_PIN_LEN_RANGE, CKR_PIN_LOCKED, CKR_SESSION_CLOSED, CKR_SESSION_HANDLE_INVALID,
    CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_PRESENT, CKR_TOKEN_NOT_RECOGNIZED,
    CKR_USER_ALREADY_LOGGED_IN, CKR_USER_ANOTHER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN,
    CKR_USER_PIN_NOT_INITIALIZED,
};
use thiserror::Error;

pub type PResult<T> = Result<T, PError>;

#[derive(Error, Debug)]
pub enum PError {
    #[error("Error loading the PKCS#11 module: {0}")]
    NativeLoad(String),

    #[error("The PKCS#11 module is already initialized in this process")]
    AlreadyInitialized,

    #[error("The PKCS#11 module is not initialized")]
    NotInitialized,

    #[error("Token not found: {0}")]
    TokenNotFound(String),

    #[error("Ambiguous token selector: {0}")]
    AmbiguousSelector(String),

    #[error("Invalid handle in {operation}: {reason}")]
    InvalidHandle {
        operation: &'static str,
        reason: String,
    },

    #[error("Authentication failed on session {session}: {reason}")]
    AuthenticationFailed {
        session: CK_SESSION_HANDLE,
        reason: String,
    },

    #[error("Authentication locked out on session {session}: the token reports a locked PIN")]
    AuthenticationLockedOut { session: CK_SESSION_HANDLE },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Ambiguous key: {count} objects match '{label}'")]
    AmbiguousKey { label: String, count: usize },

    #[error("Mechanism {mechanism} cannot be used with a {key_type} key")]
    MechanismMismatch { mechanism: String, key_type: String },

    #[error("Mechanism {0} is not supported by the token")]
    UnsupportedMechanism(String),

    #[error(
        "Session {session} exceeded its timeout of {timeout_ms} ms in {operation}; the session is \
         abandoned"
    )]
    SessionTimeout {
        session: CK_SESSION_HANDLE,
        operation: &'static str,
        timeout_ms: u128,
    },

    #[error("An operation is already active on session {session}: {operation}")]
    OperationActive {
        session: CK_SESSION_HANDLE,
        operation: String,
    },

    #[error("{operation} failed{}: {} (0x{code:08X})", session_suffix(*.session), rv_name(*.code))]
    Native {
        operation: &'static str,
        session: Option<CK_SESSION_HANDLE>,
        code: CK_RV,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Default(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn session_suffix(session: Option<CK_SESSION_HANDLE>) -> String {
    session.map(|s| format!(" on session {s}")).unwrap_or_default()
}

impl From<libloading::Error> for PError {
    fn from(e: libloading::Error) -> Self {
        Self::NativeLoad(e.to_string())
    }
}

impl PError {
    /// Translate a native status code into the error taxonomy.
    ///
    /// `operation` is the name of the native function that returned `rv`.
    #[must_use]
    pub fn from_rv(operation: &'static str, session: Option<CK_SESSION_HANDLE>, rv: CK_RV) -> Self {
        let session_id = session.unwrap_or_default();
        match rv {
            CKR_CRYPTOKI_ALREADY_INITIALIZED => Self::AlreadyInitialized,
            CKR_CRYPTOKI_NOT_INITIALIZED => Self::NotInitialized,
            CKR_SESSION_HANDLE_INVALID
            | CKR_SESSION_CLOSED
            | CKR_OBJECT_HANDLE_INVALID
            | CKR_KEY_HANDLE_INVALID
            | CKR_OPERATION_NOT_INITIALIZED => Self::InvalidHandle {
                operation,
                reason: format!("the module returned {}", rv_name(rv)),
            },
            CKR_PIN_INCORRECT | CKR_PIN_INVALID | CKR_PIN_LEN_RANGE | CKR_PIN_EXPIRED => {
                Self::AuthenticationFailed {
                    session: session_id,
                    reason: rv_name(rv).to_owned(),
                }
            }
            CKR_PIN_LOCKED => Self::AuthenticationLockedOut {
                session: session_id,
            },
            CKR_TOKEN_NOT_PRESENT | CKR_TOKEN_NOT_RECOGNIZED | CKR_SLOT_ID_INVALID => {
                Self::TokenNotFound(format!("{operation} returned {}", rv_name(rv)))
            }
            CKR_KEY_TYPE_INCONSISTENT => Self::MechanismMismatch {
                mechanism: format!("used in {operation}"),
                key_type: "incompatible".to_owned(),
            },
            CKR_MECHANISM_INVALID => {
                Self::UnsupportedMechanism(format!("rejected by {operation}"))
            }
            code => Self::Native {
                operation,
                session,
                code,
            },
        }
    }

    /// The raw native status code, when this error comes straight from the module
    #[must_use]
    pub const fn native_code(&self) -> Option<CK_RV> {
        match self {
            Self::Native { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Symbolic name of a native status code, for diagnostics
#[must_use]
pub const fn rv_name(rv: CK_RV) -> &'static str {
    match rv {
        CKR_OK => "CKR_OK",
        CKR_HOST_MEMORY => "CKR_HOST_MEMORY",
        CKR_SLOT_ID_INVALID => "CKR_SLOT_ID_INVALID",
        CKR_GENERAL_ERROR => "CKR_GENERAL_ERROR",
        CKR_FUNCTION_FAILED => "CKR_FUNCTION_FAILED",
        CKR_ARGUMENTS_BAD => "CKR_ARGUMENTS_BAD",
        CKR_ATTRIBUTE_SENSITIVE => "CKR_ATTRIBUTE_SENSITIVE",
        CKR_ATTRIBUTE_TYPE_INVALID => "CKR_ATTRIBUTE_TYPE_INVALID",
        CKR_DEVICE_ERROR => "CKR_DEVICE_ERROR",
        CKR_DEVICE_REMOVED => "CKR_DEVICE_REMOVED",
        CKR_FUNCTION_NOT_SUPPORTED => "CKR_FUNCTION_NOT_SUPPORTED",
        CKR_KEY_HANDLE_INVALID => "CKR_KEY_HANDLE_INVALID",
        CKR_KEY_TYPE_INCONSISTENT => "CKR_KEY_TYPE_INCONSISTENT",
        CKR_KEY_FUNCTION_NOT_PERMITTED => "CKR_KEY_FUNCTION_NOT_PERMITTED",
        CKR_MECHANISM_INVALID => "CKR_MECHANISM_INVALID",
        CKR_MECHANISM_PARAM_INVALID => "CKR_MECHANISM_PARAM_INVALID",
        CKR_OBJECT_HANDLE_INVALID => "CKR_OBJECT_HANDLE_INVALID",
        CKR_OPERATION_ACTIVE => "CKR_OPERATION_ACTIVE",
        CKR_OPERATION_NOT_INITIALIZED => "CKR_OPERATION_NOT_INITIALIZED",
        CKR_PIN_INCORRECT => "CKR_PIN_INCORRECT",
        CKR_PIN_INVALID => "CKR_PIN_INVALID",
        CKR_PIN_LEN_RANGE => "CKR_PIN_LEN_RANGE",
        CKR_PIN_EXPIRED => "CKR_PIN_EXPIRED",
        CKR_PIN_LOCKED => "CKR_PIN_LOCKED",
        CKR_SESSION_CLOSED => "CKR_SESSION_CLOSED",
        CKR_SESSION_HANDLE_INVALID => "CKR_SESSION_HANDLE_INVALID",
        CKR_TOKEN_NOT_PRESENT => "CKR_TOKEN_NOT_PRESENT",
        CKR_TOKEN_NOT_RECOGNIZED => "CKR_TOKEN_NOT_RECOGNIZED",
        CKR_USER_ALREADY_LOGGED_IN => "CKR_USER_ALREADY_LOGGED_IN",
        CKR_USER_NOT_LOGGED_IN => "CKR_USER_NOT_LOGGED_IN",
        CKR_USER_PIN_NOT_INITIALIZED => "CKR_USER_PIN_NOT_INITIALIZED",
        CKR_USER_ANOTHER_ALREADY_LOGGED_IN => "CKR_USER_ANOTHER_ALREADY_LOGGED_IN",
        CKR_BUFFER_TOO_SMALL => "CKR_BUFFER_TOO_SMALL",
        CKR_CRYPTOKI_NOT_INITIALIZED => "CKR_CRYPTOKI_NOT_INITIALIZED",
        CKR_CRYPTOKI_ALREADY_INITIALIZED => "CKR_CRYPTOKI_ALREADY_INITIALIZED",
        _ => "unclassified status",
    }
}

/// Construct a `PError::Default` from a string.
#[macro_export]
macro_rules! pkcs11_error {
    ($msg:literal) => {
        $crate::PError::Default(::core::format_args!($msg).to_string())
    };
    ($err:expr $(,)?) => ({
        $crate::PError::Default($err.to_string())
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::PError::Default(::core::format_args!($fmt, $($arg)*).to_string())
    };
}

/// Return early with an error.
#[macro_export]
macro_rules! pkcs11_bail {
    ($msg:literal) => {
        return ::core::result::Result::Err($crate::pkcs11_error!($msg))
    };
    ($err:expr $(,)?) => {
        return ::core::result::Result::Err($err)
    };
    ($fmt:expr, $($arg:tt)*) => {
        return ::core::result::Result::Err($crate::pkcs11_error!($fmt, $($arg)*))
    };
}

/// Return early with an error if a condition is not satisfied.
#[macro_export]
macro_rules! pkcs11_ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err($crate::pkcs11_error!($msg));
        }
    };
    ($cond:expr, $err:expr $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err($err);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !$cond {
            return ::core::result::Result::Err($crate::pkcs11_error!($fmt, $($arg)*));
        }
    };
}
