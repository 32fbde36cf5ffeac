use std::fmt;

/// The canonical error taxonomy shared by the runtime CLI and the shim's
/// ttrpc handlers, so that both surfaces report failures the same way.
#[derive(Debug)]
pub enum RunjError {
    InvalidArgument(String),
    AlreadyExists(String),
    NotFound(String),
    FailedPrecondition(String),
    Syscall(String),
    Io(std::io::Error),
    Timeout(String),
    Internal(String),
}

impl fmt::Display for RunjError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunjError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            RunjError::AlreadyExists(msg) => write!(f, "already exists: {}", msg),
            RunjError::NotFound(msg) => write!(f, "not found: {}", msg),
            RunjError::FailedPrecondition(msg) => write!(f, "failed precondition: {}", msg),
            RunjError::Syscall(msg) => write!(f, "syscall failed: {}", msg),
            RunjError::Io(err) => write!(f, "io error: {}", err),
            RunjError::Timeout(msg) => write!(f, "timed out: {}", msg),
            RunjError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for RunjError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunjError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RunjError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => RunjError::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => RunjError::AlreadyExists(err.to_string()),
            _ => RunjError::Io(err),
        }
    }
}

impl From<serde_json::Error> for RunjError {
    fn from(err: serde_json::Error) -> Self {
        RunjError::Internal(err.to_string())
    }
}
