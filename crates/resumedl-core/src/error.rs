//! Error types for resumedl core

use resumedl_types::InterruptReason;
use thiserror::Error;

/// Errors that can occur in resumedl core
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download not found: {0}")]
    NotFound(u32),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Download interrupted: {0}")]
    Interrupted(#[from] InterruptReason),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("The download manager has shut down")]
    ManagerClosed,
}

impl EngineError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Network(e) => e.is_timeout() || e.is_connect(),
            EngineError::ServerError { status, .. } => *status >= 500,
            EngineError::Interrupted(reason) => matches!(
                reason,
                InterruptReason::NetworkTimeout
                    | InterruptReason::NetworkFailed
                    | InterruptReason::NetworkDisconnected
                    | InterruptReason::FileTransientError
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization(error.to_string())
    }
}

/// Map a filesystem error onto the interrupt taxonomy.
pub fn interrupt_reason_from_io(error: &std::io::Error) -> InterruptReason {
    use std::io::ErrorKind;

    if let Some(reason) = error.raw_os_error().and_then(reason_from_errno) {
        return reason;
    }

    match error.kind() {
        ErrorKind::PermissionDenied => InterruptReason::FileAccessDenied,
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            InterruptReason::FileTransientError
        }
        _ => InterruptReason::FileFailed,
    }
}

#[cfg(target_os = "linux")]
const ENAMETOOLONG: i32 = 36;
#[cfg(all(unix, not(target_os = "linux")))]
const ENAMETOOLONG: i32 = 63;

// errno values shared by Linux and the BSDs.
#[cfg(unix)]
fn reason_from_errno(code: i32) -> Option<InterruptReason> {
    match code {
        1 | 13 | 30 => Some(InterruptReason::FileAccessDenied), // EPERM, EACCES, EROFS
        28 => Some(InterruptReason::FileNoSpace),
        27 => Some(InterruptReason::FileTooLarge),
        11 | 16 | 26 => Some(InterruptReason::FileTransientError), // EAGAIN, EBUSY, ETXTBSY
        ENAMETOOLONG => Some(InterruptReason::FileNameTooLong),
        _ => None,
    }
}

#[cfg(not(unix))]
fn reason_from_errno(_code: i32) -> Option<InterruptReason> {
    None
}

/// Map a transport error onto the interrupt taxonomy.
pub fn interrupt_reason_from_reqwest(error: &reqwest::Error) -> InterruptReason {
    if error.is_timeout() {
        InterruptReason::NetworkTimeout
    } else if error.is_connect() {
        InterruptReason::ServerUnreachable
    } else if let Some(status) = error.status() {
        InterruptReason::from_http_status(status.as_u16()).unwrap_or(InterruptReason::ServerFailed)
    } else if error.is_body() || error.is_decode() {
        InterruptReason::NetworkDisconnected
    } else if error.is_builder() || error.is_request() {
        InterruptReason::NetworkInvalidRequest
    } else {
        InterruptReason::NetworkFailed
    }
}
