//! Error types for the sync engine.

use thiserror::Error;
use tillsync_core::CoreError;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by the engine to its caller.
///
/// Remote failures are never among them: once a write is committed locally
/// it has succeeded, and delivery problems surface through
/// [`crate::SyncStatus`] and per-entry state.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local persistence failed; the triggering write was not committed.
    #[error("storage error: {0}")]
    Storage(#[from] CoreError),

    /// A payload could not be serialized to JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation needs a Tokio runtime and none is running.
    #[error("no Tokio runtime available")]
    NoRuntime,

    /// The scheduler is already running.
    #[error("scheduler already started")]
    AlreadyStarted,

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl SyncError {
    /// Returns true when the error came from the disk running out of space.
    #[must_use]
    pub fn is_storage_full(&self) -> bool {
        matches!(self, SyncError::Storage(e) if e.is_storage_full())
    }
}

/// Classification of a failed remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or server-side failure; retried with backoff.
    #[error("transient remote error: {message}")]
    Transient {
        /// Error message.
        message: String,
    },

    /// The remote rejected the mutation; never retried automatically.
    #[error("permanent remote error: {message}")]
    Permanent {
        /// Error message.
        message: String,
    },

    /// Credentials were refused. Not the entry's fault.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Error message.
        message: String,
    },
}

impl RemoteError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Creates an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// The error a call gets when it exceeds the request timeout.
    #[must_use]
    pub fn timed_out(after: std::time::Duration) -> Self {
        Self::transient(format!("request timed out after {after:?}"))
    }

    /// Classifies an HTTP status code.
    ///
    /// 408, 425, 429 and 5xx are transient; 401 and 403 are unauthorized;
    /// any other status is permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = format!("{status}: {}", message.into());
        match status {
            401 | 403 => Self::Unauthorized { message },
            408 | 425 | 429 | 500..=599 => Self::Transient { message },
            _ => Self::Permanent { message },
        }
    }

    /// Returns true for errors worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    /// Returns true for rejections.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, RemoteError::Permanent { .. })
    }

    /// Returns true for refused credentials.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Unauthorized { .. })
    }
}
