//! Error types for backend operations.

use std::io;
use thiserror::Error;

/// Result type for backend operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system refused the operation (disk full, permissions, ...).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read asked for bytes the backend does not hold.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Current backend size.
        size: u64,
    },

    /// A truncate asked to grow the backend.
    #[error("cannot truncate to {requested} bytes, backend holds {size}")]
    TruncateBeyondEnd {
        /// Requested size.
        requested: u64,
        /// Current backend size.
        size: u64,
    },
}

impl StorageError {
    /// Returns true when the failure came from the disk running out of space.
    #[must_use]
    pub fn is_storage_full(&self) -> bool {
        match self {
            // ENOSPC on unix, ERROR_DISK_FULL on windows
            StorageError::Io(e) => matches!(e.raw_os_error(), Some(28) | Some(112)),
            _ => false,
        }
    }
}
