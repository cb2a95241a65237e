//! Error types for local persistence.

use crate::types::{EntryId, EntryState};
use std::io;
use thiserror::Error;

/// Result type for local persistence operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the local store, the mutation queue and the data
/// directory.
///
/// Any of these returned from a write or delete means the change was
/// **not** committed locally.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A storage backend failed (disk full, permissions, ...).
    #[error("storage error: {0}")]
    Storage(#[from] tillsync_storage::StorageError),

    /// Filesystem error outside a backend (directory, rename, lock file).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A persisted body could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// What went wrong.
        message: String,
    },

    /// A log contains bytes that are not a valid frame.
    #[error("log {log} is corrupted: {message}")]
    LogCorruption {
        /// Name of the damaged log.
        log: String,
        /// Description of the damage.
        message: String,
    },

    /// A frame's checksum does not match its contents.
    #[error("checksum mismatch in {log} at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Name of the damaged log.
        log: String,
        /// Frame offset.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// The data directory is held by another process.
    #[error("data directory locked: another process has exclusive access")]
    Locked,

    /// The data directory is missing or is not a directory.
    #[error("invalid data directory: {message}")]
    InvalidDirectory {
        /// Description of the problem.
        message: String,
    },

    /// A collection name is not usable as a keyspace name.
    #[error("invalid collection name {name:?}: use 1-64 characters from [A-Za-z0-9_-]")]
    InvalidCollection {
        /// The rejected name.
        name: String,
    },

    /// A record id is empty.
    #[error("record id must not be empty")]
    EmptyRecordId,

    /// No queue entry has this id.
    #[error("queue entry {entry_id} not found")]
    EntryNotFound {
        /// The missing entry.
        entry_id: EntryId,
    },

    /// A queue entry was asked to move between states it cannot move between.
    #[error("queue entry {entry_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        /// The entry.
        entry_id: EntryId,
        /// Its current state.
        from: EntryState,
        /// The requested state.
        to: EntryState,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(log: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            log: log.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid directory error.
    pub fn invalid_directory(message: impl Into<String>) -> Self {
        Self::InvalidDirectory {
            message: message.into(),
        }
    }

    /// Returns true when the failure came from the disk running out of space.
    #[must_use]
    pub fn is_storage_full(&self) -> bool {
        match self {
            CoreError::Storage(e) => e.is_storage_full(),
            CoreError::Io(e) => matches!(e.raw_os_error(), Some(28) | Some(112)),
            _ => false,
        }
    }

    /// Returns true for errors that say something about one queue entry
    /// rather than about the store as a whole.
    #[must_use]
    pub fn is_entry_specific(&self) -> bool {
        matches!(
            self,
            CoreError::EntryNotFound { .. } | CoreError::InvalidTransition { .. }
        )
    }
}
