//! Where logs live.

use crate::error::CoreResult;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tillsync_storage::{InMemoryBackend, StorageBackend};

/// Identifies one log of a data directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogName {
    /// The mutation queue.
    Queue,
    /// The dead-letter list.
    Quarantine,
    /// The keyspace of one collection.
    Collection(String),
}

impl fmt::Display for LogName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogName::Queue => f.write_str("queue"),
            LogName::Quarantine => f.write_str("quarantine"),
            LogName::Collection(name) => write!(f, "collections/{name}"),
        }
    }
}

/// Opens and atomically replaces logs.
///
/// Implementations must make [`LogSpace::replace`] all-or-nothing: after a
/// crash the log holds either the old or the new contents.
pub trait LogSpace: Send + Sync + fmt::Debug {
    /// Opens (creating if needed) the backend of a log.
    fn open(&self, name: &LogName) -> CoreResult<Box<dyn StorageBackend>>;

    /// Replaces a log's contents and returns a backend over the new contents.
    fn replace(&self, name: &LogName, contents: &[u8]) -> CoreResult<Box<dyn StorageBackend>>;

    /// Names of the collections that have a log.
    fn collections(&self) -> CoreResult<Vec<String>>;

    /// Human-readable location.
    fn describe(&self) -> String;
}

/// Logs held in memory, for tests and ephemeral stations.
///
/// Logs can be seeded with raw bytes to exercise recovery without a disk.
#[derive(Debug, Default)]
pub struct MemorySpace {
    seeded: Mutex<HashMap<LogName, Vec<u8>>>,
    collections: Mutex<BTreeSet<String>>,
}

impl MemorySpace {
    /// Creates an empty space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-loads a log with raw bytes, returned by the next `open`.
    #[must_use]
    pub fn with_log(self, name: LogName, data: Vec<u8>) -> Self {
        if let LogName::Collection(c) = &name {
            self.collections.lock().insert(c.clone());
        }
        self.seeded.lock().insert(name, data);
        self
    }
}

impl LogSpace for MemorySpace {
    fn open(&self, name: &LogName) -> CoreResult<Box<dyn StorageBackend>> {
        if let LogName::Collection(c) = name {
            self.collections.lock().insert(c.clone());
        }
        let data = self.seeded.lock().remove(name).unwrap_or_default();
        Ok(Box::new(InMemoryBackend::with_data(data)))
    }

    fn replace(&self, _name: &LogName, contents: &[u8]) -> CoreResult<Box<dyn StorageBackend>> {
        Ok(Box::new(InMemoryBackend::with_data(contents.to_vec())))
    }

    fn collections(&self) -> CoreResult<Vec<String>> {
        Ok(self.collections.lock().iter().cloned().collect())
    }

    fn describe(&self) -> String {
        ":memory:".to_string()
    }
}
