//! Identifier and state types shared by the store and the queue.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Longest accepted collection name.
pub const MAX_COLLECTION_NAME: usize = 64;

/// Monotonic identifier of a queue entry.
///
/// Ids are handed out in enqueue order and never reused, so ordering by
/// id is FIFO ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(u64);

impl EntryId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Self)
    }
}

/// Addresses one record: `(collection, record id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    /// Collection name.
    pub collection: String,
    /// Record id within the collection.
    pub id: String,
}

impl RecordKey {
    /// Creates a key.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// What a queue entry asks the remote to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// The record did not exist locally before this write.
    Create,
    /// The record existed locally.
    Update,
    /// The record was removed locally.
    Delete,
}

impl Action {
    /// Returns true for actions delivered as an upsert.
    #[must_use]
    pub const fn is_upsert(self) -> bool {
        matches!(self, Action::Create | Action::Update)
    }
}

/// Delivery state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryState {
    /// Waiting to be sent.
    Pending,
    /// Handed to the remote by the current drain.
    InFlight,
    /// Terminal: needs operator attention, never retried automatically.
    Failed,
    /// Acknowledged by the remote.
    Done,
}

impl EntryState {
    /// Returns true for `Pending` and `InFlight`.
    #[must_use]
    pub const fn is_outstanding(self) -> bool {
        matches!(self, EntryState::Pending | EntryState::InFlight)
    }
}

/// Checks that `name` can be used as a collection keyspace.
///
/// Names become file names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_collection_name(name: &str) -> CoreResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_COLLECTION_NAME
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidCollection {
            name: name.to_string(),
        })
    }
}

/// Checks that a record id is usable.
pub fn validate_record_id(id: &str) -> CoreResult<()> {
    if id.is_empty() {
        Err(CoreError::EmptyRecordId)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_hex_display_parses_back() {
        let id = EntryId::new(0x2a);
        assert_eq!(id.to_string(), "000000000000002a");
        assert_eq!("000000000000002a".parse::<EntryId>().unwrap(), id);
        assert!("zz".parse::<EntryId>().is_err());
    }

    #[test]
    fn entry_ids_order_fifo() {
        assert!(EntryId::new(1) < EntryId::new(2));
    }

    #[test]
    fn collection_names() {
        assert!(validate_collection_name("orders").is_ok());
        assert!(validate_collection_name("sales_2024-q1").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("../orders").is_err());
        assert!(validate_collection_name("orders log").is_err());
        assert!(validate_collection_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn record_ids() {
        assert!(validate_record_id("table-4").is_ok());
        assert!(matches!(
            validate_record_id(""),
            Err(CoreError::EmptyRecordId)
        ));
    }

    #[test]
    fn action_and_state_helpers() {
        assert!(Action::Create.is_upsert());
        assert!(Action::Update.is_upsert());
        assert!(!Action::Delete.is_upsert());
        assert!(EntryState::InFlight.is_outstanding());
        assert!(!EntryState::Failed.is_outstanding());
    }
}
