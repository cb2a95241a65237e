//! Local record representation and its persisted frames.

use crate::types::Timestamp;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The station's latest known state of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    /// Record id, unique within its collection.
    pub id: String,
    /// Owning collection.
    pub collection: String,
    /// Opaque application payload.
    pub payload: Bytes,
    /// Store-wide monotonic version, bumped by every local write.
    pub local_version: u64,
    /// Whether the remote has acknowledged this version.
    pub synced: bool,
    /// Time of the last local write.
    pub updated_at: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SyncedFrame {
    pub id: String,
    pub local_version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RemovedFrame {
    pub id: String,
    pub local_version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct VersionWatermark {
    pub next_version: u64,
}
