//! # tillsync core
//!
//! Local persistence for offline-first point-of-sale stations.
//!
//! This crate provides:
//! - A durable local store with one keyspace log per collection
//! - A durable mutation queue with coalescing and cancellation
//! - A dead-letter quarantine for queue frames damaged on disk
//! - [`OfflineDb`], the single serialization point the application write
//!   path and the sync processor share
//!
//! Everything is persisted as checksummed CBOR frames in append-only logs
//! (see [`frame`]).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod db;
mod dir;
mod error;
pub mod frame;
mod log;
mod quarantine;
mod queue;
mod record;
mod space;
mod store;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryPolicy, StoreConfig};
pub use db::{DbStats, DeleteReceipt, Delivered, OfflineDb, RecoveryReport, WriteReceipt};
pub use dir::StoreDir;
pub use error::{CoreError, CoreResult};
pub use log::{LogFile, LogWriter};
pub use quarantine::{DeadLetter, Quarantine};
pub use queue::{EnqueueOutcome, MutationQueue, QueueCounts, QueueEntry, QueueRecovery};
pub use record::LocalRecord;
pub use space::{LogName, LogSpace, MemorySpace};
pub use store::LocalStore;
pub use types::{
    validate_collection_name, validate_record_id, Action, EntryId, EntryState, RecordKey,
    Timestamp, MAX_COLLECTION_NAME,
};
