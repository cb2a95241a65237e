//! # tillsync engine
//!
//! Background delivery of locally committed changes to a remote backend.
//!
//! This crate provides:
//! - The [`RemoteStore`] capability and an in-memory double
//! - Connectivity monitoring with an optional TCP probe
//! - A single-flight [`SyncProcessor`] with per-record ordering, backoff
//!   and failure classification
//! - A [`Scheduler`] that drains on reconnect, on writes, on an interval
//!   and at backoff deadlines
//! - An observable [`SyncStatus`]
//! - The [`Engine`] facade tying these to a [`tillsync_core::OfflineDb`]
//!
//! ## Key Invariants
//!
//! - A write returns once it is durable locally; it never waits on the network
//! - Entries of one record reach the remote in the order they were made
//! - Remote apply is idempotent, so a retried entry is harmless
//! - At most one drain runs at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connectivity;
mod engine;
mod error;
mod processor;
mod remote;
mod scheduler;
mod status;
mod subscription;

pub use config::SyncConfig;
pub use connectivity::{spawn_probe, ConnectivityMonitor, Reachability, ReachabilityProbe, TcpProbe};
pub use engine::{DrainOutcome, Engine};
pub use error::{RemoteError, SyncError, SyncResult};
pub use processor::{DrainReport, SyncProcessor};
pub use remote::{MemoryRemoteStore, RemoteCall, RemoteStore};
pub use scheduler::Scheduler;
pub use status::{StatusBroadcaster, SyncStatus};
pub use subscription::Subscription;
