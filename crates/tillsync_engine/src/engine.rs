//! The application-facing facade.

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::processor::{DrainReport, SyncProcessor};
use crate::remote::RemoteStore;
use crate::scheduler::Scheduler;
use crate::status::{StatusBroadcaster, SyncStatus};
use crate::subscription::Subscription;
use bytes::Bytes;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tillsync_core::{
    Clock, DeadLetter, DeleteReceipt, EntryId, LocalRecord, OfflineDb, QueueEntry, SystemClock,
    WriteReceipt,
};
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Result of [`Engine::force_sync_now`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A drain ran to completion.
    Completed(DrainReport),
    /// Another drain was already running; this request did nothing.
    AlreadyRunning,
    /// The remote is unreachable; nothing was attempted.
    Offline,
}

/// An offline-first sync engine for one station.
///
/// Writes and deletes commit to the local store and return without touching
/// the network. Delivery to the remote happens in the background once
/// [`start`](Self::start) has been called, or on demand through
/// [`force_sync_now`](Self::force_sync_now).
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tillsync_engine::{ConnectivityMonitor, Engine, MemoryRemoteStore, SyncConfig};
///
/// # async fn run() -> tillsync_engine::SyncResult<()> {
/// let remote = Arc::new(MemoryRemoteStore::new());
/// let engine = Engine::open(
///     "station-data".as_ref(),
///     SyncConfig::default(),
///     remote,
///     ConnectivityMonitor::online(),
/// )?;
/// engine.start()?;
/// engine.write("orders", "table-4", b"{\"total\":42}".to_vec())?;
/// engine.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Engine {
    db: Arc<OfflineDb>,
    processor: Arc<SyncProcessor>,
    scheduler: Scheduler,
    connectivity: ConnectivityMonitor,
    status: StatusBroadcaster,
    config: SyncConfig,
}

impl Engine {
    /// Opens (or creates) a station data directory.
    ///
    /// Recovery runs before this returns: entries interrupted mid-delivery
    /// are requeued and damaged queue frames are quarantined.
    pub fn open(
        path: &Path,
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
    ) -> SyncResult<Self> {
        Self::open_with_clock(path, config, remote, connectivity, Arc::new(SystemClock))
    }

    /// Opens a data directory with a custom clock.
    pub fn open_with_clock(
        path: &Path,
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let db = OfflineDb::open_with_clock(path, config.store.clone(), clock)?;
        Ok(Self::with_db(Arc::new(db), config, remote, connectivity))
    }

    /// Creates an engine over an empty in-memory store.
    pub fn open_in_memory(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
    ) -> SyncResult<Self> {
        let db = OfflineDb::open_in_memory(config.store.clone())?;
        Ok(Self::with_db(Arc::new(db), config, remote, connectivity))
    }

    /// Creates an engine over an already opened database.
    pub fn with_db(
        db: Arc<OfflineDb>,
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        let status = StatusBroadcaster::for_db(&db);
        let processor = Arc::new(SyncProcessor::new(
            Arc::clone(&db),
            remote,
            status.clone(),
            &config,
        ));
        let scheduler = Scheduler::new(Arc::clone(&processor), connectivity.clone(), config.interval);
        Self {
            db,
            processor,
            scheduler,
            connectivity,
            status,
            config,
        }
    }

    /// Starts background syncing.
    pub fn start(&self) -> SyncResult<()> {
        self.scheduler.start()
    }

    /// Stops background syncing, letting a running drain finish.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.scheduler.stop_and_wait().await
    }

    /// Returns true while background syncing runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Stores a record locally and queues it for the remote.
    ///
    /// Never waits on the network. If the remote is reachable a drain is
    /// requested right away.
    ///
    /// # Errors
    ///
    /// Fails only on local persistence errors. The write is then not
    /// committed: a record stored without its queue entry is put back.
    pub fn write(
        &self,
        collection: &str,
        id: &str,
        payload: impl Into<Bytes>,
    ) -> SyncResult<WriteReceipt> {
        let receipt = self.db.write(collection, id, payload)?;
        self.after_local_change();
        Ok(receipt)
    }

    /// Serializes `value` as JSON and writes it.
    pub fn write_json<T: Serialize + ?Sized>(
        &self,
        collection: &str,
        id: &str,
        value: &T,
    ) -> SyncResult<WriteReceipt> {
        let payload = serde_json::to_vec(value)?;
        self.write(collection, id, payload)
    }

    /// Queues the remote delete and removes the record locally.
    pub fn delete(&self, collection: &str, id: &str) -> SyncResult<DeleteReceipt> {
        let receipt = self.db.delete(collection, id)?;
        self.after_local_change();
        Ok(receipt)
    }

    fn after_local_change(&self) {
        self.status.refresh_counts(&self.db);
        if self.connectivity.is_online() {
            self.scheduler.trigger();
        }
    }

    /// Looks up a local record.
    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<LocalRecord> {
        self.db.get(collection, id)
    }

    /// Every local record of a collection, ordered by id.
    #[must_use]
    pub fn get_all(&self, collection: &str) -> Vec<LocalRecord> {
        self.db.get_all(collection)
    }

    /// Entries still waiting for the remote (`Pending` and `InFlight`).
    #[must_use]
    pub fn pending_entries(&self) -> Vec<QueueEntry> {
        self.db
            .entries()
            .into_iter()
            .filter(|e| e.state.is_outstanding())
            .collect()
    }

    /// The latest status snapshot.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    /// A receiver of status snapshots.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.watch()
    }

    /// Calls `callback` with the current status and on every change.
    pub fn subscribe_status<F>(&self, callback: F) -> SyncResult<Subscription>
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.status.subscribe(callback)
    }

    /// Drains now instead of waiting for the scheduler.
    ///
    /// The drain runs on its own task, so dropping the returned future does
    /// not interrupt it.
    pub async fn force_sync_now(&self) -> SyncResult<DrainOutcome> {
        if !self.connectivity.is_online() {
            return Ok(DrainOutcome::Offline);
        }
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let processor = Arc::clone(&self.processor);
        let drained = runtime
            .spawn(async move { processor.drain().await })
            .await
            .map_err(|e| SyncError::TaskFailed(e.to_string()))??;

        Ok(match drained {
            Some(report) => DrainOutcome::Completed(report),
            None => DrainOutcome::AlreadyRunning,
        })
    }

    /// `Failed` entries awaiting an operator.
    #[must_use]
    pub fn failed_entries(&self) -> Vec<QueueEntry> {
        self.db.failed()
    }

    /// Gives a `Failed` entry a fresh attempt budget.
    pub fn retry_failed(&self, entry_id: EntryId) -> SyncResult<QueueEntry> {
        let entry = self.db.retry_failed(entry_id)?;
        self.after_local_change();
        Ok(entry)
    }

    /// Gives every `Failed` entry a fresh attempt budget.
    pub fn retry_all_failed(&self) -> SyncResult<Vec<EntryId>> {
        let ids = self.db.retry_all_failed()?;
        self.after_local_change();
        Ok(ids)
    }

    /// Quarantined queue frames.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.db.dead_letters()
    }

    /// Drops acknowledged entries past the retention window.
    pub fn collect_garbage(&self) -> SyncResult<usize> {
        Ok(self.db.collect_garbage()?)
    }

    /// Rewrites every log to its live contents.
    pub fn compact(&self) -> SyncResult<u64> {
        Ok(self.db.compact()?)
    }

    /// The underlying database.
    #[must_use]
    pub fn db(&self) -> &Arc<OfflineDb> {
        &self.db
    }

    /// The connectivity monitor the engine follows.
    #[must_use]
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}
