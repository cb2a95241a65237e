//! The single serialization point over store, queue and quarantine.

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::CoreResult;
use crate::quarantine::{DeadLetter, Quarantine};
use crate::queue::{EnqueueOutcome, MutationQueue, QueueCounts, QueueEntry};
use crate::record::LocalRecord;
use crate::space::{LogSpace, MemorySpace};
use crate::store::LocalStore;
use crate::types::{
    validate_collection_name, validate_record_id, Action, EntryId, RecordKey, Timestamp,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Result of a local write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// The record as stored.
    pub record: LocalRecord,
    /// What the queue did with the mutation.
    pub outcome: EnqueueOutcome,
}

/// Result of a local delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReceipt {
    /// The record that was removed, if it existed locally.
    pub removed: Option<LocalRecord>,
    /// What the queue did with the mutation.
    pub outcome: EnqueueOutcome,
}

/// Result of acknowledging a delivered entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// The entry, now `Done`.
    pub entry: QueueEntry,
    /// Whether the local record was marked synced.
    pub record_synced: bool,
}

/// What recovery did while opening.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Queue frames moved to the quarantine.
    pub quarantined: usize,
    /// `InFlight` entries reset to `Pending`.
    pub requeued: usize,
    /// Records whose store and queue disagreed and were reconciled.
    pub repaired: usize,
    /// Of those, local removals finished from a queued `Delete`.
    pub removals_finished: usize,
    /// Of those, remote deletes queued for records already gone locally.
    pub deletes_requeued: usize,
}

/// Snapshot of a data directory for operators.
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    /// Where the logs live.
    pub location: String,
    /// Record count per collection.
    pub collections: Vec<(String, usize)>,
    /// Records not yet acknowledged by the remote.
    pub unsynced: usize,
    /// Queue entries per state.
    pub queue: QueueCounts,
    /// Queue log size in bytes.
    pub queue_bytes: u64,
    /// Quarantined frames.
    pub dead_letters: usize,
    /// Next local version.
    pub next_version: u64,
}

#[derive(Debug, Default)]
struct Repairs {
    removals_finished: usize,
    deletes_requeued: usize,
    updates_requeued: usize,
}

impl Repairs {
    fn total(&self) -> usize {
        self.removals_finished + self.deletes_requeued + self.updates_requeued
    }
}

#[derive(Debug)]
struct DbInner {
    store: LocalStore,
    queue: MutationQueue,
    quarantine: Quarantine,
}

/// Offline-first local database.
///
/// All store and queue mutations from the application and from the sync
/// processor go through the one mutex held here, so a write and a delivery
/// acknowledgment can never interleave.
///
/// # Example
///
/// ```rust
/// use tillsync_core::{OfflineDb, StoreConfig};
///
/// let db = OfflineDb::open_in_memory(StoreConfig::default()).unwrap();
/// db.write("orders", "table-4", b"{\"qty\":2}".to_vec()).unwrap();
/// assert_eq!(db.counts().pending, 1);
/// ```
pub struct OfflineDb {
    inner: Mutex<DbInner>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    location: String,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for OfflineDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineDb")
            .field("location", &self.location)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OfflineDb {
    /// Opens a data directory with the system clock.
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        Self::open_with_clock(path, config, Arc::new(SystemClock))
    }

    /// Opens a data directory with a custom clock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process holds the directory (`Locked`)
    /// - A collection log is damaged (`LogCorruption`, `ChecksumMismatch`)
    /// - I/O errors occur
    ///
    /// Damage in the queue log is not an error: it is quarantined.
    pub fn open_with_clock(
        path: &Path,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        Self::open_with_space(Arc::new(dir), config, clock)
    }

    /// Opens an empty in-memory database.
    pub fn open_in_memory(config: StoreConfig) -> CoreResult<Self> {
        Self::open_with_space(Arc::new(MemorySpace::new()), config, Arc::new(SystemClock))
    }

    /// Opens a database over any log space and runs recovery.
    ///
    /// Recovery, in order:
    /// 1. collection logs are replayed strictly
    /// 2. damaged queue frames are moved to the quarantine and the queue
    ///    log is rewritten
    /// 3. entries left `InFlight` by a previous run go back to `Pending`
    /// 4. store and queue are reconciled: a record outliving its queued
    ///    `Delete` is removed, a removed record whose last entry is an
    ///    upsert gets a `Delete`, and every unsynced record without a live
    ///    queue entry gets an `Update`
    #[tracing::instrument(skip_all, fields(location = %space.describe()))]
    pub fn open_with_space(
        space: Arc<dyn LogSpace>,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        let now = clock.now();
        let location = space.describe();

        let store = LocalStore::open(Arc::clone(&space), &config)?;
        let mut quarantine = Quarantine::open(space.as_ref(), config.sync_on_write)?;
        let (mut queue, queue_recovery) = MutationQueue::open(Arc::clone(&space), &config, now)?;

        let mut recovery = RecoveryReport {
            quarantined: queue_recovery.dead_letters.len(),
            ..RecoveryReport::default()
        };
        if !queue_recovery.dead_letters.is_empty() {
            quarantine.add(queue_recovery.dead_letters)?;
        }
        if queue_recovery.needs_rewrite {
            queue.compact()?;
        }
        recovery.requeued = queue.requeue_stale_in_flight()?.len();

        let mut inner = DbInner {
            store,
            queue,
            quarantine,
        };
        let repairs = inner.repair(now)?;
        recovery.repaired = repairs.total();
        recovery.removals_finished = repairs.removals_finished;
        recovery.deletes_requeued = repairs.deletes_requeued;

        tracing::info!(
            location = %location,
            collections = inner.store.collections().len(),
            pending = inner.queue.counts().outstanding(),
            quarantined = recovery.quarantined,
            requeued = recovery.requeued,
            repaired = recovery.repaired,
            removals_finished = recovery.removals_finished,
            deletes_requeued = recovery.deletes_requeued,
            "offline store opened"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            config,
            clock,
            location,
            recovery,
        })
    }

    /// Configuration the database was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The clock stamping records and entries.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current time according to the database clock.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// What recovery did at open.
    #[must_use]
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    // ---------------------------------------------------------------
    // Application write path
    // ---------------------------------------------------------------

    /// Stores a record and queues it for the remote.
    ///
    /// Both the record and the queue entry are durable on return. The
    /// action is `Create` when the record did not exist locally, otherwise
    /// `Update`.
    ///
    /// # Errors
    ///
    /// On error the write is not committed. If the record was stored but
    /// its queue entry could not be, the record is put back the way it
    /// was before the error is returned.
    pub fn write(
        &self,
        collection: &str,
        id: &str,
        payload: impl Into<Bytes>,
    ) -> CoreResult<WriteReceipt> {
        let payload = payload.into();
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let previous = inner.store.get(collection, id).cloned();
        let action = if previous.is_some() {
            Action::Update
        } else {
            Action::Create
        };
        let record = inner.store.put(collection, id, payload, now)?;
        let outcome = match inner.queue.enqueue(
            action,
            collection,
            id,
            record.payload.clone(),
            record.local_version,
            now,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(revert) = inner.store.revert(collection, id, previous) {
                    tracing::error!(collection, id, error = %revert, "could not persist write rollback");
                }
                return Err(e);
            }
        };

        inner.compact_quietly(&self.config);
        tracing::debug!(collection, id, version = record.local_version, ?action, "local write");
        Ok(WriteReceipt { record, outcome })
    }

    /// Queues the remote delete, then removes the record locally.
    ///
    /// Deleting a record that does not exist locally still queues a
    /// delete, since the remote may hold it. The queued `Delete` carries the
    /// version the removal takes, so a removal lost to a crash is finished
    /// at the next open.
    ///
    /// # Errors
    ///
    /// If queueing fails nothing changed. If the local removal fails the
    /// record is gone from memory and the queued delete stands, unless the
    /// delete had cancelled an unsent create, in which case the record and
    /// its create are restored.
    pub fn delete(&self, collection: &str, id: &str) -> CoreResult<DeleteReceipt> {
        validate_collection_name(collection)?;
        validate_record_id(id)?;
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let version = inner.store.next_version();
        let outcome = inner
            .queue
            .enqueue(Action::Delete, collection, id, Bytes::new(), version, now)?;
        let removed = match inner.store.delete(collection, id) {
            Ok(removed) => removed,
            Err(e) => {
                inner.abandon_removal(collection, id, &outcome, now);
                return Err(e);
            }
        };

        inner.compact_quietly(&self.config);
        tracing::debug!(collection, id, existed = removed.is_some(), "local delete");
        Ok(DeleteReceipt { removed, outcome })
    }

    // ---------------------------------------------------------------
    // Delivery (driven by the sync processor)
    // ---------------------------------------------------------------

    /// Marks an entry `InFlight` and returns it with its current payload.
    pub fn begin_delivery(&self, entry_id: EntryId) -> CoreResult<QueueEntry> {
        self.inner.lock().queue.mark_in_flight(entry_id)
    }

    /// Acknowledges a delivered entry.
    ///
    /// The local record is marked synced only when the entry was an upsert
    /// of the record's current version and no newer entry for the record is
    /// still waiting.
    pub fn complete_delivery(&self, entry_id: EntryId) -> CoreResult<Delivered> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let entry = inner.queue.mark_done(entry_id, now)?;
        let key = entry.key();
        let record_synced = if entry.action.is_upsert()
            && !inner.queue.has_newer_live_entry(&key, entry.entry_id)
        {
            inner
                .store
                .mark_synced_at(&entry.collection, &entry.record_id, entry.record_version)?
        } else {
            false
        };

        Ok(Delivered {
            entry,
            record_synced,
        })
    }

    /// Records a transient delivery failure (consumes an attempt).
    pub fn fail_attempt(&self, entry_id: EntryId, error: &str) -> CoreResult<QueueEntry> {
        let now = self.clock.now();
        self.inner.lock().queue.mark_failed_attempt(entry_id, error, now)
    }

    /// Records a permanent delivery failure (terminal, no attempt consumed).
    pub fn fail_permanently(&self, entry_id: EntryId, error: &str) -> CoreResult<QueueEntry> {
        let now = self.clock.now();
        self.inner
            .lock()
            .queue
            .mark_failed_permanently(entry_id, error, now)
    }

    /// Returns an `InFlight` entry to `Pending` without consuming an attempt.
    pub fn release(&self, entry_id: EntryId, error: Option<&str>) -> CoreResult<QueueEntry> {
        self.inner.lock().queue.release(entry_id, error)
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// Looks up a local record.
    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<LocalRecord> {
        self.inner.lock().store.get(collection, id).cloned()
    }

    /// Every local record of a collection, ordered by id.
    #[must_use]
    pub fn get_all(&self, collection: &str) -> Vec<LocalRecord> {
        self.inner.lock().store.get_all(collection)
    }

    /// Collections known locally.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        self.inner.lock().store.collections()
    }

    /// `Pending` entries in FIFO order.
    #[must_use]
    pub fn pending(&self) -> Vec<QueueEntry> {
        self.inner.lock().queue.pending()
    }

    /// Every queue entry still held.
    #[must_use]
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.inner.lock().queue.entries()
    }

    /// Looks up one queue entry.
    #[must_use]
    pub fn entry(&self, entry_id: EntryId) -> Option<QueueEntry> {
        self.inner.lock().queue.entry(entry_id).cloned()
    }

    /// `Failed` entries awaiting an operator.
    #[must_use]
    pub fn failed(&self) -> Vec<QueueEntry> {
        self.inner.lock().queue.failed()
    }

    /// Queue entry counts per state.
    #[must_use]
    pub fn counts(&self) -> QueueCounts {
        self.inner.lock().queue.counts()
    }

    /// Quarantined frames.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().quarantine.letters().to_vec()
    }

    /// Number of quarantined frames.
    #[must_use]
    pub fn dead_letter_count(&self) -> usize {
        self.inner.lock().quarantine.len()
    }

    /// Earliest future backoff deadline of a pending entry.
    #[must_use]
    pub fn next_retry_at(&self) -> Option<Timestamp> {
        let now = self.clock.now();
        self.inner.lock().queue.next_retry_at(now)
    }

    /// Operator snapshot.
    pub fn stats(&self) -> CoreResult<DbStats> {
        let inner = self.inner.lock();
        let collections = inner
            .store
            .collections()
            .into_iter()
            .map(|name| {
                let count = inner.store.record_count(&name);
                (name, count)
            })
            .collect();

        Ok(DbStats {
            location: self.location.clone(),
            collections,
            unsynced: inner.store.unsynced().len(),
            queue: inner.queue.counts(),
            queue_bytes: inner.queue.log_size()?,
            dead_letters: inner.quarantine.len(),
            next_version: inner.store.next_version(),
        })
    }

    /// Unsynced records that have no live queue entry.
    ///
    /// Always empty on a healthy database; [`OfflineDb::repair`] fixes it.
    #[must_use]
    pub fn orphaned_records(&self) -> Vec<RecordKey> {
        self.inner.lock().orphans()
    }

    // ---------------------------------------------------------------
    // Operator and maintenance
    // ---------------------------------------------------------------

    /// Returns a `Failed` entry to `Pending` with a fresh attempt budget,
    /// carrying the record's current local state.
    pub fn retry_failed(&self, entry_id: EntryId) -> CoreResult<QueueEntry> {
        let entry = self.inner.lock().retry_failed(entry_id)?;
        tracing::info!(entry = %entry.entry_id, record = %entry.key(), "failed entry requeued");
        Ok(entry)
    }

    /// Requeues every `Failed` entry. Returns their ids.
    pub fn retry_all_failed(&self) -> CoreResult<Vec<EntryId>> {
        let mut inner = self.inner.lock();
        let failed: Vec<EntryId> = inner.queue.failed().iter().map(|e| e.entry_id).collect();
        for id in &failed {
            inner.retry_failed(*id)?;
        }
        if !failed.is_empty() {
            tracing::info!(count = failed.len(), "failed entries requeued");
        }
        Ok(failed)
    }

    /// Drops `Done` entries past the retention window and compacts the
    /// queue log if it has outgrown its contents. Returns entries removed.
    pub fn collect_garbage(&self) -> CoreResult<usize> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let removed = inner.queue.collect_garbage(self.config.retention, now)?;
        inner.queue.compact_if_needed(&self.config)?;
        Ok(removed)
    }

    /// Rewrites every log to its live contents. Returns bytes reclaimed.
    pub fn compact(&self) -> CoreResult<u64> {
        let mut inner = self.inner.lock();
        let reclaimed = inner.store.compact_all()? + inner.queue.compact()?;
        tracing::info!(reclaimed, "logs compacted");
        Ok(reclaimed)
    }

    /// Runs the reconciliation done at open. Returns how many records were
    /// repaired.
    pub fn repair(&self) -> CoreResult<usize> {
        let now = self.clock.now();
        Ok(self.inner.lock().repair(now)?.total())
    }
}

impl DbInner {
    fn retry_failed(&mut self, entry_id: EntryId) -> CoreResult<QueueEntry> {
        let current = self
            .queue
            .entry(entry_id)
            .and_then(|e| self.store.get(&e.collection, &e.record_id))
            .cloned();
        self.queue.retry_failed(entry_id, current.as_ref())
    }

    fn orphans(&self) -> Vec<RecordKey> {
        self.store
            .unsynced()
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| !self.queue.has_live_entry(key))
            .collect()
    }

    fn repair(&mut self, now: Timestamp) -> CoreResult<Repairs> {
        let mut repairs = Repairs::default();

        for (key, version) in self.queue.delete_versions() {
            let outdated = self
                .store
                .get(&key.collection, &key.id)
                .is_some_and(|record| record.local_version < version);
            if outdated {
                tracing::warn!(record = %key, version, "record outlived its queued delete; removing");
                self.store.delete(&key.collection, &key.id)?;
                repairs.removals_finished += 1;
            }
        }

        for key in self.queue.live_keys() {
            if self.store.get(&key.collection, &key.id).is_some() {
                continue;
            }
            let upsert_last = self
                .queue
                .last_live(&key)
                .is_some_and(|entry| entry.action.is_upsert());
            if upsert_last {
                tracing::warn!(record = %key, "removed record still queued as an upsert; queueing delete");
                let version = self.store.next_version();
                self.queue
                    .enqueue(Action::Delete, &key.collection, &key.id, Bytes::new(), version, now)?;
                repairs.deletes_requeued += 1;
            }
        }

        let orphans = self.orphans();
        for key in &orphans {
            let Some(record) = self.store.get(&key.collection, &key.id).cloned() else {
                continue;
            };
            tracing::warn!(record = %key, version = record.local_version, "unsynced record had no queue entry; requeueing");
            self.queue.enqueue(
                Action::Update,
                &key.collection,
                &key.id,
                record.payload,
                record.local_version,
                now,
            )?;
        }
        repairs.updates_requeued = orphans.len();
        Ok(repairs)
    }

    /// Called when the local removal failed after its `Delete` was queued.
    fn abandon_removal(
        &mut self,
        collection: &str,
        id: &str,
        outcome: &EnqueueOutcome,
        now: Timestamp,
    ) {
        if !matches!(outcome, EnqueueOutcome::Cancelled { .. }) {
            self.store.forget(collection, id);
            tracing::error!(collection, id, "local removal failed; finishing it at next open");
            return;
        }
        let Some(record) = self.store.get(collection, id).cloned() else {
            return;
        };
        let restored = self.queue.enqueue(
            Action::Create,
            collection,
            id,
            record.payload,
            record.local_version,
            now,
        );
        if let Err(e) = restored {
            tracing::error!(collection, id, error = %e, "could not restore cancelled create");
        }
    }

    /// Opportunistic compaction after a write; the write already succeeded,
    /// so failures here are only logged.
    fn compact_quietly(&mut self, config: &StoreConfig) {
        if let Err(e) = self.store.compact_if_needed(config) {
            tracing::error!(error = %e, "collection compaction failed");
        }
        if let Err(e) = self.queue.compact_if_needed(config) {
            tracing::error!(error = %e, "queue compaction failed");
        }
    }
}
