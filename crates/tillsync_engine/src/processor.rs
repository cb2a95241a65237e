//! Draining the mutation queue against the remote.

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncResult};
use crate::remote::RemoteStore;
use crate::status::StatusBroadcaster;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tillsync_core::{Action, EntryState, OfflineDb, QueueEntry, RecordKey};

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries the remote acknowledged.
    pub succeeded: usize,
    /// Entries that failed transiently and will be retried.
    pub failed: usize,
    /// Entries moved to `Failed` this drain.
    pub permanently_failed: usize,
    /// Entries skipped because of backoff or an earlier entry of the same
    /// record.
    pub deferred: usize,
    /// The remote refused the credentials and the drain stopped early.
    pub unauthorized: bool,
    /// Wall time spent.
    pub duration: Duration,
}

impl DrainReport {
    /// Returns true if the drain left nothing waiting on a retry.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.deferred == 0 && !self.unauthorized
    }
}

/// What a settled entry means for the rest of the drain.
enum Step {
    /// Later entries of the record may follow.
    Continue,
    /// Later entries of the record wait for the next drain.
    Block,
    /// Nothing else is worth sending in this drain.
    Stop,
}

/// Delivers queued mutations to a [`RemoteStore`].
///
/// At most one drain runs at a time: a drain requested while another is in
/// progress returns immediately with `None`.
pub struct SyncProcessor {
    db: Arc<OfflineDb>,
    remote: Arc<dyn RemoteStore>,
    status: StatusBroadcaster,
    request_timeout: Duration,
    gc_every: u32,
    gate: tokio::sync::Mutex<()>,
    drains: AtomicU64,
}

impl std::fmt::Debug for SyncProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProcessor")
            .field("request_timeout", &self.request_timeout)
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

impl SyncProcessor {
    /// Creates a processor over `db`.
    pub fn new(
        db: Arc<OfflineDb>,
        remote: Arc<dyn RemoteStore>,
        status: StatusBroadcaster,
        config: &SyncConfig,
    ) -> Self {
        Self {
            db,
            remote,
            status,
            request_timeout: config.request_timeout,
            gc_every: config.gc_every,
            gate: tokio::sync::Mutex::new(()),
            drains: AtomicU64::new(0),
        }
    }

    /// The database being drained.
    #[must_use]
    pub fn db(&self) -> &Arc<OfflineDb> {
        &self.db
    }

    /// Returns true while a drain is running.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Number of drains completed since creation.
    #[must_use]
    pub fn drain_count(&self) -> u64 {
        self.drains.load(Ordering::SeqCst)
    }

    /// Delivers every due `Pending` entry in FIFO order.
    ///
    /// Returns `Ok(None)` without doing anything if a drain is already
    /// running. Entries of a record are delivered strictly in order: once
    /// one is deferred or fails transiently, the rest of that record waits
    /// for the next drain while other records proceed.
    ///
    /// # Errors
    ///
    /// Only local persistence failures abort a drain; remote failures are
    /// recorded on the entries and in the report.
    #[tracing::instrument(skip(self))]
    pub async fn drain(&self) -> SyncResult<Option<DrainReport>> {
        let Ok(_guard) = self.gate.try_lock() else {
            tracing::debug!("drain already running");
            return Ok(None);
        };

        let started = Instant::now();
        self.status.update(|s| s.is_syncing = true);

        let mut report = DrainReport::default();
        let mut last_error = None;
        let result = self.run(&mut report, &mut last_error).await;
        report.duration = started.elapsed();

        let finished_at = self.db.now();
        if let Err(e) = &result {
            last_error = Some(e.to_string());
        }
        let clean = result.is_ok() && report.is_clean();
        self.status.update(|s| {
            s.is_syncing = false;
            let counts = self.db.counts();
            s.pending_count = counts.outstanding();
            s.failed_count = counts.failed;
            s.dead_letters = self.db.dead_letter_count();
            if clean {
                s.last_sync_at = Some(finished_at);
            }
            if let Some(message) = last_error {
                s.last_error = Some(message);
            } else if clean && s.failed_count == 0 {
                s.last_error = None;
            }
        });

        let drains = self.drains.fetch_add(1, Ordering::SeqCst) + 1;
        if self.gc_every > 0 && drains % u64::from(self.gc_every) == 0 {
            match self.db.collect_garbage() {
                Ok(removed) if removed > 0 => tracing::debug!(removed, "queue garbage collected"),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "queue garbage collection failed"),
            }
        }

        match result {
            Ok(()) => {
                if report.succeeded + report.failed + report.permanently_failed > 0
                    || report.unauthorized
                {
                    tracing::info!(
                        succeeded = report.succeeded,
                        failed = report.failed,
                        permanently_failed = report.permanently_failed,
                        deferred = report.deferred,
                        unauthorized = report.unauthorized,
                        elapsed_ms = report.duration.as_millis() as u64,
                        "drain finished"
                    );
                }
                Ok(Some(report))
            }
            Err(e) => {
                tracing::error!(error = %e, "drain aborted by local storage failure");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        report: &mut DrainReport,
        last_error: &mut Option<String>,
    ) -> SyncResult<()> {
        let now = self.db.now();
        let mut blocked: HashSet<RecordKey> = HashSet::new();

        for queued in self.db.pending() {
            let key = queued.key();
            if blocked.contains(&key) || !queued.is_due(now) {
                blocked.insert(key);
                report.deferred += 1;
                continue;
            }

            // The snapshot may be stale: a concurrent write can coalesce or
            // cancel the entry before it is picked up.
            let entry = match self.db.begin_delivery(queued.entry_id) {
                Ok(entry) => entry,
                Err(e) if e.is_entry_specific() => {
                    tracing::debug!(entry = %queued.entry_id, "entry changed before delivery");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let outcome = self.send(&entry).await;
            let step = match self.settle(&entry, outcome, report, last_error) {
                Ok(step) => step,
                Err(e) => {
                    if let Err(release) = self.db.release(entry.entry_id, None) {
                        tracing::error!(entry = %entry.entry_id, error = %release, "could not release entry");
                    }
                    return Err(e);
                }
            };
            self.status.refresh_counts(&self.db);

            match step {
                Step::Continue => {}
                Step::Block => {
                    blocked.insert(key);
                }
                Step::Stop => break,
            }
        }
        Ok(())
    }

    async fn send(&self, entry: &QueueEntry) -> Result<(), RemoteError> {
        let call = async {
            match entry.action {
                Action::Create | Action::Update => {
                    self.remote
                        .upsert(&entry.collection, &entry.record_id, entry.payload_snapshot.clone())
                        .await
                }
                Action::Delete => self.remote.delete(&entry.collection, &entry.record_id).await,
            }
        };
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::timed_out(self.request_timeout)),
        }
    }

    fn settle(
        &self,
        entry: &QueueEntry,
        outcome: Result<(), RemoteError>,
        report: &mut DrainReport,
        last_error: &mut Option<String>,
    ) -> SyncResult<Step> {
        let id = entry.entry_id;
        match outcome {
            Ok(()) => {
                let delivered = self.db.complete_delivery(id)?;
                report.succeeded += 1;
                tracing::debug!(
                    entry = %id,
                    record = %entry.key(),
                    action = ?entry.action,
                    synced = delivered.record_synced,
                    "entry delivered"
                );
                Ok(Step::Continue)
            }
            Err(RemoteError::Unauthorized { message }) => {
                self.db.release(id, Some(&message))?;
                report.unauthorized = true;
                *last_error = Some(format!("unauthorized: {message}"));
                tracing::warn!(entry = %id, error = %message, "remote refused credentials; stopping drain");
                Ok(Step::Stop)
            }
            Err(err @ RemoteError::Transient { .. }) => {
                let message = err.to_string();
                let updated = self.db.fail_attempt(id, &message)?;
                if updated.state == EntryState::Failed {
                    report.permanently_failed += 1;
                    tracing::warn!(
                        entry = %id,
                        record = %entry.key(),
                        attempts = updated.attempts,
                        error = %message,
                        "entry out of attempts"
                    );
                } else {
                    report.failed += 1;
                    tracing::warn!(
                        entry = %id,
                        record = %entry.key(),
                        attempts = updated.attempts,
                        next_attempt_at = ?updated.next_attempt_at,
                        error = %message,
                        "delivery failed; will retry"
                    );
                }
                *last_error = Some(message);
                Ok(Step::Block)
            }
            Err(err @ RemoteError::Permanent { .. }) => {
                let message = err.to_string();
                self.db.fail_permanently(id, &message)?;
                report.permanently_failed += 1;
                tracing::warn!(entry = %id, record = %entry.key(), error = %message, "remote rejected entry");
                *last_error = Some(message);
                Ok(Step::Continue)
            }
        }
    }
}
