//! Durable mutation queue.
//!
//! The queue log holds `EntryUpsert` frames (a whole entry, written on
//! append and on coalescing), `EntryTransition` frames (state changes),
//! `EntryRemoved` frames (cancellation and garbage collection) and an
//! `EntryWatermark` written at the start of every rewrite.
//!
//! Replay is lenient: frames that fail their checksum or do not decode are
//! handed back as dead letters instead of failing the open, so one bad
//! sector cannot take a station offline.

use crate::clock::after;
use crate::config::{RetryPolicy, StoreConfig};
use crate::error::{CoreError, CoreResult};
use crate::frame::{Frame, FrameKind, ScanItem};
use crate::log::{LogFile, LogWriter};
use crate::quarantine::DeadLetter;
use crate::record::LocalRecord;
use crate::space::{LogName, LogSpace};
use crate::types::{Action, EntryId, EntryState, RecordKey, Timestamp};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// One queued mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Monotonic id; FIFO order.
    pub entry_id: EntryId,
    /// Target collection.
    pub collection: String,
    /// Target record.
    pub record_id: String,
    /// What to do remotely.
    pub action: Action,
    /// Payload to upsert (empty for deletes).
    pub payload_snapshot: Bytes,
    /// Local version the snapshot was taken at.
    pub record_version: u64,
    /// Time of the first local write this entry carries.
    pub enqueued_at: Timestamp,
    /// Failed delivery attempts. Never decreases.
    pub attempts: u32,
    /// Attempts allowed before the entry becomes `Failed`.
    pub attempt_limit: u32,
    /// Last delivery error.
    pub last_error: Option<String>,
    /// Delivery state.
    pub state: EntryState,
    /// Earliest time the next attempt may start.
    #[serde(default)]
    pub next_attempt_at: Option<Timestamp>,
    /// When the entry reached `Done` or `Failed`.
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
    /// Whether the entry has ever been handed to the remote.
    #[serde(default)]
    pub dispatched: bool,
}

impl QueueEntry {
    /// The record this entry targets.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.collection.clone(), self.record_id.clone())
    }

    /// Whether backoff allows an attempt at `now`.
    #[must_use]
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// What `enqueue` did with a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was appended.
    Appended(QueueEntry),
    /// The mutation was folded into an existing pending entry.
    Coalesced(QueueEntry),
    /// A delete annulled never-sent entries; nothing is queued.
    Cancelled {
        /// Entries that were dropped.
        cancelled: Vec<EntryId>,
    },
}

impl EnqueueOutcome {
    /// The entry now carrying the mutation, if any.
    #[must_use]
    pub fn entry(&self) -> Option<&QueueEntry> {
        match self {
            EnqueueOutcome::Appended(entry) | EnqueueOutcome::Coalesced(entry) => Some(entry),
            EnqueueOutcome::Cancelled { .. } => None,
        }
    }
}

/// Number of entries per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// `Pending` entries.
    pub pending: usize,
    /// `InFlight` entries.
    pub in_flight: usize,
    /// `Failed` entries.
    pub failed: usize,
    /// `Done` entries not yet collected.
    pub done: usize,
}

impl QueueCounts {
    /// Entries still waiting for the remote (`Pending` + `InFlight`).
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.pending + self.in_flight
    }
}

/// What replay found wrong with the queue log.
#[derive(Debug, Default)]
pub struct QueueRecovery {
    /// Frames to move to the quarantine.
    pub dead_letters: Vec<DeadLetter>,
    /// Whether the log must be rewritten once the letters are safe.
    pub needs_rewrite: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Transition {
    entry_id: EntryId,
    state: EntryState,
    attempts: u32,
    attempt_limit: u32,
    last_error: Option<String>,
    next_attempt_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
    dispatched: bool,
}

impl Transition {
    fn of(entry: &QueueEntry) -> Self {
        Self {
            entry_id: entry.entry_id,
            state: entry.state,
            attempts: entry.attempts,
            attempt_limit: entry.attempt_limit,
            last_error: entry.last_error.clone(),
            next_attempt_at: entry.next_attempt_at,
            finished_at: entry.finished_at,
            dispatched: entry.dispatched,
        }
    }

    fn apply(self, entry: &mut QueueEntry) {
        entry.state = self.state;
        entry.attempts = entry.attempts.max(self.attempts);
        entry.attempt_limit = self.attempt_limit;
        entry.last_error = self.last_error;
        entry.next_attempt_at = self.next_attempt_at;
        entry.finished_at = self.finished_at;
        entry.dispatched = self.dispatched;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Removed {
    entry_ids: Vec<EntryId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryWatermark {
    next_entry_id: u64,
}

/// Ordered, durable log of mutations awaiting the remote.
#[derive(Debug)]
pub struct MutationQueue {
    space: Arc<dyn LogSpace>,
    log: LogFile,
    entries: BTreeMap<EntryId, QueueEntry>,
    /// Non-`Done` entries per record, in FIFO order.
    by_record: HashMap<RecordKey, Vec<EntryId>>,
    next_entry_id: u64,
    retry: RetryPolicy,
}

impl MutationQueue {
    /// Opens and replays the queue log.
    ///
    /// Damage is returned in [`QueueRecovery`]; the caller must persist the
    /// dead letters before calling [`MutationQueue::compact`].
    #[tracing::instrument(skip_all)]
    pub fn open(
        space: Arc<dyn LogSpace>,
        config: &StoreConfig,
        now: Timestamp,
    ) -> CoreResult<(Self, QueueRecovery)> {
        let backend = space.open(&LogName::Queue)?;
        let log = LogFile::new(LogName::Queue.to_string(), backend, config.sync_on_write);
        let report = log.scan()?;

        let mut queue = Self {
            space,
            log,
            entries: BTreeMap::new(),
            by_record: HashMap::new(),
            next_entry_id: 1,
            retry: config.retry,
        };
        let mut recovery = QueueRecovery::default();
        let log_name = queue.log.name().to_string();
        let letter = |offset: u64, raw: Bytes, reason: String| DeadLetter {
            detected_at: now,
            log: log_name.clone(),
            offset,
            reason,
            raw,
        };

        for item in report.items {
            match item {
                ScanItem::Frame(frame) => {
                    if let Err(reason) = queue.replay_frame(&frame) {
                        let raw = Bytes::from(crate::frame::encode_frame(frame.kind, &frame.body)?);
                        recovery.dead_letters.push(letter(frame.offset, raw, reason));
                    }
                }
                ScanItem::Damaged {
                    offset,
                    raw,
                    damage,
                } => {
                    recovery
                        .dead_letters
                        .push(letter(offset, Bytes::from(raw), damage.to_string()));
                }
            }
        }

        if let Some((offset, raw)) = report.unreadable {
            recovery.dead_letters.push(letter(
                offset,
                Bytes::from(raw),
                "unreadable region".to_string(),
            ));
        }

        if !recovery.dead_letters.is_empty() {
            recovery.needs_rewrite = true;
        } else if let Some(offset) = report.torn_tail {
            tracing::warn!(offset, "truncating torn tail of queue log");
            queue.log.truncate(offset)?;
        }

        queue.rebuild_index();
        tracing::debug!(
            entries = queue.entries.len(),
            dead_letters = recovery.dead_letters.len(),
            "queue replayed"
        );
        Ok((queue, recovery))
    }

    fn replay_frame(&mut self, frame: &Frame) -> Result<(), String> {
        match frame.kind {
            FrameKind::EntryUpsert => {
                let entry: QueueEntry = frame
                    .decode()
                    .map_err(|e| format!("undecodable entry: {e}"))?;
                self.observe_id(entry.entry_id);
                self.entries.insert(entry.entry_id, entry);
            }
            FrameKind::EntryTransition => {
                let transition: Transition = frame
                    .decode()
                    .map_err(|e| format!("undecodable transition: {e}"))?;
                let entry_id = transition.entry_id;
                let entry = self
                    .entries
                    .get_mut(&entry_id)
                    .ok_or_else(|| format!("transition for unknown entry {entry_id}"))?;
                transition.apply(entry);
            }
            FrameKind::EntryRemoved => {
                let removed: Removed = frame
                    .decode()
                    .map_err(|e| format!("undecodable removal: {e}"))?;
                for id in removed.entry_ids {
                    self.entries.remove(&id);
                }
            }
            FrameKind::EntryWatermark => {
                let mark: EntryWatermark = frame
                    .decode()
                    .map_err(|e| format!("undecodable watermark: {e}"))?;
                self.next_entry_id = self.next_entry_id.max(mark.next_entry_id);
            }
            other => return Err(format!("unexpected {other:?} frame in queue log")),
        }
        Ok(())
    }

    fn observe_id(&mut self, id: EntryId) {
        self.next_entry_id = self.next_entry_id.max(id.as_u64().saturating_add(1));
    }

    fn rebuild_index(&mut self) {
        self.by_record.clear();
        for entry in self.entries.values() {
            if entry.state != EntryState::Done {
                self.by_record
                    .entry(entry.key())
                    .or_default()
                    .push(entry.entry_id);
            }
        }
    }

    fn unindex(&mut self, entry: &QueueEntry) {
        let key = entry.key();
        if let Some(ids) = self.by_record.get_mut(&key) {
            ids.retain(|id| *id != entry.entry_id);
            if ids.is_empty() {
                self.by_record.remove(&key);
            }
        }
    }

    fn live_ids(&self, key: &RecordKey) -> &[EntryId] {
        self.by_record.get(key).map_or(&[], Vec::as_slice)
    }

    fn get(&self, entry_id: EntryId) -> CoreResult<&QueueEntry> {
        self.entries
            .get(&entry_id)
            .ok_or(CoreError::EntryNotFound { entry_id })
    }

    /// Queues a mutation, applying coalescing and cancellation first.
    ///
    /// - `Update` folds into the record's last live entry when that entry
    ///   is a pending `Create` or `Update`.
    /// - `Delete` drops the record's pending `Create`/`Update` entries. When
    ///   one of them was a never-sent `Create` and nothing else is live,
    ///   nothing is queued at all.
    /// - `Create` always appends.
    pub fn enqueue(
        &mut self,
        action: Action,
        collection: &str,
        record_id: &str,
        payload: Bytes,
        record_version: u64,
        now: Timestamp,
    ) -> CoreResult<EnqueueOutcome> {
        let key = RecordKey::new(collection, record_id);

        match action {
            Action::Create => self.append(action, &key, payload, record_version, now),
            Action::Update => {
                let foldable = self
                    .live_ids(&key)
                    .last()
                    .and_then(|id| self.entries.get(id))
                    .filter(|e| e.state == EntryState::Pending && e.action.is_upsert())
                    .cloned();

                match foldable {
                    Some(mut entry) => {
                        entry.payload_snapshot = payload;
                        entry.record_version = record_version;
                        self.log.append_value(FrameKind::EntryUpsert, &entry)?;
                        self.entries.insert(entry.entry_id, entry.clone());
                        Ok(EnqueueOutcome::Coalesced(entry))
                    }
                    None => self.append(action, &key, payload, record_version, now),
                }
            }
            Action::Delete => self.enqueue_delete(&key, record_version, now),
        }
    }

    fn enqueue_delete(
        &mut self,
        key: &RecordKey,
        record_version: u64,
        now: Timestamp,
    ) -> CoreResult<EnqueueOutcome> {
        let live: Vec<QueueEntry> = self
            .live_ids(key)
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect();

        let (cancel, remaining): (Vec<_>, Vec<_>) = live
            .into_iter()
            .partition(|e| e.state == EntryState::Pending && e.action.is_upsert());
        let unsent_create = cancel
            .iter()
            .any(|e| e.action == Action::Create && !e.dispatched);
        let cancelled: Vec<EntryId> = cancel.iter().map(|e| e.entry_id).collect();

        let mut batch = LogWriter::new();
        let outcome = if unsent_create && remaining.is_empty() {
            EnqueueOutcome::Cancelled {
                cancelled: cancelled.clone(),
            }
        } else if let Some(last) = remaining
            .last()
            .filter(|e| e.state == EntryState::Pending && e.action == Action::Delete)
        {
            let mut absorbed = last.clone();
            absorbed.record_version = absorbed.record_version.max(record_version);
            if absorbed.record_version != last.record_version {
                batch.push(FrameKind::EntryUpsert, &absorbed)?;
            }
            EnqueueOutcome::Coalesced(absorbed)
        } else {
            let entry = self.new_entry(Action::Delete, key, Bytes::new(), record_version, now);
            batch.push(FrameKind::EntryUpsert, &entry)?;
            EnqueueOutcome::Appended(entry)
        };

        if !cancelled.is_empty() {
            batch.push(
                FrameKind::EntryRemoved,
                &Removed {
                    entry_ids: cancelled.clone(),
                },
            )?;
        }
        if batch.is_empty() {
            return Ok(outcome);
        }

        self.log.append_batch(batch)?;

        match &outcome {
            EnqueueOutcome::Appended(entry) => {
                self.next_entry_id += 1;
                self.index_new(entry.clone());
            }
            EnqueueOutcome::Coalesced(entry) => {
                self.entries.insert(entry.entry_id, entry.clone());
            }
            EnqueueOutcome::Cancelled { .. } => {}
        }
        for entry in &cancel {
            self.unindex(entry);
            self.entries.remove(&entry.entry_id);
        }
        if !cancelled.is_empty() {
            tracing::debug!(record = %key, cancelled = cancelled.len(), "delete cancelled unsent entries");
        }
        Ok(outcome)
    }

    fn new_entry(
        &self,
        action: Action,
        key: &RecordKey,
        payload: Bytes,
        record_version: u64,
        now: Timestamp,
    ) -> QueueEntry {
        QueueEntry {
            entry_id: EntryId::new(self.next_entry_id),
            collection: key.collection.clone(),
            record_id: key.id.clone(),
            action,
            payload_snapshot: payload,
            record_version,
            enqueued_at: now,
            attempts: 0,
            attempt_limit: self.retry.max_attempts,
            last_error: None,
            state: EntryState::Pending,
            next_attempt_at: None,
            finished_at: None,
            dispatched: false,
        }
    }

    fn index_new(&mut self, entry: QueueEntry) {
        self.by_record
            .entry(entry.key())
            .or_default()
            .push(entry.entry_id);
        self.entries.insert(entry.entry_id, entry);
    }

    fn append(
        &mut self,
        action: Action,
        key: &RecordKey,
        payload: Bytes,
        record_version: u64,
        now: Timestamp,
    ) -> CoreResult<EnqueueOutcome> {
        let entry = self.new_entry(action, key, payload, record_version, now);
        self.log.append_value(FrameKind::EntryUpsert, &entry)?;
        self.next_entry_id += 1;
        self.index_new(entry.clone());
        Ok(EnqueueOutcome::Appended(entry))
    }

    /// Persists a state change computed by `change`, then applies it.
    fn transition(
        &mut self,
        entry_id: EntryId,
        allowed_from: &[EntryState],
        to: EntryState,
        change: impl FnOnce(&mut QueueEntry),
    ) -> CoreResult<QueueEntry> {
        let current = self.get(entry_id)?;
        if !allowed_from.contains(&current.state) {
            return Err(CoreError::InvalidTransition {
                entry_id,
                from: current.state,
                to,
            });
        }

        let mut updated = current.clone();
        change(&mut updated);
        self.log
            .append_value(FrameKind::EntryTransition, &Transition::of(&updated))?;

        if updated.state == EntryState::Done {
            self.unindex(&updated);
        }
        self.entries.insert(entry_id, updated.clone());
        Ok(updated)
    }

    /// `Pending` → `InFlight`.
    pub fn mark_in_flight(&mut self, entry_id: EntryId) -> CoreResult<QueueEntry> {
        self.transition(
            entry_id,
            &[EntryState::Pending],
            EntryState::InFlight,
            |e| {
                e.state = EntryState::InFlight;
                e.dispatched = true;
            },
        )
    }

    /// `InFlight` → `Done`.
    pub fn mark_done(&mut self, entry_id: EntryId, now: Timestamp) -> CoreResult<QueueEntry> {
        self.transition(entry_id, &[EntryState::InFlight], EntryState::Done, |e| {
            e.state = EntryState::Done;
            e.next_attempt_at = None;
            e.finished_at = Some(now);
        })
    }

    /// Records a transient failure.
    ///
    /// Consumes one attempt. The entry goes back to `Pending` with a backoff
    /// deadline, or to `Failed` once its attempt limit is reached.
    pub fn mark_failed_attempt(
        &mut self,
        entry_id: EntryId,
        error: &str,
        now: Timestamp,
    ) -> CoreResult<QueueEntry> {
        let retry = self.retry;
        let limit_reached = {
            let entry = self.get(entry_id)?;
            entry.attempts.saturating_add(1) >= entry.attempt_limit
        };
        let to = if limit_reached {
            EntryState::Failed
        } else {
            EntryState::Pending
        };

        self.transition(
            entry_id,
            &[EntryState::InFlight, EntryState::Pending],
            to,
            |e| {
                let delay = retry.delay_for_attempt(e.attempts);
                e.attempts = e.attempts.saturating_add(1);
                e.last_error = Some(error.to_string());
                e.state = to;
                if to == EntryState::Failed {
                    e.next_attempt_at = None;
                    e.finished_at = Some(now);
                } else {
                    e.next_attempt_at = (delay > Duration::ZERO).then(|| after(now, delay));
                }
            },
        )
    }

    /// Moves an entry straight to `Failed` without consuming an attempt.
    pub fn mark_failed_permanently(
        &mut self,
        entry_id: EntryId,
        error: &str,
        now: Timestamp,
    ) -> CoreResult<QueueEntry> {
        self.transition(
            entry_id,
            &[EntryState::InFlight, EntryState::Pending],
            EntryState::Failed,
            |e| {
                e.state = EntryState::Failed;
                e.last_error = Some(error.to_string());
                e.next_attempt_at = None;
                e.finished_at = Some(now);
            },
        )
    }

    /// `InFlight` → `Pending` without consuming an attempt.
    pub fn release(&mut self, entry_id: EntryId, error: Option<&str>) -> CoreResult<QueueEntry> {
        self.transition(
            entry_id,
            &[EntryState::InFlight],
            EntryState::Pending,
            |e| {
                e.state = EntryState::Pending;
                if let Some(error) = error {
                    e.last_error = Some(error.to_string());
                }
            },
        )
    }

    /// Resets every `InFlight` entry left by a previous run to `Pending`.
    ///
    /// Delivery of such entries is unknown, so they are sent again; the
    /// remote applies them idempotently.
    pub fn requeue_stale_in_flight(&mut self) -> CoreResult<Vec<EntryId>> {
        let stale: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.state == EntryState::InFlight)
            .map(|e| e.entry_id)
            .collect();

        for id in &stale {
            self.release(*id, Some("interrupted before acknowledgment"))?;
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "requeued in-flight entries from previous run");
        }
        Ok(stale)
    }

    /// Returns a `Failed` entry to `Pending`, granting it a fresh attempt
    /// budget on top of the attempts already made.
    ///
    /// The entry is re-snapshotted from `current`, the record's present
    /// local state (`None` if it no longer exists locally). Every entry
    /// carries a full snapshot, so a retried entry can never move the
    /// remote back to a state older than what later entries delivered.
    pub fn retry_failed(
        &mut self,
        entry_id: EntryId,
        current: Option<&LocalRecord>,
    ) -> CoreResult<QueueEntry> {
        let entry = self.get(entry_id)?;
        if entry.state != EntryState::Failed {
            return Err(CoreError::InvalidTransition {
                entry_id,
                from: entry.state,
                to: EntryState::Pending,
            });
        }

        let mut updated = entry.clone();
        updated.state = EntryState::Pending;
        updated.attempt_limit = updated
            .attempts
            .saturating_add(self.retry.max_attempts.max(1));
        updated.next_attempt_at = None;
        updated.finished_at = None;
        match current {
            Some(record) => {
                if !updated.action.is_upsert() {
                    updated.action = Action::Update;
                }
                updated.payload_snapshot = record.payload.clone();
                updated.record_version = record.local_version;
            }
            None => {
                updated.action = Action::Delete;
                updated.payload_snapshot = Bytes::new();
            }
        }

        self.log.append_value(FrameKind::EntryUpsert, &updated)?;
        self.entries.insert(entry_id, updated.clone());
        Ok(updated)
    }

    /// `Pending` entries in FIFO order.
    #[must_use]
    pub fn pending(&self) -> Vec<QueueEntry> {
        self.with_state(EntryState::Pending)
    }

    /// `Failed` entries in FIFO order.
    #[must_use]
    pub fn failed(&self) -> Vec<QueueEntry> {
        self.with_state(EntryState::Failed)
    }

    fn with_state(&self, state: EntryState) -> Vec<QueueEntry> {
        self.entries
            .values()
            .filter(|e| e.state == state)
            .cloned()
            .collect()
    }

    /// Every entry still held, in FIFO order.
    #[must_use]
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.values().cloned().collect()
    }

    /// Looks up one entry.
    #[must_use]
    pub fn entry(&self, entry_id: EntryId) -> Option<&QueueEntry> {
        self.entries.get(&entry_id)
    }

    /// Entry counts per state.
    #[must_use]
    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for entry in self.entries.values() {
            match entry.state {
                EntryState::Pending => counts.pending += 1,
                EntryState::InFlight => counts.in_flight += 1,
                EntryState::Failed => counts.failed += 1,
                EntryState::Done => counts.done += 1,
            }
        }
        counts
    }

    /// Whether any non-`Done` entry for the same record was queued after
    /// `entry_id`.
    #[must_use]
    pub fn has_newer_live_entry(&self, key: &RecordKey, entry_id: EntryId) -> bool {
        self.live_ids(key).iter().any(|id| *id > entry_id)
    }

    /// The record's most recent non-`Done` entry.
    #[must_use]
    pub fn last_live(&self, key: &RecordKey) -> Option<&QueueEntry> {
        self.live_ids(key).last().and_then(|id| self.entries.get(id))
    }

    /// Records with at least one non-`Done` entry.
    #[must_use]
    pub fn live_keys(&self) -> Vec<RecordKey> {
        self.by_record.keys().cloned().collect()
    }

    /// Highest record version named by a `Delete` entry of each record,
    /// `Done` entries included.
    #[must_use]
    pub fn delete_versions(&self) -> HashMap<RecordKey, u64> {
        let mut versions = HashMap::new();
        for entry in self.entries.values().filter(|e| e.action == Action::Delete) {
            let version = versions.entry(entry.key()).or_insert(entry.record_version);
            *version = (*version).max(entry.record_version);
        }
        versions
    }

    /// Whether the record has any non-`Done` entry.
    #[must_use]
    pub fn has_live_entry(&self, key: &RecordKey) -> bool {
        !self.live_ids(key).is_empty()
    }

    /// Earliest backoff deadline after `now` among pending entries.
    #[must_use]
    pub fn next_retry_at(&self, now: Timestamp) -> Option<Timestamp> {
        self.entries
            .values()
            .filter(|e| e.state == EntryState::Pending)
            .filter_map(|e| e.next_attempt_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Drops `Done` entries finished more than `retention` ago.
    pub fn collect_garbage(&mut self, retention: Duration, now: Timestamp) -> CoreResult<usize> {
        let expired: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| {
                e.state == EntryState::Done
                    && e.finished_at
                        .map_or(true, |at| after(at, retention) <= now)
            })
            .map(|e| e.entry_id)
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        self.log.append_value(
            FrameKind::EntryRemoved,
            &Removed {
                entry_ids: expired.clone(),
            },
        )?;
        for id in &expired {
            self.entries.remove(id);
        }
        tracing::debug!(removed = expired.len(), "collected done entries");
        Ok(expired.len())
    }

    /// Rewrites the queue log to the entries currently held.
    #[tracing::instrument(skip(self))]
    pub fn compact(&mut self) -> CoreResult<u64> {
        let before = self.log.size()?;
        let contents = self.snapshot()?;
        let after = contents.len() as u64;

        let backend = self.space.replace(&LogName::Queue, &contents)?;
        self.log.replace_backend(backend);

        tracing::debug!(before, after, "queue log compacted");
        Ok(before.saturating_sub(after))
    }

    /// Compacts when the log has outgrown its live contents.
    pub fn compact_if_needed(&mut self, config: &StoreConfig) -> CoreResult<u64> {
        let size = self.log.size()?;
        if size < config.compaction_min_bytes {
            return Ok(0);
        }
        let live = self.snapshot()?.len() as u64;
        if config.should_compact(size, live) {
            self.compact()
        } else {
            Ok(0)
        }
    }

    fn snapshot(&self) -> CoreResult<Vec<u8>> {
        let mut writer = LogWriter::new();
        writer.push(
            FrameKind::EntryWatermark,
            &EntryWatermark {
                next_entry_id: self.next_entry_id,
            },
        )?;
        for entry in self.entries.values() {
            writer.push(FrameKind::EntryUpsert, entry)?;
        }
        Ok(writer.into_bytes())
    }

    /// Current log size in bytes.
    pub fn log_size(&self) -> CoreResult<u64> {
        self.log.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::MemorySpace;

    fn queue() -> MutationQueue {
        queue_with(StoreConfig::default())
    }

    fn queue_with(config: StoreConfig) -> MutationQueue {
        let (queue, recovery) = MutationQueue::open(Arc::new(MemorySpace::new()), &config, 0).unwrap();
        assert!(recovery.dead_letters.is_empty());
        queue
    }

    fn payload(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn consecutive_updates_coalesce_keeping_position_and_time() {
        let mut q = queue();
        let create = q.enqueue(Action::Create, "orders", "t4", payload("a"), 1, 100).unwrap();
        q.enqueue(Action::Create, "orders", "t7", payload("x"), 2, 110).unwrap();
        let update = q.enqueue(Action::Update, "orders", "t4", payload("b"), 3, 120).unwrap();

        let create = create.entry().unwrap().clone();
        match update {
            EnqueueOutcome::Coalesced(entry) => {
                assert_eq!(entry.entry_id, create.entry_id);
                assert_eq!(entry.action, Action::Create);
                assert_eq!(entry.payload_snapshot, payload("b"));
                assert_eq!(entry.record_version, 3);
                assert_eq!(entry.enqueued_at, 100);
            }
            other => panic!("expected coalesce, got {other:?}"),
        }

        let pending = q.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].record_id, "t4");
        assert_eq!(pending[1].record_id, "t7");
    }

    #[test]
    fn update_after_in_flight_appends() {
        let mut q = queue();
        let first = q.enqueue(Action::Update, "orders", "t4", payload("a"), 1, 0).unwrap();
        let id = first.entry().unwrap().entry_id;
        q.mark_in_flight(id).unwrap();

        let second = q.enqueue(Action::Update, "orders", "t4", payload("b"), 2, 0).unwrap();
        assert!(matches!(second, EnqueueOutcome::Appended(_)));
        assert!(q.has_newer_live_entry(&RecordKey::new("orders", "t4"), id));
    }

    #[test]
    fn delete_cancels_unsent_create() {
        let mut q = queue();
        let create = q.enqueue(Action::Create, "orders", "t4", payload("a"), 1, 0).unwrap();
        q.enqueue(Action::Update, "orders", "t4", payload("b"), 2, 0).unwrap();

        let outcome = q.enqueue(Action::Delete, "orders", "t4", Bytes::new(), 3, 0).unwrap();
        assert_eq!(
            outcome,
            EnqueueOutcome::Cancelled {
                cancelled: vec![create.entry().unwrap().entry_id]
            }
        );
        assert!(q.entries().is_empty());
        assert!(!q.has_live_entry(&RecordKey::new("orders", "t4")));
    }

    #[test]
    fn delete_after_dispatched_create_is_sent() {
        let mut q = queue();
        let create = q.enqueue(Action::Create, "orders", "t4", payload("a"), 1, 0).unwrap();
        let id = create.entry().unwrap().entry_id;
        q.mark_in_flight(id).unwrap();
        q.mark_failed_attempt(id, "timeout", 0).unwrap();

        let outcome = q.enqueue(Action::Delete, "orders", "t4", Bytes::new(), 2, 0).unwrap();
        match outcome {
            EnqueueOutcome::Appended(entry) => assert_eq!(entry.action, Action::Delete),
            other => panic!("expected delete to be queued, got {other:?}"),
        }
        assert_eq!(q.pending().len(), 1);
    }

    #[test]
    fn delete_of_synced_record_is_queued() {
        let mut q = queue();
        let update = q.enqueue(Action::Update, "orders", "t4", payload("a"), 1, 0).unwrap();
        let outcome = q.enqueue(Action::Delete, "orders", "t4", Bytes::new(), 2, 0).unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Appended(_)));
        assert!(q.entry(update.entry().unwrap().entry_id).is_none());
    }

    #[test]
    fn second_delete_coalesces_into_pending_delete() {
        let mut q = queue();
        let first = q.enqueue(Action::Delete, "orders", "t4", Bytes::new(), 1, 0).unwrap();
        let second = q.enqueue(Action::Delete, "orders", "t4", Bytes::new(), 2, 0).unwrap();
        assert_eq!(
            second.entry().unwrap().entry_id,
            first.entry().unwrap().entry_id
        );
        assert!(matches!(second, EnqueueOutcome::Coalesced(_)));
        assert_eq!(second.entry().unwrap().record_version, 2);
        assert_eq!(q.pending().len(), 1);
        assert_eq!(q.pending()[0].record_version, 2);
    }

    #[test]
    fn delete_recreate_delete_keeps_single_delete() {
        let mut q = queue();
        q.enqueue(Action::Delete, "orders", "t4", Bytes::new(), 1, 0).unwrap();
        q.enqueue(Action::Create, "orders", "t4", payload("again"), 2, 0).unwrap();
        let outcome = q.enqueue(Action::Delete, "orders", "t4", Bytes::new(), 3, 0).unwrap();

        assert!(matches!(outcome, EnqueueOutcome::Coalesced(_)));
        let pending = q.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action, Action::Delete);
        assert_eq!(pending[0].record_version, 3);
    }

    #[test]
    fn attempts_reach_failed_at_limit() {
        let config = StoreConfig::new().retry(RetryPolicy::immediate(2));
        let mut q = queue_with(config);
        let id = q
            .enqueue(Action::Create, "orders", "t4", payload("a"), 1, 0)
            .unwrap()
            .entry()
            .unwrap()
            .entry_id;

        q.mark_in_flight(id).unwrap();
        let once = q.mark_failed_attempt(id, "503", 10).unwrap();
        assert_eq!(once.state, EntryState::Pending);
        assert_eq!(once.attempts, 1);
        assert_eq!(once.next_attempt_at, None);

        q.mark_in_flight(id).unwrap();
        let twice = q.mark_failed_attempt(id, "503", 20).unwrap();
        assert_eq!(twice.state, EntryState::Failed);
        assert_eq!(twice.attempts, 2);
        assert_eq!(twice.finished_at, Some(20));
        assert!(q.pending().is_empty());
        assert_eq!(q.failed().len(), 1);
    }

    #[test]
    fn failed_attempt_sets_backoff_deadline() {
        let retry = RetryPolicy::default()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(60));
        let mut q = queue_with(StoreConfig::new().retry(retry));
        let id = q
            .enqueue(Action::Update, "orders", "t4", payload("a"), 1, 0)
            .unwrap()
            .entry()
            .unwrap()
            .entry_id;

        q.mark_in_flight(id).unwrap();
        let entry = q.mark_failed_attempt(id, "timeout", 1_000).unwrap();
        assert_eq!(entry.next_attempt_at, Some(2_000));
        assert!(!entry.is_due(1_999));
        assert!(entry.is_due(2_000));
        assert_eq!(q.next_retry_at(1_000), Some(2_000));
        assert_eq!(q.next_retry_at(2_000), None);

        q.mark_in_flight(id).unwrap();
        let entry = q.mark_failed_attempt(id, "timeout", 2_000).unwrap();
        assert_eq!(entry.next_attempt_at, Some(4_000));
    }

    #[test]
    fn permanent_failure_consumes_no_attempt() {
        let mut q = queue();
        let id = q
            .enqueue(Action::Create, "orders", "t4", payload("a"), 1, 0)
            .unwrap()
            .entry()
            .unwrap()
            .entry_id;
        q.mark_in_flight(id).unwrap();
        let entry = q.mark_failed_permanently(id, "422 invalid", 5).unwrap();
        assert_eq!(entry.state, EntryState::Failed);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.last_error.as_deref(), Some("422 invalid"));
    }

    fn failed_entry(q: &mut MutationQueue, action: Action) -> EntryId {
        let id = q
            .enqueue(action, "orders", "t4", payload("old"), 1, 0)
            .unwrap()
            .entry()
            .unwrap()
            .entry_id;
        q.mark_in_flight(id).unwrap();
        q.mark_failed_permanently(id, "422", 0).unwrap();
        id
    }

    fn local(payload_text: &'static str, version: u64) -> LocalRecord {
        LocalRecord {
            id: "t4".into(),
            collection: "orders".into(),
            payload: payload(payload_text),
            local_version: version,
            synced: false,
            updated_at: 0,
        }
    }

    #[test]
    fn retry_failed_raises_limit_without_resetting_attempts() {
        let mut q = queue_with(StoreConfig::new().retry(RetryPolicy::immediate(1)));
        let id = q
            .enqueue(Action::Create, "orders", "t4", payload("a"), 1, 0)
            .unwrap()
            .entry()
            .unwrap()
            .entry_id;
        q.mark_in_flight(id).unwrap();
        q.mark_failed_attempt(id, "503", 0).unwrap();

        let retried = q.retry_failed(id, Some(&local("a", 1))).unwrap();
        assert_eq!(retried.state, EntryState::Pending);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.attempt_limit, 2);
        assert!(q.retry_failed(id, None).is_err());
    }

    #[test]
    fn retry_failed_takes_current_local_state() {
        let mut q = queue();
        let id = failed_entry(&mut q, Action::Update);

        let retried = q.retry_failed(id, Some(&local("newest", 9))).unwrap();
        assert_eq!(retried.action, Action::Update);
        assert_eq!(retried.payload_snapshot, payload("newest"));
        assert_eq!(retried.record_version, 9);
    }

    #[test]
    fn retry_failed_of_removed_record_becomes_delete() {
        let mut q = queue();
        let id = failed_entry(&mut q, Action::Create);
        let retried = q.retry_failed(id, None).unwrap();
        assert_eq!(retried.action, Action::Delete);
        assert!(retried.payload_snapshot.is_empty());
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut q = queue();
        let id = q
            .enqueue(Action::Create, "orders", "t4", payload("a"), 1, 0)
            .unwrap()
            .entry()
            .unwrap()
            .entry_id;

        let err = q.mark_done(id, 0).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition {
                from: EntryState::Pending,
                to: EntryState::Done,
                ..
            }
        ));
        assert!(matches!(
            q.mark_in_flight(EntryId::new(999)),
            Err(CoreError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn done_entries_are_collected_after_retention() {
        let mut q = queue();
        let id = q
            .enqueue(Action::Create, "orders", "t4", payload("a"), 1, 0)
            .unwrap()
            .entry()
            .unwrap()
            .entry_id;
        q.mark_in_flight(id).unwrap();
        q.mark_done(id, 1_000).unwrap();
        assert_eq!(q.counts().done, 1);

        let retention = Duration::from_secs(60);
        assert_eq!(q.collect_garbage(retention, 30_000).unwrap(), 0);
        assert_eq!(q.collect_garbage(retention, 61_000).unwrap(), 1);
        assert!(q.entries().is_empty());
    }

    #[test]
    fn counts_track_states() {
        let mut q = queue();
        for id in ["a", "b", "c"] {
            q.enqueue(Action::Create, "orders", id, payload("p"), 1, 0).unwrap();
        }
        let first = q.pending()[0].entry_id;
        q.mark_in_flight(first).unwrap();

        let counts = q.counts();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.in_flight, 1);
        assert_eq!(counts.outstanding(), 3);
    }
}
