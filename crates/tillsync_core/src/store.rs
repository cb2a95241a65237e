//! Durable local store: one keyspace log per collection.
//!
//! Each collection log is a sequence of `RecordPut`, `RecordSynced` and
//! `RecordRemoved` frames. Replay keeps the last state of every id. Damage
//! in a collection log is fatal at open: the records are the station's only
//! copy of unsynced sales, so they are never silently dropped. A torn tail
//! (a write cut short by a crash) is the one exception and is truncated.

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::frame::{Frame, FrameKind, ScanItem};
use crate::log::{LogFile, LogWriter};
use crate::record::{LocalRecord, RemovedFrame, SyncedFrame, VersionWatermark};
use crate::space::{LogName, LogSpace};
use crate::types::{validate_collection_name, validate_record_id, RecordKey, Timestamp};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug)]
struct CollectionLog {
    log: LogFile,
    records: BTreeMap<String, LocalRecord>,
    /// Encoded size of the frames a compaction would keep, per record.
    live: HashMap<String, u64>,
}

impl CollectionLog {
    fn live_bytes(&self) -> u64 {
        self.live.values().sum()
    }
}

/// Per-collection persistent records.
#[derive(Debug)]
pub struct LocalStore {
    space: Arc<dyn LogSpace>,
    collections: BTreeMap<String, CollectionLog>,
    next_version: u64,
    sync_on_write: bool,
}

impl LocalStore {
    /// Opens every collection log in `space` and replays it.
    pub fn open(space: Arc<dyn LogSpace>, config: &StoreConfig) -> CoreResult<Self> {
        let mut store = Self {
            space: Arc::clone(&space),
            collections: BTreeMap::new(),
            next_version: 1,
            sync_on_write: config.sync_on_write,
        };

        for name in space.collections()? {
            let backend = space.open(&LogName::Collection(name.clone()))?;
            let log = LogFile::new(LogName::Collection(name.clone()).to_string(), backend, store.sync_on_write);
            let collection = store.replay(&name, log)?;
            store.collections.insert(name, collection);
        }

        tracing::debug!(
            collections = store.collections.len(),
            next_version = store.next_version,
            "local store opened"
        );
        Ok(store)
    }

    fn replay(&mut self, name: &str, mut log: LogFile) -> CoreResult<CollectionLog> {
        let report = log.scan()?;

        if let Some((offset, _)) = &report.unreadable {
            return Err(CoreError::log_corruption(
                log.name(),
                format!("unreadable bytes at offset {offset}"),
            ));
        }

        let mut records = BTreeMap::new();
        let mut live = HashMap::new();
        for item in &report.items {
            let frame = match item {
                ScanItem::Frame(frame) => frame,
                ScanItem::Damaged { offset, damage, .. } => {
                    return Err(match damage {
                        crate::frame::DamageKind::Checksum { expected, actual } => {
                            CoreError::ChecksumMismatch {
                                log: log.name().to_string(),
                                offset: *offset,
                                expected: *expected,
                                actual: *actual,
                            }
                        }
                        other => CoreError::log_corruption(
                            log.name(),
                            format!("{other} at offset {offset}"),
                        ),
                    });
                }
            };
            self.apply_frame(log.name(), name, frame, &mut records, &mut live)?;
        }

        if let Some(offset) = report.torn_tail {
            tracing::warn!(log = log.name(), offset, "truncating torn tail");
            log.truncate(offset)?;
        }

        Ok(CollectionLog { log, records, live })
    }

    fn apply_frame(
        &mut self,
        log_name: &str,
        collection: &str,
        frame: &Frame,
        records: &mut BTreeMap<String, LocalRecord>,
        live: &mut HashMap<String, u64>,
    ) -> CoreResult<()> {
        let corrupt = |e: CoreError| {
            CoreError::log_corruption(log_name, format!("frame at offset {}: {e}", frame.offset))
        };
        let frame_len = (crate::frame::HEADER_SIZE + frame.body.len() + crate::frame::CRC_SIZE) as u64;

        match frame.kind {
            FrameKind::RecordPut => {
                let record: LocalRecord = frame.decode().map_err(corrupt)?;
                if record.collection != collection {
                    return Err(CoreError::log_corruption(
                        log_name,
                        format!("record {} belongs to {}", record.id, record.collection),
                    ));
                }
                self.observe_version(record.local_version);
                live.insert(record.id.clone(), frame_len);
                records.insert(record.id.clone(), record);
            }
            FrameKind::RecordSynced => {
                let synced: SyncedFrame = frame.decode().map_err(corrupt)?;
                if let Some(record) = records.get_mut(&synced.id) {
                    if record.local_version == synced.local_version {
                        record.synced = true;
                    }
                }
            }
            FrameKind::RecordRemoved => {
                let removed: RemovedFrame = frame.decode().map_err(corrupt)?;
                self.observe_version(removed.local_version);
                records.remove(&removed.id);
                live.remove(&removed.id);
            }
            FrameKind::VersionWatermark => {
                let mark: VersionWatermark = frame.decode().map_err(corrupt)?;
                self.next_version = self.next_version.max(mark.next_version);
            }
            other => {
                return Err(CoreError::log_corruption(
                    log_name,
                    format!("unexpected {other:?} frame at offset {}", frame.offset),
                ));
            }
        }
        Ok(())
    }

    fn observe_version(&mut self, version: u64) {
        self.next_version = self.next_version.max(version.saturating_add(1));
    }

    fn take_version(&mut self) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        version
    }

    fn collection_mut(&mut self, collection: &str) -> CoreResult<&mut CollectionLog> {
        if !self.collections.contains_key(collection) {
            validate_collection_name(collection)?;
            let name = LogName::Collection(collection.to_string());
            let backend = self.space.open(&name)?;
            self.collections.insert(
                collection.to_string(),
                CollectionLog {
                    log: LogFile::new(name.to_string(), backend, self.sync_on_write),
                    records: BTreeMap::new(),
                    live: HashMap::new(),
                },
            );
        }
        self.collections
            .get_mut(collection)
            .ok_or_else(|| CoreError::InvalidCollection {
                name: collection.to_string(),
            })
    }

    /// Writes a record, bumping its version and clearing `synced`.
    ///
    /// Durable on return when `sync_on_write` is set.
    pub fn put(
        &mut self,
        collection: &str,
        id: &str,
        payload: Bytes,
        now: Timestamp,
    ) -> CoreResult<LocalRecord> {
        validate_collection_name(collection)?;
        validate_record_id(id)?;

        let record = LocalRecord {
            id: id.to_string(),
            collection: collection.to_string(),
            payload,
            local_version: self.next_version,
            synced: false,
            updated_at: now,
        };

        let log = self.collection_mut(collection)?;
        let before = log.log.size()?;
        log.log.append_value(FrameKind::RecordPut, &record)?;
        let frame_len = log.log.size()?.saturating_sub(before);
        log.live.insert(record.id.clone(), frame_len);
        log.records.insert(record.id.clone(), record.clone());

        self.take_version();
        Ok(record)
    }

    /// Looks up a record.
    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<&LocalRecord> {
        self.collections.get(collection)?.records.get(id)
    }

    /// Every record of a collection, ordered by id.
    #[must_use]
    pub fn get_all(&self, collection: &str) -> Vec<LocalRecord> {
        self.collections
            .get(collection)
            .map(|c| c.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Marks a record synced, whatever its version.
    ///
    /// Returns false if the record does not exist or is already synced.
    pub fn mark_synced(&mut self, collection: &str, id: &str) -> CoreResult<bool> {
        let Some(version) = self.get(collection, id).map(|r| r.local_version) else {
            return Ok(false);
        };
        self.mark_synced_at(collection, id, version)
    }

    /// Marks a record synced only if it still has `version`.
    ///
    /// A newer local write in the meantime leaves the record unsynced.
    pub fn mark_synced_at(&mut self, collection: &str, id: &str, version: u64) -> CoreResult<bool> {
        let Some(log) = self.collections.get_mut(collection) else {
            return Ok(false);
        };
        match log.records.get(id) {
            Some(record) if record.local_version == version && !record.synced => {}
            _ => return Ok(false),
        }

        log.log.append_value(
            FrameKind::RecordSynced,
            &SyncedFrame {
                id: id.to_string(),
                local_version: version,
            },
        )?;
        if let Some(record) = log.records.get_mut(id) {
            record.synced = true;
        }
        Ok(true)
    }

    /// Removes a record and returns what it held.
    pub fn delete(&mut self, collection: &str, id: &str) -> CoreResult<Option<LocalRecord>> {
        validate_collection_name(collection)?;
        validate_record_id(id)?;

        if self.get(collection, id).is_none() {
            return Ok(None);
        }

        let version = self.next_version;
        let log = self.collection_mut(collection)?;
        log.log.append_value(
            FrameKind::RecordRemoved,
            &RemovedFrame {
                id: id.to_string(),
                local_version: version,
            },
        )?;
        log.live.remove(id);
        let removed = log.records.remove(id);
        self.take_version();
        Ok(removed)
    }

    /// Puts `previous` back after a write whose queue entry could not be
    /// recorded.
    ///
    /// Memory is restored first. The compensating frame is appended after,
    /// and if that fails the undone write reappears at the next open, where
    /// the recovery pass queues it.
    pub fn revert(
        &mut self,
        collection: &str,
        id: &str,
        previous: Option<LocalRecord>,
    ) -> CoreResult<()> {
        let version = self.take_version();
        let log = self.collection_mut(collection)?;
        match previous {
            Some(record) => {
                log.records.insert(id.to_string(), record.clone());
                let before = log.log.size()?;
                log.log.append_value(FrameKind::RecordPut, &record)?;
                let frame_len = log.log.size()?.saturating_sub(before);
                log.live.insert(id.to_string(), frame_len);
            }
            None => {
                log.records.remove(id);
                log.live.remove(id);
                log.log.append_value(
                    FrameKind::RecordRemoved,
                    &RemovedFrame {
                        id: id.to_string(),
                        local_version: version,
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Drops a record from memory only, consuming a version as a removal
    /// would. Used when a removal frame could not be written; the next
    /// open finishes the removal from the queued `Delete`.
    pub fn forget(&mut self, collection: &str, id: &str) -> Option<LocalRecord> {
        let log = self.collections.get_mut(collection)?;
        log.live.remove(id);
        let removed = log.records.remove(id);
        if removed.is_some() {
            self.take_version();
        }
        removed
    }

    /// Keys and versions of every record not yet acknowledged by the remote.
    #[must_use]
    pub fn unsynced(&self) -> Vec<(RecordKey, u64)> {
        self.collections
            .iter()
            .flat_map(|(name, c)| {
                c.records
                    .values()
                    .filter(|r| !r.synced)
                    .map(move |r| (RecordKey::new(name.clone(), r.id.clone()), r.local_version))
            })
            .collect()
    }

    /// Names of collections known to the store.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    /// Number of records in a collection.
    #[must_use]
    pub fn record_count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map_or(0, |c| c.records.len())
    }

    /// Next version the store will hand out.
    #[must_use]
    pub fn next_version(&self) -> u64 {
        self.next_version
    }

    /// Rewrites one collection log to its live records.
    ///
    /// The rewrite opens with a version watermark so versions of removed
    /// records are never handed out again.
    #[tracing::instrument(skip(self))]
    pub fn compact_collection(&mut self, collection: &str) -> CoreResult<u64> {
        let next_version = self.next_version;
        let space = Arc::clone(&self.space);
        let Some(log) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = log.log.size()?;

        let mut writer = LogWriter::new();
        writer.push(FrameKind::VersionWatermark, &VersionWatermark { next_version })?;
        for record in log.records.values() {
            writer.push(FrameKind::RecordPut, record)?;
        }
        let contents = writer.into_bytes();
        let after = contents.len() as u64;

        let backend = space.replace(&LogName::Collection(collection.to_string()), &contents)?;
        log.log.replace_backend(backend);

        tracing::debug!(collection, before, after, "collection log compacted");
        Ok(before.saturating_sub(after))
    }

    /// Compacts every collection whose log has grown past the configured
    /// ratio of its live contents. Returns bytes reclaimed.
    pub fn compact_if_needed(&mut self, config: &StoreConfig) -> CoreResult<u64> {
        let mut due = Vec::new();
        for (name, c) in &self.collections {
            if config.should_compact(c.log.size()?, c.live_bytes()) {
                due.push(name.clone());
            }
        }
        let mut reclaimed = 0;
        for name in due {
            reclaimed += self.compact_collection(&name)?;
        }
        Ok(reclaimed)
    }

    /// Compacts every collection log. Returns bytes reclaimed.
    pub fn compact_all(&mut self) -> CoreResult<u64> {
        let mut reclaimed = 0;
        for name in self.collections() {
            reclaimed += self.compact_collection(&name)?;
        }
        Ok(reclaimed)
    }
}
