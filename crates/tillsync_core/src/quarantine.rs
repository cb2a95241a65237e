//! Dead-letter list for queue frames that cannot be replayed.

use crate::error::CoreResult;
use crate::frame::{FrameKind, ScanItem};
use crate::log::LogFile;
use crate::space::{LogName, LogSpace};
use crate::types::Timestamp;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A quarantined piece of a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// When recovery found it.
    pub detected_at: Timestamp,
    /// Log it was found in.
    pub log: String,
    /// Offset of the damaged bytes in that log.
    pub offset: u64,
    /// Why it was rejected.
    pub reason: String,
    /// The raw bytes, kept for manual recovery.
    pub raw: Bytes,
}

/// Persistent dead-letter list.
#[derive(Debug)]
pub struct Quarantine {
    log: LogFile,
    letters: Vec<DeadLetter>,
}

impl Quarantine {
    /// Opens the quarantine log and loads its letters.
    pub fn open(space: &dyn LogSpace, sync_on_write: bool) -> CoreResult<Self> {
        let backend = space.open(&LogName::Quarantine)?;
        let mut log = LogFile::new(LogName::Quarantine.to_string(), backend, sync_on_write);
        let report = log.scan()?;

        let mut letters = Vec::new();
        for item in &report.items {
            match item {
                ScanItem::Frame(frame) if frame.kind == FrameKind::DeadLetter => {
                    match frame.decode::<DeadLetter>() {
                        Ok(letter) => letters.push(letter),
                        Err(e) => {
                            tracing::warn!(offset = frame.offset, error = %e, "skipping undecodable dead letter");
                        }
                    }
                }
                ScanItem::Frame(frame) => {
                    tracing::warn!(offset = frame.offset, kind = ?frame.kind, "skipping unexpected frame in quarantine");
                }
                ScanItem::Damaged { offset, damage, .. } => {
                    tracing::warn!(offset, %damage, "skipping damaged dead letter");
                }
            }
        }

        if report.torn_tail.is_some() || report.unreadable.is_some() {
            tracing::warn!(valid_end = report.valid_end, "truncating damaged quarantine tail");
            log.truncate(report.valid_end)?;
        }

        Ok(Self { log, letters })
    }

    /// Persists new letters.
    pub fn add(&mut self, letters: Vec<DeadLetter>) -> CoreResult<()> {
        for letter in letters {
            tracing::warn!(
                log = %letter.log,
                offset = letter.offset,
                reason = %letter.reason,
                bytes = letter.raw.len(),
                "quarantined damaged frame"
            );
            self.log.append_value(FrameKind::DeadLetter, &letter)?;
            self.letters.push(letter);
        }
        Ok(())
    }

    /// Every quarantined letter, oldest first.
    #[must_use]
    pub fn letters(&self) -> &[DeadLetter] {
        &self.letters
    }

    /// Number of quarantined letters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.len()
    }

    /// Returns true when nothing has been quarantined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }
}
