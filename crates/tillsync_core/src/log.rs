//! Append-only framed log over a storage backend.

use crate::error::CoreResult;
use crate::frame::{self, encode_body, encode_frame, FrameKind, ScanReport};
use serde::Serialize;
use tillsync_storage::StorageBackend;

/// One durable log: a backend plus the framing and fsync policy.
pub struct LogFile {
    name: String,
    backend: Box<dyn StorageBackend>,
    sync_on_write: bool,
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("name", &self.name)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

impl LogFile {
    /// Wraps a backend.
    pub fn new(
        name: impl Into<String>,
        backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            sync_on_write,
        }
    }

    /// Name used in errors and dead letters.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends one frame and returns its offset.
    ///
    /// When `sync_on_write` is set the frame is durable on return. If the
    /// sync fails the frame is cut off again so a later successful append
    /// cannot make it durable behind the caller's back.
    pub fn append(&mut self, kind: FrameKind, body: &[u8]) -> CoreResult<u64> {
        let frame = encode_frame(kind, body)?;
        self.write_durably(&frame)
    }

    /// Appends every frame of `batch` with a single write and sync.
    ///
    /// A crash mid-write leaves a prefix of the batch followed by a torn
    /// tail, which replay truncates.
    pub fn append_batch(&mut self, batch: LogWriter) -> CoreResult<u64> {
        self.write_durably(&batch.into_bytes())
    }

    fn write_durably(&mut self, bytes: &[u8]) -> CoreResult<u64> {
        let offset = self.backend.append(bytes)?;

        if self.sync_on_write {
            if let Err(e) = self.backend.sync() {
                if let Err(undo) = self.backend.truncate(offset) {
                    tracing::error!(log = %self.name, offset, error = %undo, "failed to roll back unsynced frame");
                }
                return Err(e.into());
            }
        }

        Ok(offset)
    }

    /// Serializes `value` and appends it.
    pub fn append_value<T: Serialize>(&mut self, kind: FrameKind, value: &T) -> CoreResult<u64> {
        let body = encode_body(value)?;
        self.append(kind, &body)
    }

    /// Reads and splits the whole log.
    pub fn scan(&self) -> CoreResult<ScanReport> {
        let data = self.backend.read_all()?;
        Ok(frame::scan(&data))
    }

    /// Cuts the log at `size` and makes the cut durable.
    pub fn truncate(&mut self, size: u64) -> CoreResult<()> {
        self.backend.truncate(size)?;
        self.backend.sync()?;
        Ok(())
    }

    /// Current size in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Flushes appended frames to durable storage.
    pub fn sync(&mut self) -> CoreResult<()> {
        Ok(self.backend.sync()?)
    }

    /// Swaps in a backend holding rewritten contents.
    pub fn replace_backend(&mut self, backend: Box<dyn StorageBackend>) {
        self.backend = backend;
    }
}

/// Accumulates frames for a log rewrite.
#[derive(Debug, Default)]
pub struct LogWriter {
    buf: Vec<u8>,
}

impl LogWriter {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one serialized frame.
    pub fn push<T: Serialize>(&mut self, kind: FrameKind, value: &T) -> CoreResult<()> {
        let body = encode_body(value)?;
        self.buf.extend(encode_frame(kind, &body)?);
        Ok(())
    }

    /// Returns true if no frame was pushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the encoded frames.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
