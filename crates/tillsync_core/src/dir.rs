//! Data directory management.
//!
//! Layout of a station's data directory:
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK                      # Advisory lock for single-process access
//! ├─ queue.log                 # Mutation queue
//! ├─ quarantine.log            # Dead-letter list
//! └─ collections/<name>.log    # One keyspace per collection
//! ```
//!
//! Log rewrites go through a temporary file that is synced, renamed over
//! the original, and followed by a directory fsync.

use crate::error::{CoreError, CoreResult};
use crate::space::{LogName, LogSpace};
use crate::types::validate_collection_name;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tillsync_storage::{FileBackend, StorageBackend};

const LOCK_FILE: &str = "LOCK";
const QUEUE_FILE: &str = "queue.log";
const QUARANTINE_FILE: &str = "quarantine.log";
const COLLECTIONS_DIR: &str = "collections";
const LOG_EXTENSION: &str = "log";
const TEMP_SUFFIX: &str = ".tmp";

/// An exclusively locked data directory.
///
/// Only one `StoreDir` can exist per directory at a time, across
/// processes. The lock is released when the value is dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a data directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns [`CoreError::Locked`])
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_directory(format!(
                    "data directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_directory(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::Locked);
        }

        fs::create_dir_all(path.join(COLLECTIONS_DIR))?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file path of a log.
    #[must_use]
    pub fn log_path(&self, name: &LogName) -> PathBuf {
        match name {
            LogName::Queue => self.path.join(QUEUE_FILE),
            LogName::Quarantine => self.path.join(QUARANTINE_FILE),
            LogName::Collection(c) => self
                .path
                .join(COLLECTIONS_DIR)
                .join(format!("{c}.{LOG_EXTENSION}")),
        }
    }

    #[cfg(unix)]
    fn sync_directory(dir: &Path) -> CoreResult<()> {
        File::open(dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(_dir: &Path) -> CoreResult<()> {
        Ok(())
    }
}

impl LogSpace for StoreDir {
    fn open(&self, name: &LogName) -> CoreResult<Box<dyn StorageBackend>> {
        if let LogName::Collection(c) = name {
            validate_collection_name(c)?;
        }
        let path = self.log_path(name);
        let existed = path.exists();
        let backend = FileBackend::open_with_create_dirs(&path)?;
        if !existed {
            if let Some(parent) = path.parent() {
                Self::sync_directory(parent)?;
            }
        }
        Ok(Box::new(backend))
    }

    fn replace(&self, name: &LogName, contents: &[u8]) -> CoreResult<Box<dyn StorageBackend>> {
        let path = self.log_path(name);
        let mut temp_name = path.clone().into_os_string();
        temp_name.push(TEMP_SUFFIX);
        let temp_path = PathBuf::from(temp_name);

        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &path)?;
        if let Some(parent) = path.parent() {
            Self::sync_directory(parent)?;
        }

        Ok(Box::new(FileBackend::open(&path)?))
    }

    fn collections(&self) -> CoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.path.join(COLLECTIONS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_collection_name(stem).is_ok() {
                names.push(stem.to_string());
            } else {
                tracing::warn!(path = %path.display(), "ignoring file with invalid collection name");
            }
        }
        names.sort();
        Ok(names)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
