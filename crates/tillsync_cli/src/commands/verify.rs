//! Verify command implementation.
//!
//! Reads every log of a data directory frame by frame and reports damage.
//! Nothing is modified and no lock is taken.

use serde::de::IgnoredAny;
use std::path::{Path, PathBuf};
use tillsync_core::frame::{self, ScanItem};
use tillsync_storage::{FileBackend, StorageBackend};

/// Verification result for one log.
#[derive(Debug)]
pub struct VerifyResult {
    /// Log file checked.
    pub path: PathBuf,
    /// Number of frames checked.
    pub frames_checked: usize,
    /// Number of valid frames.
    pub valid_frames: usize,
    /// List of errors found.
    pub errors: Vec<String>,
    /// An incomplete final frame, which the next open truncates.
    pub torn_tail: Option<u64>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks one log file.
pub fn verify_log(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let backend = FileBackend::open(path)?;
    let data = backend.read_all()?;
    let report = frame::scan(&data);

    let mut result = VerifyResult {
        path: path.to_path_buf(),
        frames_checked: 0,
        valid_frames: 0,
        errors: Vec::new(),
        torn_tail: report.torn_tail,
    };

    for item in &report.items {
        result.frames_checked += 1;
        match item {
            ScanItem::Frame(frame) => match frame.decode::<IgnoredAny>() {
                Ok(_) => result.valid_frames += 1,
                Err(e) => result
                    .errors
                    .push(format!("Undecodable body at offset {}: {e}", frame.offset)),
            },
            ScanItem::Damaged { offset, damage, .. } => {
                result.errors.push(format!("Damaged frame at offset {offset}: {damage}"));
            }
        }
    }
    if let Some((offset, raw)) = &report.unreadable {
        result.errors.push(format!(
            "Unreadable region at offset {offset} ({} bytes)",
            raw.len()
        ));
    }

    Ok(result)
}

/// Every log file present in a data directory.
pub fn log_files(path: &Path) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut logs = Vec::new();
    for name in ["queue.log", "quarantine.log"] {
        let log = path.join(name);
        if log.exists() {
            logs.push(log);
        }
    }
    let collections = path.join("collections");
    if collections.is_dir() {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&collections)? {
            let log = entry?.path();
            if log.extension().is_some_and(|ext| ext == "log") {
                found.push(log);
            }
        }
        found.sort();
        logs.extend(found);
    }
    Ok(logs)
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying station data at {}", path.display());
    println!();

    let logs = log_files(path)?;
    if logs.is_empty() {
        return Err(format!("No station data found at {}", path.display()).into());
    }

    let mut failed = false;
    for log in &logs {
        let result = verify_log(log)?;
        print_result(&result);
        failed |= !result.is_ok();
    }

    println!();
    if failed {
        println!("✗ Verification failed");
        Err("Verification failed".into())
    } else {
        println!("✓ Verification passed");
        Ok(())
    }
}

fn print_result(result: &VerifyResult) {
    let name = result
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    println!(
        "{name}: {} frames, {} valid",
        result.frames_checked, result.valid_frames
    );
    if let Some(offset) = result.torn_tail {
        println!("  incomplete final frame at offset {offset} (dropped on next open)");
    }
    for error in &result.errors {
        println!("  ✗ {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use tillsync_core::{OfflineDb, StoreConfig};

    fn station(path: &Path) {
        let db = OfflineDb::open(path, StoreConfig::default()).unwrap();
        db.write("orders", "table-4", b"{}".to_vec()).unwrap();
        db.write("payments", "p-1", b"{}".to_vec()).unwrap();
    }

    #[test]
    fn healthy_station_passes() {
        let temp = tempdir().unwrap();
        station(temp.path());

        let logs = log_files(temp.path()).unwrap();
        assert_eq!(logs.len(), 4);
        for log in &logs {
            let result = verify_log(log).unwrap();
            assert!(result.is_ok(), "{result:?}");
        }
        assert!(run(temp.path()).is_ok());
    }

    #[test]
    fn flipped_byte_is_reported() {
        let temp = tempdir().unwrap();
        station(temp.path());
        let path = temp.path().join("collections").join("orders.log");
        let mut bytes = fs::read(&path).unwrap();
        bytes[frame::HEADER_SIZE + 1] ^= 0x55;
        fs::write(&path, bytes).unwrap();

        let result = verify_log(&path).unwrap();
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("checksum"));
        assert!(run(temp.path()).is_err());
    }

    #[test]
    fn torn_tail_is_not_an_error() {
        let temp = tempdir().unwrap();
        station(temp.path());
        let path = temp.path().join("queue.log");
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        fs::write(&path, bytes).unwrap();

        let result = verify_log(&path).unwrap();
        assert!(result.is_ok());
        assert!(result.torn_tail.is_some());
    }
}
