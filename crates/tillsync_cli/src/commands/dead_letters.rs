//! Dead-letter listing command implementation.

use super::{format_time, open_existing};
use crate::Format;
use serde::Serialize;
use std::path::Path;

/// A quarantined frame as shown to an operator.
#[derive(Debug, Serialize)]
pub struct DeadLetterView {
    /// When recovery found it (Unix ms).
    pub detected_at: u64,
    /// Log it came from.
    pub log: String,
    /// Offset in that log.
    pub offset: u64,
    /// Why it was rejected.
    pub reason: String,
    /// Raw size in bytes.
    pub size: usize,
    /// First bytes, hex.
    pub preview: String,
}

const PREVIEW_BYTES: usize = 32;

/// Collects the dead letters.
pub fn collect(path: &Path) -> Result<Vec<DeadLetterView>, Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    Ok(db
        .dead_letters()
        .into_iter()
        .map(|letter| DeadLetterView {
            detected_at: letter.detected_at,
            log: letter.log,
            offset: letter.offset,
            reason: letter.reason,
            size: letter.raw.len(),
            preview: letter
                .raw
                .iter()
                .take(PREVIEW_BYTES)
                .map(|b| format!("{b:02x}"))
                .collect(),
        })
        .collect())
}

/// Runs the dead-letters command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let letters = collect(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&letters)?),
        Format::Text => {
            if letters.is_empty() {
                println!("No dead letters");
            }
            for letter in &letters {
                println!(
                    "{}@{}: {} ({} bytes, found {})",
                    letter.log,
                    letter.offset,
                    letter.reason,
                    letter.size,
                    format_time(letter.detected_at)
                );
                println!("    {}", letter.preview);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;
    use tillsync_core::{OfflineDb, StoreConfig};

    #[test]
    fn lists_quarantined_garbage() {
        let temp = tempdir().unwrap();
        {
            let db = OfflineDb::open(temp.path(), StoreConfig::default()).unwrap();
            db.write("orders", "o1", b"{}".to_vec()).unwrap();
        }
        let mut queue = OpenOptions::new()
            .append(true)
            .open(temp.path().join("queue.log"))
            .unwrap();
        queue.write_all(&[0xAB; 40]).unwrap();
        drop(queue);

        let letters = collect(temp.path()).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].log, "queue");
        assert_eq!(letters[0].size, 40);
        assert_eq!(letters[0].preview.len(), PREVIEW_BYTES * 2);
    }
}
