//! CLI command implementations.

pub mod dead_letters;
pub mod gc;
pub mod inspect;
pub mod queue;
pub mod retry;
pub mod verify;

use std::path::Path;
use tillsync_core::{OfflineDb, StoreConfig};

/// Opens an existing data directory; never creates one.
pub fn open_existing(path: &Path) -> Result<OfflineDb, Box<dyn std::error::Error>> {
    if !path.join("queue.log").exists() && !path.join("collections").exists() {
        return Err(format!("No station data found at {}", path.display()).into());
    }
    let config = StoreConfig::new().create_if_missing(false);
    let db = OfflineDb::open(path, config)?;
    tracing::debug!(path = %path.display(), "opened station data");
    Ok(db)
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Formats a Unix-millisecond timestamp as seconds with a fraction.
pub fn format_time(millis: u64) -> String {
    format!("{}.{:03}", millis / 1000, millis % 1000)
}
