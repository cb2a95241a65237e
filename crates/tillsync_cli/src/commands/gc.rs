//! Garbage collection command implementation.

use super::{format_size, open_existing};
use std::path::Path;

/// What a gc run did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcResult {
    /// `Done` entries dropped.
    pub entries_removed: usize,
    /// Bytes reclaimed by a full compaction, if one ran.
    pub reclaimed: Option<u64>,
}

/// Runs garbage collection and, if asked, a full compaction.
pub fn apply(path: &Path, compact: bool) -> Result<GcResult, Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let entries_removed = db.collect_garbage()?;
    let reclaimed = if compact { Some(db.compact()?) } else { None };
    Ok(GcResult {
        entries_removed,
        reclaimed,
    })
}

/// Runs the gc command.
pub fn run(path: &Path, compact: bool) -> Result<(), Box<dyn std::error::Error>> {
    let result = apply(path, compact)?;
    println!("Removed {} acknowledged entries", result.entries_removed);
    if let Some(bytes) = result.reclaimed {
        println!("Compaction reclaimed {}", format_size(bytes));
    }
    Ok(())
}
