//! Inspect command implementation.

use super::{format_size, open_existing};
use crate::Format;
use serde::Serialize;
use std::path::Path;
use tillsync_core::{DbStats, RecoveryReport};

/// Data directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store and queue statistics.
    #[serde(flatten)]
    pub stats: DbStats,
    /// What recovery did while opening.
    pub recovery: RecoveryReport,
}

/// Collects the inspection result.
pub fn collect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    Ok(InspectResult {
        stats: db.stats()?,
        recovery: db.recovery().clone(),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    let stats = &result.stats;
    println!("tillsync Station Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", stats.location);
    println!();
    println!("Collections:");
    if stats.collections.is_empty() {
        println!("  (none)");
    }
    for (name, count) in &stats.collections {
        println!("  {name:<24} {count} records");
    }
    println!("  Unsynced records: {}", stats.unsynced);
    println!();
    println!("Queue:");
    println!("  Pending:    {}", stats.queue.pending);
    println!("  In flight:  {}", stats.queue.in_flight);
    println!("  Failed:     {}", stats.queue.failed);
    println!("  Done:       {}", stats.queue.done);
    println!("  Log size:   {}", format_size(stats.queue_bytes));
    println!();
    println!("Dead letters: {}", stats.dead_letters);

    let recovery = &result.recovery;
    if recovery.quarantined + recovery.requeued + recovery.repaired > 0 {
        println!();
        println!("Recovery on open:");
        println!("  Quarantined frames: {}", recovery.quarantined);
        println!("  Requeued entries:   {}", recovery.requeued);
        println!("  Repaired records:   {}", recovery.repaired);
        if recovery.removals_finished + recovery.deletes_requeued > 0 {
            println!("    removals finished: {}", recovery.removals_finished);
            println!("    deletes requeued:  {}", recovery.deletes_requeued);
        }
    }
}
