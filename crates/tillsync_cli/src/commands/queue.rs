//! Queue listing command implementation.

use super::{format_time, open_existing};
use crate::Format;
use serde::Serialize;
use std::path::Path;
use tillsync_core::{EntryState, QueueEntry};

/// One queue entry as shown to an operator.
#[derive(Debug, Serialize)]
pub struct EntryView {
    /// Entry id, hex.
    pub entry_id: String,
    /// `collection/id`.
    pub record: String,
    /// Action.
    pub action: String,
    /// State.
    pub state: String,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Attempts allowed.
    pub attempt_limit: u32,
    /// Payload size in bytes.
    pub payload_bytes: usize,
    /// Enqueue time (Unix ms).
    pub enqueued_at: u64,
    /// Earliest next attempt (Unix ms).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<u64>,
    /// Last delivery error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&QueueEntry> for EntryView {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            entry_id: entry.entry_id.to_string(),
            record: entry.key().to_string(),
            action: format!("{:?}", entry.action),
            state: state_name(entry.state).to_string(),
            attempts: entry.attempts,
            attempt_limit: entry.attempt_limit,
            payload_bytes: entry.payload_snapshot.len(),
            enqueued_at: entry.enqueued_at,
            next_attempt_at: entry.next_attempt_at,
            last_error: entry.last_error.clone(),
        }
    }
}

fn state_name(state: EntryState) -> &'static str {
    match state {
        EntryState::Pending => "pending",
        EntryState::InFlight => "in-flight",
        EntryState::Failed => "failed",
        EntryState::Done => "done",
    }
}

fn parse_state(name: &str) -> Result<EntryState, String> {
    match name {
        "pending" => Ok(EntryState::Pending),
        "in-flight" | "inflight" => Ok(EntryState::InFlight),
        "failed" => Ok(EntryState::Failed),
        "done" => Ok(EntryState::Done),
        other => Err(format!(
            "Unknown state '{other}' (expected pending, in-flight, failed or done)"
        )),
    }
}

/// Collects the entries to show.
pub fn collect(
    path: &Path,
    state: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<EntryView>, Box<dyn std::error::Error>> {
    let wanted = state.map(parse_state).transpose()?;
    let db = open_existing(path)?;
    Ok(db
        .entries()
        .iter()
        .filter(|e| wanted.map_or(true, |s| e.state == s))
        .take(limit.unwrap_or(usize::MAX))
        .map(EntryView::from)
        .collect())
}

/// Runs the queue command.
pub fn run(
    path: &Path,
    state: Option<&str>,
    limit: Option<usize>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = collect(path, state, limit)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => {
            if entries.is_empty() {
                println!("Queue is empty");
            }
            for e in &entries {
                println!(
                    "{} {:<9} {:<6} {} ({} bytes, attempts {}/{}, queued {})",
                    e.entry_id,
                    e.state,
                    e.action,
                    e.record,
                    e.payload_bytes,
                    e.attempts,
                    e.attempt_limit,
                    format_time(e.enqueued_at)
                );
                if let Some(at) = e.next_attempt_at {
                    println!("    next attempt at {}", format_time(at));
                }
                if let Some(err) = &e.last_error {
                    println!("    last error: {err}");
                }
            }
        }
    }
    Ok(())
}
