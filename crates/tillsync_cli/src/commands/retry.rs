//! Retry-failed command implementation.

use super::open_existing;
use std::path::Path;
use tillsync_core::EntryId;

/// Returns failed entries to the queue. Returns the ids requeued.
pub fn apply(
    path: &Path,
    entry: Option<&str>,
    all: bool,
) -> Result<Vec<EntryId>, Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    match (entry, all) {
        (Some(_), true) => Err("Pass either an entry id or --all, not both".into()),
        (None, false) => Err("Pass an entry id or --all".into()),
        (None, true) => Ok(db.retry_all_failed()?),
        (Some(raw), false) => {
            let id: EntryId = raw
                .parse()
                .map_err(|e| format!("Invalid entry id '{raw}': {e}"))?;
            Ok(vec![db.retry_failed(id)?.entry_id])
        }
    }
}

/// Runs the retry-failed command.
pub fn run(path: &Path, entry: Option<&str>, all: bool) -> Result<(), Box<dyn std::error::Error>> {
    let ids = apply(path, entry, all)?;
    if ids.is_empty() {
        println!("No failed entries");
    }
    for id in &ids {
        println!("Requeued {id}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tillsync_core::{EntryState, OfflineDb, StoreConfig};

    fn station_with_failure(path: &Path) -> EntryId {
        let db = OfflineDb::open(path, StoreConfig::default()).unwrap();
        let id = db
            .write("orders", "o1", b"{}".to_vec())
            .unwrap()
            .outcome
            .entry()
            .unwrap()
            .entry_id;
        db.begin_delivery(id).unwrap();
        db.fail_permanently(id, "409: conflict").unwrap();
        id
    }

    #[test]
    fn retries_one_entry_by_id() {
        let temp = tempdir().unwrap();
        let id = station_with_failure(temp.path());

        let ids = apply(temp.path(), Some(&id.to_string()), false).unwrap();
        assert_eq!(ids, vec![id]);

        let db = OfflineDb::open(temp.path(), StoreConfig::default()).unwrap();
        assert_eq!(db.entry(id).unwrap().state, EntryState::Pending);
    }

    #[test]
    fn retries_everything() {
        let temp = tempdir().unwrap();
        let id = station_with_failure(temp.path());
        assert_eq!(apply(temp.path(), None, true).unwrap(), vec![id]);
        assert!(apply(temp.path(), None, true).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_arguments() {
        let temp = tempdir().unwrap();
        station_with_failure(temp.path());
        assert!(apply(temp.path(), None, false).is_err());
        assert!(apply(temp.path(), Some("zz"), false).is_err());
        assert!(apply(temp.path(), Some("1"), true).is_err());
    }
}
