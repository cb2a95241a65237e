//! Observable sync status.

use crate::error::SyncResult;
use crate::subscription::Subscription;
use serde::Serialize;
use std::sync::Arc;
use tillsync_core::{OfflineDb, Timestamp};
use tokio::sync::watch;

/// Snapshot of the engine's sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// A drain is running.
    pub is_syncing: bool,
    /// Entries `Pending` or `InFlight`.
    pub pending_count: usize,
    /// Entries `Failed`, awaiting an operator.
    pub failed_count: usize,
    /// Quarantined queue frames.
    pub dead_letters: usize,
    /// End of the last drain that left nothing to retry.
    pub last_sync_at: Option<Timestamp>,
    /// Most recent delivery error still relevant.
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// Returns true if nothing is waiting for the remote.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.is_syncing && self.pending_count == 0
    }
}

/// Publishes [`SyncStatus`] to any number of observers.
///
/// Observers are notified only when the snapshot actually changes, and a
/// slow observer sees the latest value rather than every intermediate one.
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl StatusBroadcaster {
    /// Creates a broadcaster holding `initial`.
    #[must_use]
    pub fn new(initial: SyncStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Creates a broadcaster with the database's current counts.
    #[must_use]
    pub fn for_db(db: &OfflineDb) -> Self {
        let mut status = SyncStatus::default();
        fill_counts(&mut status, db);
        Self::new(status)
    }

    /// The latest snapshot.
    #[must_use]
    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// A receiver of snapshots.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Applies `f` to the snapshot, notifying observers if it changed.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) -> bool {
        self.tx.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        })
    }

    /// Re-reads the queue and quarantine counts from `db`.
    pub fn refresh_counts(&self, db: &OfflineDb) -> bool {
        self.update(|status| {
            fill_counts(status, db);
            if status.failed_count == 0 && !status.is_syncing && status.pending_count == 0 {
                status.last_error = None;
            }
        })
    }

    /// Runs `callback` with the current snapshot, then on every change,
    /// until the subscription is dropped.
    ///
    /// # Errors
    ///
    /// Returns `NoRuntime` outside a Tokio runtime.
    pub fn subscribe<F>(&self, callback: F) -> SyncResult<Subscription>
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let mut rx = self.watch();
        Subscription::spawn(async move {
            let initial = rx.borrow_and_update().clone();
            callback(&initial);
            while rx.changed().await.is_ok() {
                let status = rx.borrow_and_update().clone();
                callback(&status);
            }
        })
    }
}

fn fill_counts(status: &mut SyncStatus, db: &OfflineDb) {
    let counts = db.counts();
    status.pending_count = counts.outstanding();
    status.failed_count = counts.failed;
    status.dead_letters = db.dead_letter_count();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_core::StoreConfig;

    #[test]
    fn unchanged_update_does_not_notify() {
        let status = StatusBroadcaster::new(SyncStatus::default());
        let mut rx = status.watch();
        assert!(!status.update(|s| s.pending_count = 0));
        assert!(!rx.has_changed().unwrap());

        assert!(status.update(|s| s.pending_count = 3));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().pending_count, 3);
    }

    #[test]
    fn counts_come_from_the_database() {
        let db = OfflineDb::open_in_memory(StoreConfig::default()).unwrap();
        let status = StatusBroadcaster::for_db(&db);
        assert!(status.current().is_idle());

        db.write("orders", "o1", b"{}".to_vec()).unwrap();
        db.write("orders", "o2", b"{}".to_vec()).unwrap();
        assert!(status.refresh_counts(&db));
        assert_eq!(status.current().pending_count, 2);
        assert!(!status.refresh_counts(&db));
    }

    #[test]
    fn idle_refresh_clears_stale_error() {
        let db = OfflineDb::open_in_memory(StoreConfig::default()).unwrap();
        let status = StatusBroadcaster::for_db(&db);
        status.update(|s| s.last_error = Some("503".into()));
        status.refresh_counts(&db);
        assert_eq!(status.current().last_error, None);
    }

    #[tokio::test]
    async fn subscriber_gets_current_then_changes() {
        let status = StatusBroadcaster::new(SyncStatus::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = status
            .subscribe(move |s| {
                let _ = tx.send(s.pending_count);
            })
            .unwrap();

        assert_eq!(rx.recv().await, Some(0));
        status.update(|s| s.pending_count = 1);
        assert_eq!(rx.recv().await, Some(1));
    }
}
