//! The remote backend capability and an in-memory double.

use crate::error::RemoteError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// The backend every station converges to.
///
/// Both operations are keyed by `(collection, id)` and must be idempotent:
/// re-sending an upsert whose acknowledgment was lost leaves the remote
/// unchanged, and deleting an absent record succeeds.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Creates or replaces the record with this id.
    async fn upsert(&self, collection: &str, id: &str, payload: Bytes) -> Result<(), RemoteError>;

    /// Removes the record with this id.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;
}

/// A call received by [`MemoryRemoteStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    /// `upsert(collection, id, payload)`.
    Upsert {
        /// Collection name.
        collection: String,
        /// Record id.
        id: String,
        /// Payload sent.
        payload: Bytes,
    },
    /// `delete(collection, id)`.
    Delete {
        /// Collection name.
        collection: String,
        /// Record id.
        id: String,
    },
}

impl RemoteCall {
    /// Collection the call addressed.
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            RemoteCall::Upsert { collection, .. } | RemoteCall::Delete { collection, .. } => {
                collection
            }
        }
    }

    /// Record id the call addressed.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            RemoteCall::Upsert { id, .. } | RemoteCall::Delete { id, .. } => id,
        }
    }

    /// Returns true for upserts.
    #[must_use]
    pub fn is_upsert(&self) -> bool {
        matches!(self, RemoteCall::Upsert { .. })
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    /// Reject without applying.
    Fail(RemoteError),
    /// Apply, then report failure (an acknowledgment lost on the way back).
    ApplyThenFail(RemoteError),
}

type Key = (String, String);

#[derive(Debug, Default)]
struct RemoteState {
    records: BTreeMap<Key, Bytes>,
    calls: Vec<RemoteCall>,
    next: VecDeque<Scripted>,
    per_record: HashMap<Key, VecDeque<Scripted>>,
    always: HashMap<Key, RemoteError>,
    unreachable: bool,
    latency: Duration,
}

impl RemoteState {
    fn script_for(&mut self, key: &Key) -> Option<Scripted> {
        if self.unreachable {
            return Some(Scripted::Fail(RemoteError::transient("connection refused")));
        }
        if let Some(err) = self.always.get(key) {
            return Some(Scripted::Fail(err.clone()));
        }
        if let Some(script) = self.per_record.get_mut(key).and_then(VecDeque::pop_front) {
            return Some(script);
        }
        self.next.pop_front()
    }
}

/// Counts a call as finished even when its future is dropped mid-flight.
struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory remote with an id-keyed record map and scripted failures.
///
/// Every call is logged, including rejected ones. Upserts replace by id,
/// so applying the same entry twice cannot create a duplicate.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MemoryRemoteStore {
    /// Creates an empty, reachable remote.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the remote records.
    #[must_use]
    pub fn records(&self) -> BTreeMap<(String, String), Bytes> {
        self.state.lock().records.clone()
    }

    /// Looks up one remote record.
    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<Bytes> {
        self.state
            .lock()
            .records
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Returns true if no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every call received so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// Calls that addressed one record.
    #[must_use]
    pub fn calls_for(&self, collection: &str, id: &str) -> Vec<RemoteCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.collection() == collection && c.id() == id)
            .cloned()
            .collect()
    }

    /// Forgets the call log.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Fails the next call, whichever record it addresses.
    pub fn fail_next(&self, err: RemoteError) {
        self.state.lock().next.push_back(Scripted::Fail(err));
    }

    /// Fails the next call for one record.
    pub fn fail_next_for(&self, collection: &str, id: &str, err: RemoteError) {
        self.state
            .lock()
            .per_record
            .entry((collection.to_string(), id.to_string()))
            .or_default()
            .push_back(Scripted::Fail(err));
    }

    /// Applies the next call for one record but reports `err` back.
    pub fn apply_then_fail_next_for(&self, collection: &str, id: &str, err: RemoteError) {
        self.state
            .lock()
            .per_record
            .entry((collection.to_string(), id.to_string()))
            .or_default()
            .push_back(Scripted::ApplyThenFail(err));
    }

    /// Fails every call for one record until [`clear_failures`](Self::clear_failures).
    pub fn fail_always_for(&self, collection: &str, id: &str, err: RemoteError) {
        self.state
            .lock()
            .always
            .insert((collection.to_string(), id.to_string()), err);
    }

    /// Drops every scripted failure.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.next.clear();
        state.per_record.clear();
        state.always.clear();
    }

    /// While unreachable, every call fails transiently without applying.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Delay added to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Most calls ever in progress at once.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn call(&self, call: RemoteCall) -> Result<(), RemoteError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveCall(&self.active);
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.apply(call)
    }

    fn apply(&self, call: RemoteCall) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(call.clone());

        let key = (call.collection().to_string(), call.id().to_string());
        let reported = match state.script_for(&key) {
            Some(Scripted::Fail(err)) => return Err(err),
            Some(Scripted::ApplyThenFail(err)) => Err(err),
            None => Ok(()),
        };

        match call {
            RemoteCall::Upsert { payload, .. } => {
                state.records.insert(key, payload);
            }
            RemoteCall::Delete { .. } => {
                state.records.remove(&key);
            }
        }
        reported
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn upsert(&self, collection: &str, id: &str, payload: Bytes) -> Result<(), RemoteError> {
        self.call(RemoteCall::Upsert {
            collection: collection.to_string(),
            id: id.to_string(),
            payload,
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.call(RemoteCall::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let remote = MemoryRemoteStore::new();
        let payload = Bytes::from_static(b"{\"total\":12}");
        remote.upsert("orders", "o1", payload.clone()).await.unwrap();
        let once = remote.records();
        remote.upsert("orders", "o1", payload.clone()).await.unwrap();

        assert_eq!(remote.records(), once);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote.calls().len(), 2);
    }

    #[tokio::test]
    async fn delete_of_absent_record_succeeds() {
        let remote = MemoryRemoteStore::new();
        remote.delete("orders", "missing").await.unwrap();
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_apply_per_record() {
        let remote = MemoryRemoteStore::new();
        remote.fail_next_for("orders", "o2", RemoteError::transient("503"));

        remote.upsert("orders", "o1", Bytes::from_static(b"a")).await.unwrap();
        let err = remote
            .upsert("orders", "o2", Bytes::from_static(b"b"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(remote.get("orders", "o2").is_none());

        remote.upsert("orders", "o2", Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(remote.get("orders", "o2"), Some(Bytes::from_static(b"b")));
    }

    #[tokio::test]
    async fn lost_acknowledgment_still_applies() {
        let remote = MemoryRemoteStore::new();
        remote.apply_then_fail_next_for("orders", "o1", RemoteError::transient("reset"));

        assert!(remote.upsert("orders", "o1", Bytes::from_static(b"a")).await.is_err());
        assert_eq!(remote.get("orders", "o1"), Some(Bytes::from_static(b"a")));
    }

    #[tokio::test]
    async fn unreachable_remote_rejects_everything() {
        let remote = MemoryRemoteStore::new();
        remote.set_reachable(false);
        assert!(remote
            .upsert("orders", "o1", Bytes::from_static(b"a"))
            .await
            .unwrap_err()
            .is_transient());
        remote.set_reachable(true);
        remote.upsert("orders", "o1", Bytes::from_static(b"a")).await.unwrap();
        assert_eq!(remote.calls_for("orders", "o1").len(), 2);
    }
}
