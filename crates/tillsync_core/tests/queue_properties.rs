//! Property tests: whatever the interleaving of local writes and
//! deliveries, draining the queue leaves the remote equal to local state.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tillsync_core::{Action, OfflineDb, RecordKey, StoreConfig};

#[derive(Debug, Clone)]
enum Op {
    Write(u8, u8),
    Delete(u8),
    Deliver,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..4, any::<u8>()).prop_map(|(r, p)| Op::Write(r, p)),
        2 => (0u8..4).prop_map(Op::Delete),
        3 => Just(Op::Deliver),
    ]
}

fn record_id(r: u8) -> String {
    format!("table-{r}")
}

/// Delivers the oldest pending entry to the model remote.
fn deliver_one(db: &OfflineDb, remote: &mut BTreeMap<String, Vec<u8>>) -> bool {
    let Some(next) = db.pending().into_iter().next() else {
        return false;
    };
    let entry = db.begin_delivery(next.entry_id).unwrap();
    match entry.action {
        Action::Create | Action::Update => {
            remote.insert(entry.record_id.clone(), entry.payload_snapshot.to_vec());
        }
        Action::Delete => {
            remote.remove(&entry.record_id);
        }
    }
    db.complete_delivery(entry.entry_id).unwrap();
    true
}

fn assert_queue_shape(db: &OfflineDb) {
    assert!(db.orphaned_records().is_empty());

    let mut last_pending_upsert: BTreeMap<RecordKey, bool> = BTreeMap::new();
    for entry in db.entries() {
        if entry.state.is_outstanding() {
            let key = entry.key();
            let upsert = entry.action.is_upsert() && entry.state == tillsync_core::EntryState::Pending;
            let previous = last_pending_upsert.insert(key, upsert).unwrap_or(false);
            assert!(
                !(previous && upsert && entry.action == Action::Update),
                "uncoalesced update {entry:?}"
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn draining_converges_remote_to_local(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let db = OfflineDb::open_in_memory(StoreConfig::default()).unwrap();
        let mut remote = BTreeMap::new();

        for op in ops {
            match op {
                Op::Write(r, p) => {
                    db.write("orders", &record_id(r), vec![p]).unwrap();
                }
                Op::Delete(r) => {
                    db.delete("orders", &record_id(r)).unwrap();
                }
                Op::Deliver => {
                    deliver_one(&db, &mut remote);
                }
            }
            assert_queue_shape(&db);
        }

        while deliver_one(&db, &mut remote) {}

        let local: BTreeMap<String, Vec<u8>> = db
            .get_all("orders")
            .into_iter()
            .map(|r| (r.id, r.payload.to_vec()))
            .collect();
        prop_assert_eq!(&local, &remote);
        prop_assert!(db.get_all("orders").iter().all(|r| r.synced));
        prop_assert_eq!(db.counts().outstanding(), 0);
    }

    #[test]
    fn entry_ids_stay_fifo(writes in prop::collection::vec((0u8..6, any::<u8>()), 1..30)) {
        let db = OfflineDb::open_in_memory(StoreConfig::default()).unwrap();
        for (r, p) in writes {
            db.write("orders", &record_id(r), vec![p]).unwrap();
        }
        let entries = db.entries();
        prop_assert!(entries.windows(2).all(|w| w[0].entry_id < w[1].entry_id));
        prop_assert!(entries.windows(2).all(|w| w[0].enqueued_at <= w[1].enqueued_at));
    }
}
