//! Background scheduling: reconnects, writes, intervals, backoff and stop.

use std::sync::Arc;
use std::time::Duration;
use tillsync_core::RetryPolicy;
use tillsync_engine::{ConnectivityMonitor, Engine, MemoryRemoteStore, RemoteError, SyncConfig};

fn engine(config: SyncConfig, online: bool) -> (Engine, Arc<MemoryRemoteStore>) {
    let remote = Arc::new(MemoryRemoteStore::new());
    let engine = Engine::open_in_memory(
        config,
        remote.clone(),
        ConnectivityMonitor::new(online.into()),
    )
    .unwrap();
    (engine, remote)
}

fn hourly() -> SyncConfig {
    SyncConfig::new()
        .with_interval(Duration::from_secs(3600))
        .with_retry(RetryPolicy::immediate(5))
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(start_paused = true)]
async fn reconnect_drains_without_waiting_for_interval() {
    let (engine, remote) = engine(hourly(), false);
    engine.write("orders", "table-4", b"{}".to_vec()).unwrap();
    engine.write("orders", "table-7", b"{}".to_vec()).unwrap();
    engine.start().unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(remote.calls().is_empty());

    engine.connectivity().set_online(true);
    wait_until("reconnect drain", || remote.len() == 2).await;
    assert_eq!(engine.status().pending_count, 0);
    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn write_while_online_is_sent_promptly() {
    let (engine, remote) = engine(hourly(), true);
    engine.start().unwrap();
    // Let the initial tick's drain go by.
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.write("orders", "o1", b"{}".to_vec()).unwrap();
    wait_until("write drain", || remote.len() == 1).await;
    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn interval_retries_transient_failures() {
    let config = SyncConfig::new()
        .with_interval(Duration::from_secs(30))
        .with_retry(RetryPolicy::immediate(5));
    let (engine, remote) = engine(config, true);
    remote.set_reachable(false);
    engine.write("orders", "o1", b"{}".to_vec()).unwrap();
    engine.start().unwrap();

    wait_until("first attempt", || !remote.calls().is_empty()).await;
    assert!(remote.is_empty());
    assert_eq!(engine.pending_entries().len(), 1);

    remote.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(31)).await;
    wait_until("interval drain", || remote.len() == 1).await;
    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn nothing_is_sent_while_offline() {
    let config = SyncConfig::new().with_interval(Duration::from_secs(5));
    let (engine, remote) = engine(config, false);
    engine.start().unwrap();
    for n in 0..3 {
        engine.write("orders", &format!("o{n}"), b"{}".to_vec()).unwrap();
    }

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(remote.calls().is_empty());
    assert_eq!(engine.status().pending_count, 3);
    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_lets_the_running_drain_finish() {
    let (engine, remote) = engine(hourly(), true);
    remote.set_latency(Duration::from_secs(1));
    for n in 0..3 {
        engine.write("orders", &format!("o{n}"), b"{}".to_vec()).unwrap();
    }
    engine.start().unwrap();
    wait_until("drain start", || engine.status().is_syncing).await;

    engine.shutdown().await.unwrap();
    assert!(!engine.is_running());
    assert_eq!(remote.len(), 3);
    assert!(!engine.status().is_syncing);

    engine.write("orders", "late", b"{}".to_vec()).unwrap();
    tokio::time::sleep(Duration::from_secs(7200)).await;
    assert!(remote.get("orders", "late").is_none());
}

#[tokio::test]
async fn backoff_deadline_wakes_the_scheduler() {
    let retry = RetryPolicy::default()
        .base_delay(Duration::from_millis(20))
        .max_delay(Duration::from_millis(20));
    let config = SyncConfig::new()
        .with_interval(Duration::from_secs(3600))
        .with_retry(retry);
    let (engine, remote) = engine(config, true);
    remote.fail_next_for("orders", "o1", RemoteError::transient("503"));
    engine.write("orders", "o1", b"{}".to_vec()).unwrap();
    engine.start().unwrap();

    wait_until("backoff retry", || remote.len() == 1).await;
    assert_eq!(remote.calls().len(), 2);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn scheduler_restarts_after_shutdown() {
    let (engine, _remote) = engine(hourly(), false);
    engine.start().unwrap();
    assert!(engine.is_running());
    engine.shutdown().await.unwrap();
    engine.start().unwrap();
    engine.shutdown().await.unwrap();
}
