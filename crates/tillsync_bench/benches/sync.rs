//! Drain benchmarks against the in-memory remote.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tillsync_bench::{payload, record_ids};
use tillsync_engine::{ConnectivityMonitor, DrainOutcome, Engine, MemoryRemoteStore, SyncConfig};

fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain");
    group.sample_size(20);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    for count in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let data = payload(256);
            let ids = record_ids(count);

            b.iter_batched(
                || {
                    let remote = Arc::new(MemoryRemoteStore::new());
                    let engine = Engine::open_in_memory(
                        SyncConfig::default(),
                        remote,
                        ConnectivityMonitor::online(),
                    )
                    .unwrap();
                    for id in &ids {
                        engine.write("orders", id, data.clone()).unwrap();
                    }
                    engine
                },
                |engine| {
                    runtime.block_on(async {
                        match engine.force_sync_now().await.unwrap() {
                            DrainOutcome::Completed(report) => assert_eq!(report.succeeded, count),
                            other => panic!("unexpected outcome {other:?}"),
                        }
                    });
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_drain);
criterion_main!(benches);
