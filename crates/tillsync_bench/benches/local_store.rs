//! Local write path benchmarks: record put plus queue enqueue.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use tillsync_bench::{payload, record_ids};
use tillsync_core::{OfflineDb, StoreConfig};

/// Writes to distinct records, each one appending a new queue entry.
fn bench_write_new_records(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_new_record");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let db = OfflineDb::open_in_memory(StoreConfig::default()).unwrap();
            let data = payload(size);
            let mut n = 0u64;

            b.iter(|| {
                n += 1;
                let receipt = db.write("orders", &format!("o{n}"), data.clone()).unwrap();
                black_box(receipt);
            });
        });
    }
    group.finish();
}

/// Rewrites of one record, which coalesce into its pending entry.
fn bench_write_coalesced(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_coalesced");
    group.throughput(Throughput::Elements(1));

    group.bench_function("same_record", |b| {
        let db = OfflineDb::open_in_memory(StoreConfig::default()).unwrap();
        let data = payload(256);

        b.iter(|| {
            let receipt = db.write("orders", "table-4", black_box(data.clone())).unwrap();
            black_box(receipt);
        });
    });
    group.finish();
}

fn bench_file_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_write");
    group.sample_size(20);

    for sync in [false, true] {
        let label = if sync { "fsync" } else { "no_fsync" };
        group.bench_function(label, |b| {
            let temp_dir = TempDir::new().unwrap();
            let config = StoreConfig::default().sync_on_write(sync);
            let db = OfflineDb::open(temp_dir.path(), config).unwrap();
            let data = payload(256);
            let mut n = 0u64;

            b.iter(|| {
                n += 1;
                db.write("orders", &format!("o{n}"), data.clone()).unwrap();
            });
        });
    }
    group.finish();
}

/// Reopening a data directory replays every log.
fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");
    group.sample_size(20);

    for count in [100, 1000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let temp_dir = TempDir::new().unwrap();
            {
                let config = StoreConfig::default().sync_on_write(false);
                let db = OfflineDb::open(temp_dir.path(), config).unwrap();
                let data = payload(256);
                for id in record_ids(count) {
                    db.write("orders", &id, data.clone()).unwrap();
                }
            }

            b.iter(|| {
                let db = OfflineDb::open(temp_dir.path(), StoreConfig::default()).unwrap();
                black_box(db.stats().unwrap());
            });
        });
    }
    group.finish();
}

fn bench_get_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_all");

    for count in [100, 1000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let db = OfflineDb::open_in_memory(StoreConfig::default()).unwrap();
            let data = payload(128);
            for id in record_ids(count) {
                db.write("orders", &id, data.clone()).unwrap();
            }

            b.iter(|| {
                black_box(db.get_all("orders"));
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_write_new_records,
    bench_write_coalesced,
    bench_file_write,
    bench_recovery,
    bench_get_all,
);

criterion_main!(benches);
