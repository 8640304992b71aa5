use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use sheett_core::{MergeableStore, Patch, VersionVector};
use std::hint::black_box;

fn populated_store(replica: &str, cells: usize) -> (MergeableStore, Patch) {
    let mut store = MergeableStore::with_replica("spreadsheetStore-bench", replica);
    let mut patch = Patch::new();
    for i in 0..cells {
        let row_id = format!("{}-{}", i / 26, i % 26);
        patch.extend(store.set_cell("cells", &row_id, "value", format!("v{i}")));
    }
    (store, patch)
}

fn bench_local_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("Store Operations");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_cell", |b| {
        let mut store = MergeableStore::with_replica("spreadsheetStore-bench", "A");
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let patch = store.set_cell("cells", "0-0", "value", black_box(i as f64));
            black_box(patch);
        })
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("Merge");
    let (_, patch) = populated_store("A", 1_000);
    group.throughput(Throughput::Elements(patch.len() as u64));

    group.bench_function("merge_1k_into_empty", |b| {
        b.iter_batched(
            || MergeableStore::with_replica("spreadsheetStore-bench", "B"),
            |mut store| {
                black_box(store.merge(black_box(&patch)));
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("merge_1k_duplicate", |b| {
        let mut store = MergeableStore::with_replica("spreadsheetStore-bench", "B");
        store.merge(&patch);
        b.iter(|| {
            black_box(store.merge(black_box(&patch)));
        })
    });

    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("Reconciliation");
    let (store, _) = populated_store("A", 10_000);
    let mut cursor = VersionVector::new();
    cursor.observe(&sheett_core::Stamp::new(9_900, "A"));

    group.bench_function("diff_since_tail_of_10k", |b| {
        b.iter(|| black_box(store.diff_since(black_box(&cursor))))
    });

    group.bench_function("patch_encode_1k", |b| {
        let (_, patch) = populated_store("A", 1_000);
        b.iter(|| {
            black_box(
                bincode::serde::encode_to_vec(black_box(&patch), bincode::config::standard())
                    .unwrap(),
            )
        })
    });

    group.finish();
}

criterion_group!(benches, bench_local_writes, bench_merge, bench_diff);
criterion_main!(benches);
