use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rs_txstore::clock::ManualClock;
use rs_txstore::storage::{Branch, GlobalTrans, TransStatus, TransStore};
use rs_txstore::{MemStore, SledStore};
use std::sync::Arc;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(20);

fn fill(store: &dyn TransStore, size: usize) {
    for i in 0..size {
        let gid = format!("bench{i:06}");
        let mut g = GlobalTrans::new(gid.as_str(), "saga");
        let mut branches = vec![Branch::new(gid.as_str(), "01"), Branch::new(gid.as_str(), "02")];
        store.create_new_trans(&mut g, &mut branches).unwrap();
    }
}

// 领取全部到期事务并逐个完成
fn drain(store: &dyn TransStore) -> usize {
    let mut n = 0;
    while let Some(mut g) = store.lock_one_global_trans(LEASE).unwrap() {
        store
            .change_global_status(&mut g, TransStatus::Succeed, &[], true)
            .unwrap();
        n += 1;
    }
    n
}

fn bench_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_trans");

    for size in [100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("memory", size), size, |b, &size| {
            b.iter(|| {
                let store = MemStore::with_clock(Arc::new(ManualClock::starting_now()));
                fill(&store, size);
                black_box(&store);
            });
        });

        group.bench_with_input(BenchmarkId::new("sled", size), size, |b, &size| {
            b.iter(|| {
                let store = SledStore::temporary(Arc::new(ManualClock::starting_now())).unwrap();
                fill(&store, size);
                black_box(&store);
            });
        });
    }

    group.finish();
}

fn bench_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_and_finish");

    for size in [100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("memory", size), size, |b, &size| {
            b.iter_with_setup(
                || {
                    let store = MemStore::with_clock(Arc::new(ManualClock::starting_now()));
                    fill(&store, size);
                    store
                },
                |store| black_box(drain(&store)),
            );
        });

        group.bench_with_input(BenchmarkId::new("sled", size), size, |b, &size| {
            b.iter_with_setup(
                || {
                    let store =
                        SledStore::temporary(Arc::new(ManualClock::starting_now())).unwrap();
                    fill(&store, size);
                    store
                },
                |store| black_box(drain(&store)),
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_create, bench_claim);
criterion_main!(benches);
