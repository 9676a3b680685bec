// 并发领取测试
// 多个 worker 线程同时领取，验证同一事务在租约内只会被一个 worker 拿到

#[macro_use]
mod common;

use common::{init_trans, Backend, LOCK_EXPIRE};
use rs_txstore::storage::{GlobalTrans, TransStatus};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

fn single_due_trans_single_winner(b: &Backend) {
    init_trans(b.store.as_ref(), "contended");

    let workers = 16;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let store = Arc::clone(&b.store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.lock_one_global_trans(LOCK_EXPIRE).unwrap()
            })
        })
        .collect();

    let results: Vec<Option<GlobalTrans>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().flatten().collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].gid, "contended");
}

fn many_trans_many_workers(b: &Backend) {
    let total = 60;
    for i in 0..total {
        init_trans(b.store.as_ref(), &format!("bulk{i:02}"));
    }

    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let store = Arc::clone(&b.store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut claimed = Vec::new();
                while let Some(mut g) = store.lock_one_global_trans(LOCK_EXPIRE).unwrap() {
                    store
                        .change_global_status(&mut g, TransStatus::Succeed, &[], true)
                        .unwrap();
                    claimed.push(g.gid);
                }
                claimed
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for gid in handle.join().unwrap() {
            assert!(seen.insert(gid), "transaction claimed twice");
        }
    }
    assert_eq!(seen.len(), total);
}

fn racing_status_writers(b: &Backend) {
    let g = init_trans(b.store.as_ref(), "status_race");

    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let store = Arc::clone(&b.store);
            let barrier = Arc::clone(&barrier);
            let mut mine = g.clone();
            thread::spawn(move || {
                barrier.wait();
                let target = if i % 2 == 0 {
                    TransStatus::Submitted
                } else {
                    TransStatus::Aborting
                };
                store
                    .change_global_status(&mut mine, target, &[], false)
                    .is_ok()
            })
        })
        .collect();

    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(successes, 1);
}

backend_tests!(
    single_due_trans_single_winner,
    many_trans_many_workers,
    racing_status_writers,
);
