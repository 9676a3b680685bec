#![allow(dead_code)]

use rs_txstore::clock::ManualClock;
use rs_txstore::storage::{Branch, GlobalTrans};
use rs_txstore::{MemStore, SledStore, TransStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const LOCK_EXPIRE: Duration = Duration::from_secs(20);

/// 一个存储实例及其时钟；sled 的临时目录随 `Backend` 一起释放
pub struct Backend {
    pub store: Arc<dyn TransStore>,
    pub clock: ManualClock,
    _dir: Option<TempDir>,
}

pub fn mem_backend() -> Backend {
    let clock = ManualClock::starting_now();
    Backend {
        store: Arc::new(MemStore::with_clock(Arc::new(clock.clone()))),
        clock,
        _dir: None,
    }
}

pub fn sled_backend() -> Backend {
    let clock = ManualClock::starting_now();
    let dir = tempfile::tempdir().unwrap();
    let store = SledStore::with_clock(dir.path().join("db"), Arc::new(clock.clone())).unwrap();
    Backend {
        store: Arc::new(store),
        clock,
        _dir: Some(dir),
    }
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

/// 创建一个 prepared 状态、带一个分支 "01" 的事务
pub fn init_trans(store: &dyn TransStore, gid: &str) -> GlobalTrans {
    let mut g = GlobalTrans::new(gid, "saga");
    let mut branches = vec![Branch::new(gid, "01")];
    store.create_new_trans(&mut g, &mut branches).unwrap();
    g
}

/// 创建一个指定下次调度时间的事务
pub fn init_trans_at(
    store: &dyn TransStore,
    gid: &str,
    next: chrono::DateTime<chrono::Utc>,
) -> GlobalTrans {
    let mut g = GlobalTrans::new(gid, "saga").with_next_cron_time(next);
    let mut branches = vec![Branch::new(gid, "01")];
    store.create_new_trans(&mut g, &mut branches).unwrap();
    g
}

pub fn branch_ids(store: &dyn TransStore, gid: &str) -> Vec<String> {
    store
        .find_branches(gid)
        .unwrap()
        .into_iter()
        .map(|b| b.branch_id)
        .collect()
}

/// 对两个后端各生成一个测试
#[allow(unused_macros)]
macro_rules! backend_tests {
    ($($name:ident),* $(,)?) => {
        mod on_mem {
            $(
                #[test]
                fn $name() {
                    let backend = crate::common::mem_backend();
                    super::$name(&backend);
                }
            )*
        }

        mod on_sled {
            $(
                #[test]
                fn $name() {
                    let backend = crate::common::sled_backend();
                    super::$name(&backend);
                }
            )*
        }
    };
}
