//! 按配置构造存储后端
//!
//! 返回显式传递的 `Arc<dyn TransStore>`，不使用进程级全局变量，
//! 同一进程里可以同时存在多个互相隔离的存储实例。

use super::mem_store::MemStore;
use super::sled_store::SledStore;
use super::{StoreResult, TransStore};
use crate::clock::{system_clock, Clock};
use crate::config::{StoreConfig, StoreDriver};
use std::sync::Arc;

pub fn open_store(config: &StoreConfig) -> StoreResult<Arc<dyn TransStore>> {
    open_store_with_clock(config, system_clock())
}

pub fn open_store_with_clock(
    config: &StoreConfig,
    clock: Arc<dyn Clock>,
) -> StoreResult<Arc<dyn TransStore>> {
    let store: Arc<dyn TransStore> = match &config.store {
        StoreDriver::Memory => Arc::new(MemStore::with_clock(clock)),
        StoreDriver::Sled { path } => Arc::new(SledStore::with_clock(path, clock)?),
    };
    store.ping()?;

    tracing::info!(driver = config.store.name(), "opened transaction store");
    Ok(store)
}
