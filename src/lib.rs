pub mod clock;
pub mod config;
pub mod cron;
pub mod storage;
pub mod transactions;

pub use crate::config::StoreConfig;
pub use crate::storage::mem_store::MemStore;
pub use crate::storage::registry::open_store;
pub use crate::storage::sled_store::SledStore;
pub use crate::storage::{
    Branch, GlobalTrans, StoreError, StoreResult, TransStatus, TransStore,
};
