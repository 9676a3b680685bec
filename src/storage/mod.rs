pub mod mem_store;
pub mod model;
pub mod registry;
pub mod sled_store;

pub use model::{
    Branch, BranchField, BranchStatusUpdate, GlobalTrans, RecoveryReport, ScanCondition,
    ScanPage, TransStatus,
};

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// 存储层错误
///
/// `NotFound` 同时表示 gid 不存在和乐观锁前置条件不满足，调用方都应重新读取后再决定。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction not found or status precondition failed")]
    NotFound,

    #[error("transaction or branch already exists")]
    Duplicated,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

impl From<sled::transaction::TransactionError<StoreError>> for StoreError {
    fn from(err: sled::transaction::TransactionError<StoreError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(err) => err,
            sled::transaction::TransactionError::Storage(err) => err.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 事务日志存储契约
///
/// 每个方法都是对后端的一次原子调用，存储层内部不做重试。
/// 所有会改变全局状态或分支集合的写入都以调用方观察到的状态为前提。
pub trait TransStore: Send + Sync {
    /// 后端存活探测
    fn ping(&self) -> StoreResult<()>;

    /// 原子地写入全局事务及其初始分支。
    ///
    /// gid 已存在时返回 `Duplicated` 且不写入任何内容。成功后 `global` 与 `branches`
    /// 中的时间戳会被回填为已持久化的值，分支的 gid 统一为 `global.gid`。
    fn create_new_trans(&self, global: &mut GlobalTrans, branches: &mut [Branch]) -> StoreResult<()>;

    fn find_global(&self, gid: &str) -> StoreResult<Option<GlobalTrans>>;

    /// 按 gid 升序分页；`position` 为上一页最后一个 gid（不包含）
    fn scan_globals(
        &self,
        position: Option<&str>,
        limit: usize,
        condition: &ScanCondition,
    ) -> StoreResult<ScanPage>;

    /// 按插入顺序返回 gid 下的全部分支，没有分支时返回空
    fn find_branches(&self, gid: &str) -> StoreResult<Vec<Branch>>;

    /// 不加乐观锁地批量写入分支字段，返回实际更新的行数。
    ///
    /// 调用方需要自己保证持有该事务的租约。
    fn update_branches(&self, branches: &[Branch], fields: &[BranchField]) -> StoreResult<usize>;

    /// 在 `expected` 状态与分支数量约束都满足时追加分支。
    ///
    /// `branch_count` 为 `Some(n)` 时要求已有分支数恰好为 `n`。
    fn lock_global_save_branches(
        &self,
        gid: &str,
        expected: TransStatus,
        branches: &[Branch],
        branch_count: Option<usize>,
    ) -> StoreResult<()>;

    /// 仅当持久化状态仍等于 `global.status` 时把状态改为 `new_status`，
    /// 并在同一原子单元内写入分支状态。
    ///
    /// `clear_retry` 只能与终态一起使用，会清空调度字段。成功后 `global` 更新为新状态。
    fn change_global_status(
        &self,
        global: &mut GlobalTrans,
        new_status: TransStatus,
        branch_updates: &[BranchStatusUpdate],
        clear_retry: bool,
    ) -> StoreResult<()>;

    /// 租约持有者续约：记录重试间隔、增加重试次数并设置下一次调度时间。
    fn touch_cron_time(
        &self,
        global: &mut GlobalTrans,
        next_interval: i64,
        next_cron_time: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// 领取一个到期的未完成事务，同时把它的 `next_cron_time` 推迟 `expire_in`。
    ///
    /// 返回领取前的快照；没有到期事务时返回 `None`。
    fn lock_one_global_trans(&self, expire_in: Duration) -> StoreResult<Option<GlobalTrans>>;

    /// 把 `update_time` 早于 `now - stale_after` 的未完成事务重新置为立即到期，最多 `limit` 条。
    fn reset_cron_time(&self, stale_after: Duration, limit: usize) -> StoreResult<RecoveryReport>;

    /// 让单个未完成事务立即到期
    fn reset_trans_global_cron_time(&self, global: &GlobalTrans) -> StoreResult<()>;
}
