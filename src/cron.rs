//! 定时轮询驱动
//!
//! 每个 worker 独立地从存储中领取到期事务交给执行层处理，worker 之间不做任何进程内协调，
//! 互斥完全依赖存储后端的原子领取。存储调用是阻塞的，放在 `spawn_blocking` 中执行。

use crate::clock::{system_clock, Clock};
use crate::config::StoreConfig;
use crate::storage::{GlobalTrans, RecoveryReport, StoreError, StoreResult, TransStore};
use crate::transactions::lease;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

/// 执行层接口
///
/// 处理一个已领取的事务：调用参与者并通过存储写回结果。
/// 返回错误时 worker 会按退避间隔重新调度该事务。
pub trait TransProcessor: Send + Sync {
    fn process(&self, store: &dyn TransStore, global: GlobalTrans) -> Result<(), ProcessError>;
}

/// 单次轮询结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// 没有到期事务
    Idle,
    Processed(String),
    /// 处理失败，已重新调度
    Rescheduled(String),
}

pub struct CronWorker {
    store: Arc<dyn TransStore>,
    processor: Arc<dyn TransProcessor>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
}

impl CronWorker {
    pub fn new(
        store: Arc<dyn TransStore>,
        processor: Arc<dyn TransProcessor>,
        config: StoreConfig,
    ) -> Self {
        Self::with_clock(store, processor, config, system_clock())
    }

    pub fn with_clock(
        store: Arc<dyn TransStore>,
        processor: Arc<dyn TransProcessor>,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            processor,
            config,
            clock,
        }
    }

    /// 领取并处理一个事务
    pub async fn run_once(&self) -> StoreResult<PollOutcome> {
        let store = Arc::clone(&self.store);
        let processor = Arc::clone(&self.processor);
        let clock = Arc::clone(&self.clock);
        let lock_expire = self.config.lock_expire();
        let retry_interval = initial_interval(self.config.retry_interval_secs);

        tokio::task::spawn_blocking(move || -> StoreResult<PollOutcome> {
            let Some(global) = store.lock_one_global_trans(lock_expire)? else {
                return Ok(PollOutcome::Idle);
            };
            let gid = global.gid.clone();

            match processor.process(store.as_ref(), global.clone()) {
                Ok(()) => Ok(PollOutcome::Processed(gid)),
                Err(err) => {
                    let mut current = global;
                    let interval = if current.next_cron_interval <= 0 {
                        retry_interval
                    } else {
                        lease::next_backoff(current.next_cron_interval)
                    };
                    let next = lease::next_cron_time(clock.now(), interval);
                    tracing::warn!(gid = %gid, error = %err, interval, "process failed, rescheduled");
                    store.touch_cron_time(&mut current, interval, next)?;
                    Ok(PollOutcome::Rescheduled(gid))
                }
            }
        })
        .await
        .map_err(|err| StoreError::Storage(format!("cron task failed: {err}")))?
    }

    /// 回收孤儿租约，直到没有剩余
    pub async fn recover_orphans(&self) -> StoreResult<RecoveryReport> {
        let store = Arc::clone(&self.store);
        let stale_after = self.config.reset_stale_after();
        let limit = self.config.reset_limit;

        tokio::task::spawn_blocking(move || -> StoreResult<RecoveryReport> {
            let mut total = RecoveryReport::default();
            loop {
                let report = store.reset_cron_time(stale_after, limit)?;
                total.reset += report.reset;
                total.has_remaining = report.has_remaining;
                if !report.has_remaining || report.reset == 0 {
                    return Ok(total);
                }
            }
        })
        .await
        .map_err(|err| StoreError::Storage(format!("recovery task failed: {err}")))?
    }

    /// 轮询直到 `shutdown` 变为 true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut last_reset = Instant::now();

        while !*shutdown.borrow() {
            if last_reset.elapsed() >= self.config.reset_interval() {
                if let Err(err) = self.recover_orphans().await {
                    tracing::warn!(error = %err, "orphan recovery failed");
                }
                last_reset = Instant::now();
            }

            let idle = match self.run_once().await {
                Ok(PollOutcome::Idle) => true,
                Ok(_) => false,
                Err(err) => {
                    tracing::warn!(error = %err, "poll failed");
                    true
                }
            };
            if idle {
                let pause = jittered(self.config.trans_cron_interval());
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// 首次失败的重试间隔（秒），不超过 `MAX_CRON_INTERVAL`
fn initial_interval(secs: u64) -> i64 {
    i64::try_from(secs)
        .unwrap_or(i64::MAX)
        .min(lease::MAX_CRON_INTERVAL)
}

/// 在轮询间隔上减去至多 1 秒的随机抖动，错开多个 worker
fn jittered(base: Duration) -> Duration {
    let max_jitter = base.as_secs_f64().min(1.0);
    if max_jitter <= 0.0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0.0..max_jitter);
    base.saturating_sub(Duration::from_secs_f64(jitter))
}
