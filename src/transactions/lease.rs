// 租约调度规则
//
// 领取、续约与孤儿回收对单条记录的判定和修改。原子性由存储后端保证：
// 后端必须在同一个原子单元内完成“判定 + 修改”。

use chrono::{DateTime, Duration, Utc};

use crate::clock::saturating_add;
use crate::storage::GlobalTrans;

/// 重试间隔上限（秒）
pub const MAX_CRON_INTERVAL: i64 = 3600;

/// 是否可以被领取
pub fn is_claimable(global: &GlobalTrans, now: DateTime<Utc>) -> bool {
    global.is_due(now)
}

/// 领取：把下一次调度时间推迟到租约结束
pub fn claim(global: &mut GlobalTrans, expire_in: Duration, now: DateTime<Utc>) {
    global.next_cron_time = Some(saturating_add(now, expire_in));
    global.update_time = Some(now);
    global.lease_renewed = false;
}

/// 续约
pub fn touch(
    global: &mut GlobalTrans,
    next_interval: i64,
    next_cron_time: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    global.next_cron_interval = next_interval;
    global.next_cron_time = Some(next_cron_time);
    global.retry_count = global.retry_count.saturating_add(1);
    global.update_time = Some(now);
    global.lease_renewed = true;
}

/// 未完成、未续约且 `update_time` 早于 `stale_before`，说明领取者已经失联
///
/// 续约过的记录按调用方请求的退避时间调度，不会被提前拉回。
pub fn is_orphaned(global: &GlobalTrans, stale_before: DateTime<Utc>) -> bool {
    !global.is_finished()
        && !global.lease_renewed
        && global.update_time.map_or(true, |t| t < stale_before)
}

/// 重新置为立即到期
pub fn reset(global: &mut GlobalTrans, now: DateTime<Utc>) {
    global.next_cron_time = Some(now);
    global.update_time = Some(now);
    global.lease_renewed = false;
}

/// 指数退避：间隔翻倍，至少 1 秒，不超过 `MAX_CRON_INTERVAL`
pub fn next_backoff(interval: i64) -> i64 {
    interval.max(1).saturating_mul(2).min(MAX_CRON_INTERVAL)
}

/// `now + interval` 秒
pub fn next_cron_time(now: DateTime<Utc>, interval: i64) -> DateTime<Utc> {
    saturating_add(now, Duration::seconds(interval.clamp(0, MAX_CRON_INTERVAL)))
}
