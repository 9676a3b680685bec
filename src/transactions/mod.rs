// 事务日志的并发控制规则
//
// - 乐观锁：以全局状态为版本号的条件写入
// - 租约：领取、续约、孤儿回收

pub mod lease;
pub mod optimistic_lock;

pub use lease::{next_backoff, next_cron_time, MAX_CRON_INTERVAL};
