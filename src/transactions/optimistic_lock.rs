// 乐观锁机制
//
// 以全局事务状态作为版本号：写入前比对调用方观察到的状态与持久化状态，
// 不一致即视为调用方视图已过期。各存储后端在自己的原子单元内调用这里的校验与变更函数。

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::storage::{Branch, BranchStatusUpdate, GlobalTrans, StoreError, StoreResult, TransStatus};

/// 校验 gid：非空且不含 NUL（NUL 用作分支键的分隔符）
pub fn validate_gid(gid: &str) -> StoreResult<()> {
    if gid.is_empty() {
        return Err(StoreError::InvalidArgument("gid must not be empty"));
    }
    if gid.as_bytes().contains(&0) {
        return Err(StoreError::InvalidArgument("gid must not contain NUL"));
    }
    Ok(())
}

/// 分页大小必须为正，否则无法推进游标
pub fn verify_scan_limit(limit: usize) -> StoreResult<()> {
    if limit == 0 {
        return Err(StoreError::InvalidArgument("scan limit must be positive"));
    }
    Ok(())
}

/// 验证状态
///
/// 持久化状态为终态时永远不匹配。
pub fn verify_status(persisted: &GlobalTrans, expected: TransStatus) -> StoreResult<()> {
    if persisted.is_finished() || persisted.status != expected {
        Err(StoreError::NotFound)
    } else {
        Ok(())
    }
}

/// 验证已有分支数量
pub fn verify_branch_count(existing: usize, constraint: Option<usize>) -> StoreResult<()> {
    match constraint {
        Some(expected) if expected != existing => Err(StoreError::NotFound),
        _ => Ok(()),
    }
}

/// 清空调度字段只对终态有意义
pub fn verify_clear_retry(new_status: TransStatus, clear_retry: bool) -> StoreResult<()> {
    if clear_retry && !new_status.is_terminal() {
        return Err(StoreError::InvalidArgument(
            "clear_retry requires a terminal status",
        ));
    }
    Ok(())
}

/// 新分支之间以及与已有分支之间不能出现重复的 branch_id
pub fn verify_new_branches<'a>(
    existing: impl IntoIterator<Item = &'a str>,
    new: &[Branch],
) -> StoreResult<()> {
    let mut seen: HashSet<&str> = existing.into_iter().collect();
    for branch in new {
        if !seen.insert(branch.branch_id.as_str()) {
            return Err(StoreError::Duplicated);
        }
    }
    Ok(())
}

/// 为新建的全局事务和初始分支补齐时间戳
pub fn stamp_new_trans(global: &mut GlobalTrans, branches: &mut [Branch], now: DateTime<Utc>) {
    global.create_time.get_or_insert(now);
    global.update_time = Some(now);
    global.lease_renewed = false;
    for branch in branches.iter_mut() {
        stamp_branch(branch, &global.gid, now);
    }
}

/// 生成待追加的分支
pub fn prepare_appended(gid: &str, branches: &[Branch], now: DateTime<Utc>) -> Vec<Branch> {
    branches
        .iter()
        .cloned()
        .map(|mut b| {
            stamp_branch(&mut b, gid, now);
            b
        })
        .collect()
}

fn stamp_branch(branch: &mut Branch, gid: &str, now: DateTime<Utc>) {
    if branch.gid != gid {
        branch.gid = gid.to_string();
    }
    branch.create_time.get_or_insert(now);
    branch.update_time = Some(now);
}

/// 状态变更（在校验通过后调用）
///
/// 调用方记录中非空的 `rollback_reason`、`result` 会一并写入。
pub fn apply_status_change(
    persisted: &mut GlobalTrans,
    caller: &GlobalTrans,
    new_status: TransStatus,
    clear_retry: bool,
    now: DateTime<Utc>,
) {
    persisted.status = new_status;
    persisted.update_time = Some(now);
    if !caller.rollback_reason.is_empty() {
        persisted.rollback_reason = caller.rollback_reason.clone();
    }
    if !caller.result.is_empty() {
        persisted.result = caller.result.clone();
    }
    match new_status {
        TransStatus::Succeed => persisted.finish_time = Some(now),
        TransStatus::Failed => {
            persisted.finish_time = Some(now);
            persisted.rollback_time = Some(now);
        }
        _ => {}
    }
    if clear_retry {
        persisted.next_cron_time = None;
        persisted.next_cron_interval = 0;
    }
}

/// 写入单个分支状态
pub fn apply_branch_status(branch: &mut Branch, update: &BranchStatusUpdate, now: DateTime<Utc>) {
    branch.status = update.status.clone();
    branch.update_time = Some(now);
}
