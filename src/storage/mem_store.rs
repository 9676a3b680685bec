use super::{
    Branch, BranchField, BranchStatusUpdate, GlobalTrans, RecoveryReport, ScanCondition,
    ScanPage, StoreError, StoreResult, TransStatus, TransStore,
};
use crate::clock::{saturating_sub, system_clock, to_chrono, Clock};
use crate::transactions::{lease, optimistic_lock};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

/// 调度索引键：(next_cron_time, gid)，空时间排在最前
type DueKey = (Option<DateTime<Utc>>, String);

fn due_key(global: &GlobalTrans) -> DueKey {
    (global.next_cron_time, global.gid.clone())
}

#[derive(Default)]
struct MemState {
    globals: BTreeMap<String, GlobalTrans>,
    branches: HashMap<String, Vec<Branch>>,
    /// 只包含未完成事务，按到期时间排序
    due: BTreeSet<DueKey>,
}

/// 记录修改后同步调度索引
fn reindex(due: &mut BTreeSet<DueKey>, before: &DueKey, after: &GlobalTrans) {
    due.remove(before);
    if !after.is_finished() {
        due.insert(due_key(after));
    }
}

/// 内存存储
///
/// 所有操作都在同一把互斥锁内完成“读取-校验-写入”，以获得与事务型后端相同的原子性。
pub struct MemStore {
    state: Mutex<MemState>,
    clock: Arc<dyn Clock>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            clock,
        }
    }

    pub fn global_count(&self) -> usize {
        self.state.lock().globals.len()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransStore for MemStore {
    fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn create_new_trans(&self, global: &mut GlobalTrans, branches: &mut [Branch]) -> StoreResult<()> {
        optimistic_lock::validate_gid(&global.gid)?;
        optimistic_lock::verify_new_branches(std::iter::empty(), branches)?;

        let mut state = self.state.lock();
        if state.globals.contains_key(&global.gid) {
            return Err(StoreError::Duplicated);
        }

        let now = self.clock.now();
        optimistic_lock::stamp_new_trans(global, branches, now);
        if !global.is_finished() {
            state.due.insert(due_key(global));
        }
        state.globals.insert(global.gid.clone(), global.clone());
        state.branches.insert(global.gid.clone(), branches.to_vec());

        tracing::debug!(gid = %global.gid, branches = branches.len(), "created transaction");
        Ok(())
    }

    fn find_global(&self, gid: &str) -> StoreResult<Option<GlobalTrans>> {
        Ok(self.state.lock().globals.get(gid).cloned())
    }

    fn scan_globals(
        &self,
        position: Option<&str>,
        limit: usize,
        condition: &ScanCondition,
    ) -> StoreResult<ScanPage> {
        optimistic_lock::verify_scan_limit(limit)?;
        let state = self.state.lock();
        let lower = match position {
            Some(p) => Bound::Excluded(p.to_string()),
            None => Bound::Unbounded,
        };

        let mut matched = state
            .globals
            .range((lower, Bound::Unbounded))
            .map(|(_, g)| g)
            .filter(|g| condition.matches(g));

        let items: Vec<GlobalTrans> = matched.by_ref().take(limit).cloned().collect();
        let next_position = if matched.next().is_some() {
            items.last().map(|g| g.gid.clone())
        } else {
            None
        };

        Ok(ScanPage {
            items,
            next_position,
        })
    }

    fn find_branches(&self, gid: &str) -> StoreResult<Vec<Branch>> {
        Ok(self
            .state
            .lock()
            .branches
            .get(gid)
            .cloned()
            .unwrap_or_default())
    }

    fn update_branches(&self, branches: &[Branch], fields: &[BranchField]) -> StoreResult<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut updated = 0;

        for branch in branches {
            let Some(stored) = state
                .branches
                .get_mut(&branch.gid)
                .and_then(|list| list.iter_mut().find(|b| b.branch_id == branch.branch_id))
            else {
                continue;
            };
            stored.apply_fields(branch, fields, now);
            updated += 1;
        }

        Ok(updated)
    }

    fn lock_global_save_branches(
        &self,
        gid: &str,
        expected: TransStatus,
        branches: &[Branch],
        branch_count: Option<usize>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let global = state.globals.get(gid).ok_or(StoreError::NotFound)?;
        optimistic_lock::verify_status(global, expected)?;

        let existing = state.branches.get(gid).map(Vec::as_slice).unwrap_or(&[]);
        optimistic_lock::verify_branch_count(existing.len(), branch_count)?;
        optimistic_lock::verify_new_branches(
            existing.iter().map(|b| b.branch_id.as_str()),
            branches,
        )?;

        let appended = optimistic_lock::prepare_appended(gid, branches, self.clock.now());
        state
            .branches
            .entry(gid.to_string())
            .or_default()
            .extend(appended);

        tracing::debug!(gid = %gid, appended = branches.len(), "saved branches");
        Ok(())
    }

    fn change_global_status(
        &self,
        global: &mut GlobalTrans,
        new_status: TransStatus,
        branch_updates: &[BranchStatusUpdate],
        clear_retry: bool,
    ) -> StoreResult<()> {
        optimistic_lock::verify_clear_retry(new_status, clear_retry)?;

        let now = self.clock.now();
        let mut state = self.state.lock();
        let MemState {
            globals,
            branches,
            due,
        } = &mut *state;

        let persisted = globals.get_mut(&global.gid).ok_or(StoreError::NotFound)?;
        optimistic_lock::verify_status(persisted, global.status)?;

        // 先确认所有分支都存在，保证要么全部写入要么都不写
        let list = branches.entry(global.gid.clone()).or_default();
        let mut targets = Vec::with_capacity(branch_updates.len());
        for update in branch_updates {
            let idx = list
                .iter()
                .position(|b| b.branch_id == update.branch_id)
                .ok_or(StoreError::NotFound)?;
            targets.push(idx);
        }

        for (idx, update) in targets.into_iter().zip(branch_updates) {
            optimistic_lock::apply_branch_status(&mut list[idx], update, now);
        }
        let from = persisted.status;
        let before = due_key(persisted);
        optimistic_lock::apply_status_change(persisted, global, new_status, clear_retry, now);
        reindex(due, &before, persisted);
        *global = persisted.clone();

        tracing::debug!(gid = %global.gid, %from, to = %new_status, "changed global status");
        Ok(())
    }

    fn touch_cron_time(
        &self,
        global: &mut GlobalTrans,
        next_interval: i64,
        next_cron_time: DateTime<Utc>,
    ) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let MemState { globals, due, .. } = &mut *state;
        let persisted = globals.get_mut(&global.gid).ok_or(StoreError::NotFound)?;

        let before = due_key(persisted);
        lease::touch(persisted, next_interval, next_cron_time, now);
        reindex(due, &before, persisted);
        *global = persisted.clone();
        Ok(())
    }

    fn lock_one_global_trans(&self, expire_in: Duration) -> StoreResult<Option<GlobalTrans>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let MemState { globals, due, .. } = &mut *state;

        // 索引有序，第一项不到期则没有可领取的事务
        let Some(first) = due.first().cloned() else {
            return Ok(None);
        };
        let Some(record) = globals.get_mut(&first.1) else {
            return Ok(None);
        };
        if !lease::is_claimable(record, now) {
            return Ok(None);
        }

        let gid = first.1.clone();
        let prior = record.clone();
        lease::claim(record, to_chrono(expire_in), now);
        reindex(due, &first, record);

        tracing::debug!(gid = %gid, "claimed transaction");
        Ok(Some(prior))
    }

    fn reset_cron_time(&self, stale_after: Duration, limit: usize) -> StoreResult<RecoveryReport> {
        let now = self.clock.now();
        let stale_before = saturating_sub(now, to_chrono(stale_after));
        let mut state = self.state.lock();
        let MemState { globals, due, .. } = &mut *state;

        let mut orphans: Vec<(Option<DateTime<Utc>>, String)> = due
            .iter()
            .filter_map(|(_, gid)| globals.get(gid))
            .filter(|g| lease::is_orphaned(g, stale_before))
            .map(|g| (g.update_time, g.gid.clone()))
            .collect();
        orphans.sort();

        let has_remaining = orphans.len() > limit;
        let mut reset = 0u64;
        for (_, gid) in orphans.into_iter().take(limit) {
            let Some(global) = globals.get_mut(&gid) else {
                continue;
            };
            let before = due_key(global);
            lease::reset(global, now);
            reindex(due, &before, global);
            reset += 1;
        }

        if reset > 0 {
            tracing::info!(reset, has_remaining, "reset orphaned leases");
        }
        Ok(RecoveryReport {
            reset,
            has_remaining,
        })
    }

    fn reset_trans_global_cron_time(&self, global: &GlobalTrans) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let MemState { globals, due, .. } = &mut *state;
        let persisted = globals
            .get_mut(&global.gid)
            .filter(|g| !g.is_finished())
            .ok_or(StoreError::NotFound)?;

        let before = due_key(persisted);
        lease::reset(persisted, now);
        reindex(due, &before, persisted);
        Ok(())
    }
}
