use super::{
    Branch, BranchField, BranchStatusUpdate, GlobalTrans, RecoveryReport, ScanCondition,
    ScanPage, StoreError, StoreResult, TransStatus, TransStore,
};
use crate::clock::{saturating_sub, system_clock, to_chrono, Clock};
use crate::transactions::{lease, optimistic_lock};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::Transactional;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

type TxResult<T> = ConflictableTransactionResult<T, StoreError>;

/// 全局事务的持久化形式，额外记录分支数量（也是下一个分支序号）
#[derive(Debug, Serialize, Deserialize)]
struct SerializedGlobal {
    trans: GlobalTrans,
    branch_count: u32,
}

/// 基于 sled 的持久化存储
///
/// - `globals`: gid -> 全局事务
/// - `branches`: gid ‖ 0x00 ‖ 序号 -> 分支，按插入顺序排列
/// - `branch_index`: gid ‖ 0x00 ‖ branch_id -> 序号
/// - `cron`: 到期毫秒 ‖ gid，只包含未完成事务，用于最早到期优先的领取
///
/// 每个写操作都是一个跨树的 sled 事务，前置条件在事务内部重新校验。
pub struct SledStore {
    db: sled::Db,
    globals: sled::Tree,
    branches: sled::Tree,
    branch_index: sled::Tree,
    cron: sled::Tree,
    clock: Arc<dyn Clock>,
}

impl SledStore {
    pub fn new<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::with_clock(path, system_clock())
    }

    pub fn with_clock<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?, clock)
    }

    /// 临时库，drop 时删除（测试和基准用）
    pub fn temporary(clock: Arc<dyn Clock>) -> StoreResult<Self> {
        Self::from_config(sled::Config::new().temporary(true), clock)
    }

    /// 按给定的 sled 配置打开，例如关闭后台刷盘线程以便同一进程内重新打开
    pub fn from_config(config: sled::Config, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        Self::from_db(config.open()?, clock)
    }

    fn from_db(db: sled::Db, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let globals = db.open_tree("globals")?;
        let branches = db.open_tree("branches")?;
        let branch_index = db.open_tree("branch_index")?;
        let cron = db.open_tree("cron")?;

        Ok(Self {
            db,
            globals,
            branches,
            branch_index,
            cron,
            clock,
        })
    }

    pub fn flush(&self) -> StoreResult<usize> {
        Ok(self.db.flush()?)
    }

    fn load_global(&self, gid: &[u8]) -> StoreResult<Option<SerializedGlobal>> {
        self.globals
            .get(gid)?
            .map(|v| decode::<SerializedGlobal>(&v))
            .transpose()
    }

    /// 在事务内校验并领取单个事务
    fn try_claim(
        &self,
        gid: &[u8],
        expire_in: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<GlobalTrans>> {
        let claimed = (&self.globals, &self.cron).transaction(|(globals, cron)| -> TxResult<_> {
            let Some(bytes) = globals.get(gid)? else {
                return Ok(None);
            };
            let mut stored: SerializedGlobal = decode(&bytes).map_err(abort)?;
            if !lease::is_claimable(&stored.trans, now) {
                return Ok(None);
            }

            let prior = stored.trans.clone();
            cron.remove(cron_key(prior.next_cron_time, gid))?;
            lease::claim(&mut stored.trans, expire_in, now);
            cron.insert(cron_key(stored.trans.next_cron_time, gid), gid)?;
            globals.insert(gid, encode(&stored).map_err(abort)?)?;
            Ok(Some(prior))
        })?;
        Ok(claimed)
    }

    /// 在事务内重新校验孤儿条件并重置
    fn try_reset_orphan(
        &self,
        gid: &[u8],
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let reset = (&self.globals, &self.cron).transaction(|(globals, cron)| -> TxResult<_> {
            let Some(bytes) = globals.get(gid)? else {
                return Ok(false);
            };
            let mut stored: SerializedGlobal = decode(&bytes).map_err(abort)?;
            if !lease::is_orphaned(&stored.trans, stale_before) {
                return Ok(false);
            }

            cron.remove(cron_key(stored.trans.next_cron_time, gid))?;
            lease::reset(&mut stored.trans, now);
            cron.insert(cron_key(stored.trans.next_cron_time, gid), gid)?;
            globals.insert(gid, encode(&stored).map_err(abort)?)?;
            Ok(true)
        })?;
        Ok(reset)
    }
}

impl TransStore for SledStore {
    fn ping(&self) -> StoreResult<()> {
        self.db.size_on_disk()?;
        Ok(())
    }

    fn create_new_trans(&self, global: &mut GlobalTrans, branches: &mut [Branch]) -> StoreResult<()> {
        optimistic_lock::validate_gid(&global.gid)?;
        optimistic_lock::verify_new_branches(std::iter::empty(), branches)?;

        let now = self.clock.now();
        let mut stamped = global.clone();
        let mut stamped_branches = branches.to_vec();
        optimistic_lock::stamp_new_trans(&mut stamped, &mut stamped_branches, now);

        let gid = stamped.gid.as_bytes();
        let record = encode(&SerializedGlobal {
            trans: stamped.clone(),
            branch_count: next_branch_seq(0, stamped_branches.len())?,
        })?;
        let rows = encode_branch_rows(&stamped.gid, 0, &stamped_branches)?;
        let cron_entry = (!stamped.is_finished()).then(|| cron_key(stamped.next_cron_time, gid));

        (&self.globals, &self.branches, &self.branch_index, &self.cron).transaction(
            |(globals, branch_tree, index, cron)| -> TxResult<()> {
                if globals.get(gid)?.is_some() {
                    return Err(abort(StoreError::Duplicated));
                }
                globals.insert(gid, record.as_slice())?;
                for row in &rows {
                    branch_tree.insert(row.key.as_slice(), row.value.as_slice())?;
                    index.insert(row.index_key.as_slice(), &row.seq.to_be_bytes()[..])?;
                }
                if let Some(key) = &cron_entry {
                    cron.insert(key.as_slice(), gid)?;
                }
                Ok(())
            },
        )?;

        *global = stamped;
        branches.clone_from_slice(&stamped_branches);
        tracing::debug!(gid = %global.gid, branches = branches.len(), "created transaction");
        Ok(())
    }

    fn find_global(&self, gid: &str) -> StoreResult<Option<GlobalTrans>> {
        Ok(self.load_global(gid.as_bytes())?.map(|s| s.trans))
    }

    fn scan_globals(
        &self,
        position: Option<&str>,
        limit: usize,
        condition: &ScanCondition,
    ) -> StoreResult<ScanPage> {
        optimistic_lock::verify_scan_limit(limit)?;
        let iter = match position {
            Some(p) => self
                .globals
                .range::<&[u8], _>((Bound::Excluded(p.as_bytes()), Bound::Unbounded)),
            None => self.globals.iter(),
        };

        let mut items = Vec::new();
        let mut more = false;
        for item in iter {
            let (_, value) = item?;
            let global = decode::<SerializedGlobal>(&value)?.trans;
            if !condition.matches(&global) {
                continue;
            }
            if items.len() == limit {
                more = true;
                break;
            }
            items.push(global);
        }

        let next_position = if more {
            items.last().map(|g: &GlobalTrans| g.gid.clone())
        } else {
            None
        };
        Ok(ScanPage {
            items,
            next_position,
        })
    }

    fn find_branches(&self, gid: &str) -> StoreResult<Vec<Branch>> {
        self.branches
            .scan_prefix(branch_prefix(gid))
            .values()
            .map(|v| decode::<Branch>(&v?))
            .collect()
    }

    fn update_branches(&self, branches: &[Branch], fields: &[BranchField]) -> StoreResult<usize> {
        let mut targets = Vec::with_capacity(branches.len());
        for branch in branches {
            if let Some(seq) = self
                .branch_index
                .get(branch_index_key(&branch.gid, &branch.branch_id))?
            {
                targets.push((branch_key(&branch.gid, decode_seq(&seq)?), branch));
            }
        }

        let now = self.clock.now();
        let updated = self.branches.transaction(|tree| -> TxResult<usize> {
            let mut updated = 0;
            for (key, source) in &targets {
                let Some(bytes) = tree.get(key.as_slice())? else {
                    continue;
                };
                let mut stored: Branch = decode(&bytes).map_err(abort)?;
                stored.apply_fields(source, fields, now);
                tree.insert(key.as_slice(), encode(&stored).map_err(abort)?)?;
                updated += 1;
            }
            Ok(updated)
        })?;
        Ok(updated)
    }

    fn lock_global_save_branches(
        &self,
        gid: &str,
        expected: TransStatus,
        branches: &[Branch],
        branch_count: Option<usize>,
    ) -> StoreResult<()> {
        optimistic_lock::verify_new_branches(std::iter::empty(), branches)?;
        let appended = optimistic_lock::prepare_appended(gid, branches, self.clock.now());
        let gid_key = gid.as_bytes();

        (&self.globals, &self.branches, &self.branch_index).transaction(
            |(globals, branch_tree, index)| -> TxResult<()> {
                let Some(bytes) = globals.get(gid_key)? else {
                    return Err(abort(StoreError::NotFound));
                };
                let mut stored: SerializedGlobal = decode(&bytes).map_err(abort)?;
                optimistic_lock::verify_status(&stored.trans, expected).map_err(abort)?;
                optimistic_lock::verify_branch_count(stored.branch_count as usize, branch_count)
                    .map_err(abort)?;

                for branch in &appended {
                    if index.get(branch_index_key(gid, &branch.branch_id))?.is_some() {
                        return Err(abort(StoreError::Duplicated));
                    }
                }

                let end = next_branch_seq(stored.branch_count, appended.len()).map_err(abort)?;
                let rows = encode_branch_rows(gid, stored.branch_count, &appended).map_err(abort)?;
                for row in &rows {
                    branch_tree.insert(row.key.as_slice(), row.value.as_slice())?;
                    index.insert(row.index_key.as_slice(), &row.seq.to_be_bytes()[..])?;
                }
                stored.branch_count = end;
                globals.insert(gid_key, encode(&stored).map_err(abort)?)?;
                Ok(())
            },
        )?;

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
        let caller = global.clone();
        let gid = caller.gid.as_bytes();

        let changed = (&self.globals, &self.branches, &self.branch_index, &self.cron).transaction(
            |(globals, branch_tree, index, cron)| -> TxResult<GlobalTrans> {
                let Some(bytes) = globals.get(gid)? else {
                    return Err(abort(StoreError::NotFound));
                };
                let mut stored: SerializedGlobal = decode(&bytes).map_err(abort)?;
                optimistic_lock::verify_status(&stored.trans, caller.status).map_err(abort)?;

                // 分支全部校验通过后才写入
                let mut rows = Vec::with_capacity(branch_updates.len());
                for update in branch_updates {
                    let Some(seq) = index.get(branch_index_key(&caller.gid, &update.branch_id))? else {
                        return Err(abort(StoreError::NotFound));
                    };
                    let key = branch_key(&caller.gid, decode_seq(&seq).map_err(abort)?);
                    let Some(bytes) = branch_tree.get(key.as_slice())? else {
                        return Err(abort(StoreError::NotFound));
                    };
                    let mut branch: Branch = decode(&bytes).map_err(abort)?;
                    optimistic_lock::apply_branch_status(&mut branch, update, now);
                    rows.push((key, encode(&branch).map_err(abort)?));
                }
                for (key, value) in &rows {
                    branch_tree.insert(key.as_slice(), value.as_slice())?;
                }

                cron.remove(cron_key(stored.trans.next_cron_time, gid))?;
                optimistic_lock::apply_status_change(&mut stored.trans, &caller, new_status, clear_retry, now);
                if !stored.trans.is_finished() {
                    cron.insert(cron_key(stored.trans.next_cron_time, gid), gid)?;
                }
                globals.insert(gid, encode(&stored).map_err(abort)?)?;
                Ok(stored.trans)
            },
        )?;

        tracing::debug!(gid = %caller.gid, from = %caller.status, to = %new_status, "changed global status");
        *global = changed;
        Ok(())
    }

    fn touch_cron_time(
        &self,
        global: &mut GlobalTrans,
        next_interval: i64,
        next_cron_time: DateTime<Utc>,
    ) -> StoreResult<()> {
        let now = self.clock.now();
        let gid = global.gid.as_bytes();

        let touched = (&self.globals, &self.cron).transaction(|(globals, cron)| -> TxResult<GlobalTrans> {
            let Some(bytes) = globals.get(gid)? else {
                return Err(abort(StoreError::NotFound));
            };
            let mut stored: SerializedGlobal = decode(&bytes).map_err(abort)?;

            cron.remove(cron_key(stored.trans.next_cron_time, gid))?;
            lease::touch(&mut stored.trans, next_interval, next_cron_time, now);
            if !stored.trans.is_finished() {
                cron.insert(cron_key(stored.trans.next_cron_time, gid), gid)?;
            }
            globals.insert(gid, encode(&stored).map_err(abort)?)?;
            Ok(stored.trans)
        })?;

        *global = touched;
        Ok(())
    }

    fn lock_one_global_trans(&self, expire_in: Duration) -> StoreResult<Option<GlobalTrans>> {
        let now = self.clock.now();
        let now_key = sortable_millis(Some(now));
        let expire_in = to_chrono(expire_in);

        for item in self.cron.iter() {
            let (key, _) = item?;
            let (due, gid) = split_cron_key(&key)?;
            if due > now_key {
                break;
            }
            // 并发领取失败的候选直接跳过，继续下一个
            if let Some(prior) = self.try_claim(gid, expire_in, now)? {
                tracing::debug!(gid = %prior.gid, "claimed transaction");
                return Ok(Some(prior));
            }
        }
        Ok(None)
    }

    fn reset_cron_time(&self, stale_after: Duration, limit: usize) -> StoreResult<RecoveryReport> {
        let now = self.clock.now();
        let stale_before = saturating_sub(now, to_chrono(stale_after));

        let mut orphans = Vec::new();
        for item in self.cron.iter() {
            let (key, _) = item?;
            let (_, gid) = split_cron_key(&key)?;
            if let Some(stored) = self.load_global(gid)? {
                if lease::is_orphaned(&stored.trans, stale_before) {
                    orphans.push((stored.trans.update_time, gid.to_vec()));
                }
            }
        }
        orphans.sort();

        let has_remaining = orphans.len() > limit;
        let mut reset = 0u64;
        for (_, gid) in orphans.iter().take(limit) {
            if self.try_reset_orphan(gid, stale_before, now)? {
                reset += 1;
            }
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
        let gid = global.gid.as_bytes();

        (&self.globals, &self.cron).transaction(|(globals, cron)| -> TxResult<()> {
            let Some(bytes) = globals.get(gid)? else {
                return Err(abort(StoreError::NotFound));
            };
            let mut stored: SerializedGlobal = decode(&bytes).map_err(abort)?;
            if stored.trans.is_finished() {
                return Err(abort(StoreError::NotFound));
            }

            cron.remove(cron_key(stored.trans.next_cron_time, gid))?;
            lease::reset(&mut stored.trans, now);
            cron.insert(cron_key(stored.trans.next_cron_time, gid), gid)?;
            globals.insert(gid, encode(&stored).map_err(abort)?)?;
            Ok(())
        })?;
        Ok(())
    }
}

struct BranchRow {
    key: Vec<u8>,
    index_key: Vec<u8>,
    value: Vec<u8>,
    seq: u32,
}

/// 追加 `len` 个分支后的下一个序号，超出 u32 时拒绝
fn next_branch_seq(first: u32, len: usize) -> StoreResult<u32> {
    u32::try_from(len)
        .ok()
        .and_then(|n| first.checked_add(n))
        .ok_or(StoreError::InvalidArgument("too many branches"))
}

fn encode_branch_rows(gid: &str, first_seq: u32, branches: &[Branch]) -> StoreResult<Vec<BranchRow>> {
    branches
        .iter()
        .zip(first_seq..)
        .map(|(branch, seq)| {
            Ok(BranchRow {
                key: branch_key(gid, seq),
                index_key: branch_index_key(gid, &branch.branch_id),
                value: encode(branch)?,
                seq,
            })
        })
        .collect()
}

fn abort(err: StoreError) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(err)
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn branch_prefix(gid: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(gid.len() + 1);
    key.extend_from_slice(gid.as_bytes());
    key.push(0);
    key
}

fn branch_key(gid: &str, seq: u32) -> Vec<u8> {
    let mut key = branch_prefix(gid);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn branch_index_key(gid: &str, branch_id: &str) -> Vec<u8> {
    let mut key = branch_prefix(gid);
    key.extend_from_slice(branch_id.as_bytes());
    key
}

fn decode_seq(bytes: &[u8]) -> StoreResult<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| StoreError::Codec("branch sequence must be 4 bytes".to_string()))?;
    Ok(u32::from_be_bytes(raw))
}

/// 毫秒时间戳映射为可按字节序比较的 u64，空值排在最前
fn sortable_millis(at: Option<DateTime<Utc>>) -> u64 {
    match at {
        Some(t) => (t.timestamp_millis() as u64) ^ (1 << 63),
        None => 0,
    }
}

fn cron_key(at: Option<DateTime<Utc>>, gid: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + gid.len());
    key.extend_from_slice(&sortable_millis(at).to_be_bytes());
    key.extend_from_slice(gid);
    key
}

fn split_cron_key(key: &[u8]) -> StoreResult<(u64, &[u8])> {
    if key.len() < 8 {
        return Err(StoreError::Codec("cron key too short".to_string()));
    }
    let (due, gid) = key.split_at(8);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(due);
    Ok((u64::from_be_bytes(raw), gid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_sortable_millis_orders_like_time() {
        let now = Utc::now();
        let before = now - ChronoDuration::seconds(1);
        let ancient = DateTime::<Utc>::MIN_UTC;

        assert!(sortable_millis(None) < sortable_millis(Some(ancient)));
        assert!(sortable_millis(Some(ancient)) < sortable_millis(Some(before)));
        assert!(sortable_millis(Some(before)) < sortable_millis(Some(now)));
    }

    #[test]
    fn test_cron_key_round_trip() {
        let now = Utc::now();
        let key = cron_key(Some(now), b"gid-1");
        let (due, gid) = split_cron_key(&key).unwrap();
        assert_eq!(due, sortable_millis(Some(now)));
        assert_eq!(gid, b"gid-1");
    }

    #[test]
    fn test_finished_trans_leaves_cron_index() {
        let clock = ManualClock::starting_now();
        let store = SledStore::temporary(Arc::new(clock)).unwrap();
        let mut g = GlobalTrans::new("g1", "saga");
        store.create_new_trans(&mut g, &mut []).unwrap();
        assert_eq!(store.cron.len(), 1);

        store
            .change_global_status(&mut g, TransStatus::Succeed, &[], true)
            .unwrap();
        assert_eq!(store.cron.len(), 0);
        assert_eq!(g.status, TransStatus::Succeed);
    }

    #[test]
    fn test_branch_seq_overflow_rejected() {
        assert_eq!(next_branch_seq(0, 3).unwrap(), 3);
        assert_eq!(next_branch_seq(u32::MAX - 1, 1).unwrap(), u32::MAX);
        assert!(matches!(
            next_branch_seq(u32::MAX, 1),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            next_branch_seq(0, usize::MAX),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_branch_keys_keep_insertion_order() {
        assert!(branch_key("g", 1) < branch_key("g", 2));
        assert!(branch_key("g", 255) < branch_key("g", 256));
        assert!(branch_key("g", 9).starts_with(&branch_prefix("g")));
    }
}
