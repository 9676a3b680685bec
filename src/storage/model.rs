//! 事务日志记录模型
//!
//! 全局事务（`GlobalTrans`）与分支（`Branch`）两种持久化实体，以及全局事务状态。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 分支状态：准备中
pub const BRANCH_PREPARED: &str = "prepared";
/// 分支状态：成功
pub const BRANCH_SUCCEED: &str = "succeed";
/// 分支状态：失败
pub const BRANCH_FAILED: &str = "failed";

/// 全局事务状态
///
/// `Prepared -> Submitted -> {Succeed | Failed}`，`Aborting` 是通往 `Failed` 的旁路。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransStatus {
    Prepared,
    Submitted,
    Succeed,
    Failed,
    Aborting,
}

impl TransStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransStatus::Prepared => "prepared",
            TransStatus::Submitted => "submitted",
            TransStatus::Succeed => "succeed",
            TransStatus::Failed => "failed",
            TransStatus::Aborting => "aborting",
        }
    }

    /// `Succeed` 与 `Failed` 为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransStatus::Succeed | TransStatus::Failed)
    }
}

impl fmt::Display for TransStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown transaction status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for TransStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepared" => Ok(TransStatus::Prepared),
            "submitted" => Ok(TransStatus::Submitted),
            "succeed" => Ok(TransStatus::Succeed),
            "failed" => Ok(TransStatus::Failed),
            "aborting" => Ok(TransStatus::Aborting),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// 全局事务记录
///
/// 查询返回的是值拷贝，调用方做条件更新时需要把自己观察到的状态一并提交。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTrans {
    pub gid: String,
    /// saga / tcc / msg / xa，对存储层不透明
    pub trans_type: String,
    pub status: TransStatus,
    pub protocol: String,
    pub query_prepared: String,
    pub custom_data: String,
    pub options: String,
    pub rollback_reason: String,
    pub result: String,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub rollback_time: Option<DateTime<Utc>>,
    /// 调用方最近一次请求的重试间隔（秒）
    pub next_cron_interval: i64,
    /// 为空或已过期时可被领取
    pub next_cron_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// `next_cron_time` 由最近一次续约写入，而不是领取时的租约；孤儿回收跳过这类记录
    #[serde(default)]
    pub lease_renewed: bool,
}

impl GlobalTrans {
    pub fn new(gid: impl Into<String>, trans_type: impl Into<String>) -> Self {
        Self {
            gid: gid.into(),
            trans_type: trans_type.into(),
            status: TransStatus::Prepared,
            protocol: String::new(),
            query_prepared: String::new(),
            custom_data: String::new(),
            options: String::new(),
            rollback_reason: String::new(),
            result: String::new(),
            create_time: None,
            update_time: None,
            finish_time: None,
            rollback_time: None,
            next_cron_interval: 0,
            next_cron_time: None,
            retry_count: 0,
            lease_renewed: false,
        }
    }

    pub fn with_status(mut self, status: TransStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_next_cron_time(mut self, at: DateTime<Utc>) -> Self {
        self.next_cron_time = Some(at);
        self
    }

    pub fn with_custom_data(mut self, data: impl Into<String>) -> Self {
        self.custom_data = data.into();
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// 未完成且 `next_cron_time` 为空或不晚于 `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_finished() && self.next_cron_time.map_or(true, |t| t <= now)
    }
}

/// 分支记录
///
/// `(gid, branch_id)` 唯一；同一 gid 下按插入顺序读取。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub gid: String,
    pub branch_id: String,
    pub url: String,
    /// 分支请求体，对存储层不透明
    pub bin_data: Vec<u8>,
    pub status: String,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub rollback_time: Option<DateTime<Utc>>,
}

impl Branch {
    pub fn new(gid: impl Into<String>, branch_id: impl Into<String>) -> Self {
        Self {
            gid: gid.into(),
            branch_id: branch_id.into(),
            url: String::new(),
            bin_data: Vec::new(),
            status: BRANCH_PREPARED.to_string(),
            create_time: None,
            update_time: None,
            finish_time: None,
            rollback_time: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_bin_data(mut self, data: Vec<u8>) -> Self {
        self.bin_data = data;
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// 按字段列表写入 `source` 中的值
    pub fn apply_fields(&mut self, source: &Branch, fields: &[BranchField], now: DateTime<Utc>) {
        for field in fields {
            match field {
                BranchField::Status => self.status = source.status.clone(),
                BranchField::FinishTime => self.finish_time = source.finish_time,
                BranchField::RollbackTime => self.rollback_time = source.rollback_time,
            }
        }
        self.update_time = Some(now);
    }
}

/// 随全局状态变更一起写入的分支状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchStatusUpdate {
    pub branch_id: String,
    pub status: String,
}

impl BranchStatusUpdate {
    pub fn new(branch_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            status: status.into(),
        }
    }
}

/// `update_branches` 可以写入的分支字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchField {
    Status,
    FinishTime,
    RollbackTime,
}

/// 全局事务分页扫描的过滤条件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanCondition {
    pub status: Option<TransStatus>,
    pub trans_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ScanCondition {
    pub fn with_status(mut self, status: TransStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_trans_type(mut self, trans_type: impl Into<String>) -> Self {
        self.trans_type = Some(trans_type.into());
        self
    }

    pub fn matches(&self, global: &GlobalTrans) -> bool {
        if self.status.is_some_and(|s| s != global.status) {
            return false;
        }
        if self.trans_type.as_ref().is_some_and(|t| *t != global.trans_type) {
            return false;
        }
        if let Some(after) = self.created_after {
            if global.create_time.map_or(true, |c| c < after) {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if global.create_time.map_or(true, |c| c >= before) {
                return false;
            }
        }
        true
    }
}

/// 一页扫描结果；`next_position` 仅在还有剩余时为 `Some`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub items: Vec<GlobalTrans>,
    pub next_position: Option<String>,
}

/// 孤儿租约回收结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reset: u64,
    /// 超出 limit 仍有待回收的事务
    pub has_remaining: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            TransStatus::Prepared,
            TransStatus::Submitted,
            TransStatus::Succeed,
            TransStatus::Failed,
            TransStatus::Aborting,
        ] {
            assert_eq!(status.as_str().parse::<TransStatus>(), Ok(status));
        }
        assert!("no".parse::<TransStatus>().is_err());
    }

    #[test]
    fn test_status_json_is_lowercase() {
        let json = serde_json::to_string(&TransStatus::Aborting).unwrap();
        assert_eq!(json, "\"aborting\"");
    }

    #[test]
    fn test_terminal_status() {
        assert!(TransStatus::Succeed.is_terminal());
        assert!(TransStatus::Failed.is_terminal());
        assert!(!TransStatus::Aborting.is_terminal());
        assert!(!TransStatus::Prepared.is_terminal());
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let g = GlobalTrans::new("g1", "saga");
        assert!(g.is_due(now));

        let later = g.clone().with_next_cron_time(now + Duration::seconds(5));
        assert!(!later.is_due(now));
        assert!(later.is_due(now + Duration::seconds(5)));

        let done = g.with_status(TransStatus::Succeed);
        assert!(!done.is_due(now));
    }

    #[test]
    fn test_branch_apply_fields_only_touches_listed() {
        let now = Utc::now();
        let mut stored = Branch::new("g1", "01").with_url("http://svc/a");
        let mut source = Branch::new("g1", "01").with_status(BRANCH_SUCCEED);
        source.finish_time = Some(now);
        source.url = "ignored".to_string();

        stored.apply_fields(&source, &[BranchField::Status], now);

        assert_eq!(stored.status, BRANCH_SUCCEED);
        assert_eq!(stored.finish_time, None);
        assert_eq!(stored.url, "http://svc/a");
        assert_eq!(stored.update_time, Some(now));
    }

    #[test]
    fn test_scan_condition_matches() {
        let now = Utc::now();
        let mut g = GlobalTrans::new("g1", "tcc");
        g.create_time = Some(now);

        assert!(ScanCondition::default().matches(&g));
        assert!(ScanCondition::default().with_trans_type("tcc").matches(&g));
        assert!(!ScanCondition::default().with_trans_type("saga").matches(&g));
        assert!(!ScanCondition::default()
            .with_status(TransStatus::Submitted)
            .matches(&g));

        let window = ScanCondition {
            created_after: Some(now - Duration::seconds(1)),
            created_before: Some(now),
            ..Default::default()
        };
        assert!(!window.matches(&g));
    }
}
