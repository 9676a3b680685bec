//! 存储与调度配置
//!
//! 进程启动时加载一次，用来选择存储后端和调度参数。可以从 JSON 读取，
//! 缺省字段取默认值。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// 存储后端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum StoreDriver {
    /// 进程内存储，重启即丢失
    Memory,
    /// sled 持久化存储
    Sled { path: PathBuf },
}

impl StoreDriver {
    pub fn name(&self) -> &'static str {
        match self {
            StoreDriver::Memory => "memory",
            StoreDriver::Sled { .. } => "sled",
        }
    }
}

/// 存储配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub store: StoreDriver,

    /// 首次重试间隔（秒），之后按指数退避
    pub retry_interval_secs: u64,

    /// 空轮询之间的间隔（秒）
    pub trans_cron_interval_secs: u64,

    /// 领取事务时的租约时长（秒）
    pub lock_expire_secs: u64,

    /// `update_time` 超过该时长的未完成事务视为孤儿（秒）
    pub reset_stale_after_secs: u64,

    /// 孤儿回收的执行间隔（秒）
    pub reset_interval_secs: u64,

    /// 单次孤儿回收的最大条数
    pub reset_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store: StoreDriver::Memory,
            retry_interval_secs: 10,
            trans_cron_interval_secs: 3,
            lock_expire_secs: 20,       // 2 × retry interval
            reset_stale_after_secs: 120,
            reset_interval_secs: 60,
            reset_limit: 100,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// sled 持久化配置
    pub fn sled<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            store: StoreDriver::Sled { path: path.into() },
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn with_retry_interval(mut self, secs: u64) -> Self {
        self.retry_interval_secs = secs;
        self
    }

    pub fn with_trans_cron_interval(mut self, secs: u64) -> Self {
        self.trans_cron_interval_secs = secs;
        self
    }

    pub fn with_lock_expire(mut self, secs: u64) -> Self {
        self.lock_expire_secs = secs;
        self
    }

    pub fn with_reset(mut self, stale_after_secs: u64, limit: usize) -> Self {
        self.reset_stale_after_secs = stale_after_secs;
        self.reset_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_interval_secs == 0 {
            return Err(ConfigError::Invalid("retry_interval_secs must be positive"));
        }
        if self.trans_cron_interval_secs == 0 {
            return Err(ConfigError::Invalid("trans_cron_interval_secs must be positive"));
        }
        if self.lock_expire_secs == 0 {
            return Err(ConfigError::Invalid("lock_expire_secs must be positive"));
        }
        if self.reset_limit == 0 {
            return Err(ConfigError::Invalid("reset_limit must be positive"));
        }
        // 孤儿判定窗口必须长于租约，否则正在处理的事务会被提前回收
        if self.reset_stale_after_secs <= self.lock_expire_secs {
            return Err(ConfigError::Invalid(
                "reset_stale_after_secs must exceed lock_expire_secs",
            ));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn trans_cron_interval(&self) -> Duration {
        Duration::from_secs(self.trans_cron_interval_secs)
    }

    pub fn lock_expire(&self) -> Duration {
        Duration::from_secs(self.lock_expire_secs)
    }

    pub fn reset_stale_after(&self) -> Duration {
        Duration::from_secs(self.reset_stale_after_secs)
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.reset_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.store, StoreDriver::Memory);
        assert_eq!(config.retry_interval(), Duration::from_secs(10));
        assert_eq!(config.lock_expire(), Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sled_config() {
        let json = r#"{
            "store": { "driver": "sled", "path": "/var/lib/txstore" },
            "retry_interval_secs": 5,
            "reset_limit": 50
        }"#;
        let config = StoreConfig::from_json_str(json).unwrap();

        assert_eq!(
            config.store,
            StoreDriver::Sled {
                path: PathBuf::from("/var/lib/txstore")
            }
        );
        assert_eq!(config.store.name(), "sled");
        assert_eq!(config.retry_interval_secs, 5);
        assert_eq!(config.reset_limit, 50);
        // 未给出的字段取默认值
        assert_eq!(config.trans_cron_interval_secs, 3);
    }

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(StoreConfig::from_json_str("{}").unwrap(), StoreConfig::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = StoreConfig::from_json_str(r#"{ "reset_limit": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = StoreConfig::from_json_str(r#"{ "store": { "driver": "mysql" } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_stale_window_must_exceed_lease() {
        let config = StoreConfig::default().with_lock_expire(30).with_reset(30, 10);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{ "lock_expire_secs": 40 }"#).unwrap();

        let config = StoreConfig::from_file(&path).unwrap();
        assert_eq!(config.lock_expire(), Duration::from_secs(40));
    }
}
