use serde::{Deserialize, Serialize};

use super::database::{BackendKind, DatabaseConfig};

/// 协调存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `auto`、`postgres` 或 `sqlite`
    pub backend: String,
    /// 条件更新重试达到该次数时输出诊断告警
    pub retry_warn_threshold: u32,
    /// 重试上限，0 表示不限
    pub retry_max_attempts: u32,
    /// 超过告警阈值后每次重试前的最大随机退避
    pub retry_backoff_max_ms: u64,
    /// 后台服务（租约回收、恢复）负责的任务域
    pub domains: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "auto".to_string(),
            retry_warn_threshold: 20,
            retry_max_attempts: 0,
            retry_backoff_max_ms: 50,
            domains: vec![crate::models::DEFAULT_DOMAIN.to_string()],
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend != "auto" {
            self.backend.parse::<BackendKind>()?;
        }

        if self.retry_warn_threshold == 0 {
            return Err(anyhow::anyhow!("重试告警阈值必须大于0"));
        }

        if self.domains.iter().any(|d| d.is_empty()) {
            return Err(anyhow::anyhow!("任务域不能为空字符串"));
        }

        Ok(())
    }

    /// `auto` 时按数据库URL识别
    pub fn resolve_backend(&self, database: &DatabaseConfig) -> anyhow::Result<BackendKind> {
        if self.backend == "auto" {
            BackendKind::from_url(&database.url)
        } else {
            let kind: BackendKind = self.backend.parse()?;
            let detected = BackendKind::from_url(&database.url)?;
            if kind != detected {
                return Err(anyhow::anyhow!(
                    "存储引擎 {kind} 与数据库URL不匹配 ({detected})"
                ));
            }
            Ok(kind)
        }
    }

    pub fn max_attempts(&self) -> Option<u32> {
        (self.retry_max_attempts > 0).then_some(self.retry_max_attempts)
    }
}

/// 租约配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub timeout_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub reap_interval_seconds: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
            heartbeat_interval_seconds: 10,
            reap_interval_seconds: 15,
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("租约超时时间必须大于0"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.heartbeat_interval_seconds >= self.timeout_seconds {
            return Err(anyhow::anyhow!("心跳间隔必须小于租约超时时间"));
        }

        if self.reap_interval_seconds == 0 {
            return Err(anyhow::anyhow!("租约回收间隔必须大于0"));
        }

        Ok(())
    }

    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timeout_seconds as i64)
    }
}

/// 恢复服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub batch_size: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            batch_size: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("恢复间隔必须大于0"));
        }
        if self.batch_size <= 0 {
            return Err(anyhow::anyhow!("恢复批量大小必须大于0"));
        }
        Ok(())
    }
}

/// 已完成任务图清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub batch_size: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            batch_size: 500,
        }
    }
}

impl CleanupConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("清理间隔必须大于0"));
        }
        if self.batch_size <= 0 {
            return Err(anyhow::anyhow!("清理批量大小必须大于0"));
        }
        Ok(())
    }
}
