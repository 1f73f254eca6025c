use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    coordination::{CleanupConfig, LeaseConfig, RecoveryConfig, StoreConfig},
    database::{BackendKind, DatabaseConfig},
    observability::ObservabilityConfig,
    worker::WorkerConfig,
};

/// 环境变量前缀，嵌套字段用 `__` 分隔，例如 `TASKGRAPH_LEASE__TIMEOUT_SECONDS`
pub const ENV_PREFIX: &str = "TASKGRAPH";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub lease: LeaseConfig,
    pub worker: WorkerConfig,
    pub recovery: RecoveryConfig,
    pub cleanup: CleanupConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: TASKGRAPH_)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder()
            .add_source(ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/taskgraph.toml",
                "taskgraph.toml",
                "/etc/taskgraph/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("store.domains")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.store.validate().context("存储配置验证失败")?;
        self.store
            .resolve_backend(&self.database)
            .context("存储引擎配置验证失败")?;
        self.lease.validate().context("租约配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.recovery.validate().context("恢复配置验证失败")?;
        self.cleanup.validate().context("清理配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }

    pub fn backend_kind(&self) -> Result<BackendKind> {
        self.store.resolve_backend(&self.database)
    }
}
