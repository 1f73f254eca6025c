use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://taskgraph.db?mode=rwc".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            idle_timeout_seconds: 600,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }

        BackendKind::from_url(&self.url)?;

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }

        if self.min_connections > self.max_connections {
            return Err(anyhow::anyhow!("最小连接数不能大于最大连接数"));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }

        Ok(())
    }
}

/// 存储引擎类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 原子 find-and-modify（`UPDATE … RETURNING`）
    Postgres,
    /// 单行 compare-and-swap（影响行数 + 重新读取）
    Sqlite,
}

impl BackendKind {
    /// 根据连接URL的scheme识别存储引擎
    pub fn from_url(url: &str) -> anyhow::Result<Self> {
        if url.starts_with("postgresql://") || url.starts_with("postgres://") {
            Ok(BackendKind::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(BackendKind::Sqlite)
        } else {
            Err(anyhow::anyhow!("不支持的数据库URL: {url}"))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Postgres => "postgres",
            BackendKind::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(anyhow::anyhow!("无效的存储引擎: {other}")),
        }
    }
}
