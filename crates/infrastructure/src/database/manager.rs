use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use taskgraph_core::{
    config::{BackendKind, DatabaseConfig},
    traits::StoreBackend,
    AppConfig, TaskGraphError, TaskGraphResult,
};
use tracing::info;

use super::postgres::PostgresStoreBackend;
use super::sqlite::SqliteStoreBackend;

/// Database connection pool enum
pub enum DatabasePool {
    PostgreSQL(sqlx::PgPool),
    SQLite(sqlx::SqlitePool),
}

impl DatabasePool {
    pub async fn new(config: &DatabaseConfig, kind: BackendKind) -> TaskGraphResult<Self> {
        let acquire_timeout = Duration::from_secs(config.connection_timeout_seconds);
        let idle_timeout = Duration::from_secs(config.idle_timeout_seconds);

        match kind {
            BackendKind::Postgres => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .connect(&config.url)
                    .await
                    .map_err(|e| TaskGraphError::BackendUnavailable(e.to_string()))?;
                Ok(DatabasePool::PostgreSQL(pool))
            }
            BackendKind::Sqlite => {
                let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");
                let mut options = SqliteConnectOptions::from_str(&config.url)
                    .map_err(|e| TaskGraphError::config_error(format!("无效的SQLite URL: {e}")))?
                    .create_if_missing(true)
                    .busy_timeout(Duration::from_secs(5));
                if !in_memory {
                    options = options.journal_mode(SqliteJournalMode::Wal);
                }

                // 内存库的每个连接都是独立的数据库，只能共享一个常驻连接
                let pool_options = if in_memory {
                    SqlitePoolOptions::new()
                        .max_connections(1)
                        .min_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None)
                } else {
                    SqlitePoolOptions::new()
                        .max_connections(config.max_connections)
                        .min_connections(config.min_connections)
                        .idle_timeout(idle_timeout)
                };

                let pool = pool_options
                    .acquire_timeout(acquire_timeout)
                    .connect_with(options)
                    .await
                    .map_err(|e| TaskGraphError::BackendUnavailable(e.to_string()))?;
                Ok(DatabasePool::SQLite(pool))
            }
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self {
            DatabasePool::PostgreSQL(_) => BackendKind::Postgres,
            DatabasePool::SQLite(_) => BackendKind::Sqlite,
        }
    }

    pub async fn close(&self) {
        match self {
            DatabasePool::PostgreSQL(pool) => pool.close().await,
            DatabasePool::SQLite(pool) => pool.close().await,
        }
    }
}

/// 数据库管理器：创建连接池并构造对应的存储后端
pub struct DatabaseManager {
    pool: DatabasePool,
    backend: Arc<dyn StoreBackend>,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig, kind: BackendKind) -> TaskGraphResult<Self> {
        let pool = DatabasePool::new(config, kind).await?;
        let backend: Arc<dyn StoreBackend> = match &pool {
            DatabasePool::PostgreSQL(pool) => Arc::new(PostgresStoreBackend::new(pool.clone())),
            DatabasePool::SQLite(pool) => Arc::new(SqliteStoreBackend::new(pool.clone())),
        };
        info!("已连接存储后端: {}", kind);
        Ok(Self { pool, backend })
    }

    /// 按应用配置选择存储引擎
    pub async fn from_config(config: &AppConfig) -> TaskGraphResult<Self> {
        let kind = config
            .backend_kind()
            .map_err(|e| TaskGraphError::config_error(e.to_string()))?;
        Self::new(&config.database, kind).await
    }

    /// 使用给定URL连接，引擎由URL识别
    pub async fn connect(url: &str) -> TaskGraphResult<Self> {
        let kind = BackendKind::from_url(url).map_err(|e| TaskGraphError::config_error(e.to_string()))?;
        let config = DatabaseConfig {
            url: url.to_string(),
            ..DatabaseConfig::default()
        };
        Self::new(&config, kind).await
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.pool.backend_kind()
    }

    pub fn store_backend(&self) -> Arc<dyn StoreBackend> {
        Arc::clone(&self.backend)
    }

    pub async fn migrate(&self) -> TaskGraphResult<()> {
        self.backend.migrate().await
    }

    pub async fn health_check(&self) -> TaskGraphResult<()> {
        self.backend.health_check().await
    }

    pub async fn close(&self) {
        self.pool.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_database_manager() {
        let db_manager = DatabaseManager::connect("sqlite::memory:").await.unwrap();

        assert_eq!(db_manager.backend_kind(), BackendKind::Sqlite);
        assert_eq!(db_manager.store_backend().kind(), BackendKind::Sqlite);
        assert!(db_manager.health_check().await.is_ok());

        db_manager.migrate().await.unwrap();
        // 迁移可重复执行
        db_manager.migrate().await.unwrap();

        db_manager.close().await;
    }

    #[tokio::test]
    async fn test_unsupported_url_rejected() {
        let result = DatabaseManager::connect("mysql://localhost/db").await;
        assert!(matches!(result, Err(TaskGraphError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_from_app_config() {
        let mut config = AppConfig::default();
        config.database.url = "sqlite::memory:".to_string();
        let db_manager = DatabaseManager::from_config(&config).await.unwrap();
        assert_eq!(db_manager.backend_kind(), BackendKind::Sqlite);
        db_manager.close().await;
    }
}
