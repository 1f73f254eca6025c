pub mod app_config;
pub mod coordination;
pub mod database;
pub mod observability;
pub mod worker;

pub use app_config::{AppConfig, ENV_PREFIX};
pub use coordination::{CleanupConfig, LeaseConfig, RecoveryConfig, StoreConfig};
pub use database::{BackendKind, DatabaseConfig};
pub use observability::ObservabilityConfig;
pub use worker::WorkerConfig;
