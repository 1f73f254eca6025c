pub mod manager;
pub mod mapping;
pub mod postgres;
pub mod sqlite;

pub use manager::{DatabaseManager, DatabasePool};
pub use postgres::PostgresStoreBackend;
pub use sqlite::SqliteStoreBackend;
