pub mod sqlite_store_backend;

pub use sqlite_store_backend::SqliteStoreBackend;
