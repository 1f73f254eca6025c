pub mod postgres_store_backend;

pub use postgres_store_backend::PostgresStoreBackend;
