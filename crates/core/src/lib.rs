pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::{AppConfig, BackendKind};
pub use errors::*;
pub use traits::*;
