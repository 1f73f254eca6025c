pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application};
pub use shutdown::ShutdownManager;
