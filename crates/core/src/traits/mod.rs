pub mod backend;
pub mod store;

pub use backend::*;
pub use store::*;
