//! 配置管理
//!
//! 加载顺序：内置默认值 → TOML 配置文件 → `TASKGRAPH_*` 环境变量。
//! 每个配置段各自提供 `validate()`，`AppConfig::load` 在返回前统一校验。

pub mod models;


pub use models::*;
