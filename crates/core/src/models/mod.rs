//! # 数据模型
//!
//! 任务图协调存储持久化的三类记录：
//!
//! ### TaskDependency - 任务依赖记录
//! 每个任务实例一条，是任务状态、租约、依赖集合的权威来源。
//!
//! ### GraphObject - 任务图记录
//! 每个任务图实例一条，内嵌任务状态镜像和共享上下文。
//!
//! ### GraphDefinition - 任务图定义
//! 实例化任务图时使用的模板，按 `injectable_name` 唯一。
//!
//! ## 状态流转
//!
//! ```text
//! 任务:   pending → succeeded | failed | cancelled | timeout
//! 任务图: pending → succeeded | failed | cancelled | timeout  (只迁移一次)
//! 租约:   未租用 → 租用(owner) → 未租用
//! ```

pub mod definition;
pub mod graph;
pub mod state;
pub mod task_dependency;

pub use definition::*;
pub use graph::*;
pub use state::*;
pub use task_dependency::*;
