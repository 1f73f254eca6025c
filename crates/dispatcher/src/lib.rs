//! 任务图协调
//!
//! 基于 [`StoreBackend`](taskgraph_core::traits::StoreBackend) 条件更新能力实现的协调逻辑：
//! 重试循环、租约、依赖传播、任务图生命周期，以及运行在协调节点上的后台服务。

pub mod completion;
pub mod graph_cleaner;
pub mod graph_factory;
pub mod lease;
pub mod lease_reaper;
pub mod lifecycle;
pub mod propagation;
pub mod recovery_service;
pub mod retry_loop;
pub mod store;

pub use completion::{CompletionOutcome, TaskCompletionService, TaskReport};
pub use graph_cleaner::{CleanupReport, CompletedGraphCleaner, GraphCleanerConfig, GraphCleanerService};
pub use graph_factory::{GraphFactory, GraphInstance};
pub use lease_reaper::{LeaseReaper, LeaseReaperConfig, LeaseReaperService};
pub use recovery_service::{RecoveryReport, RecoveryService, RecoveryServiceConfig, SystemRecoveryService};
pub use retry_loop::{CasRecord, RetryLoop, RetryPolicy, UpdateOutcome};
pub use store::CoordinationStore;
