//! # 工作节点运行时
//!
//! 工作节点之间不共享内存，只通过协调存储交换状态：
//!
//! 1. 查询所在任务域的就绪任务并领取（条件更新，至多一个持有者）
//! 2. 按任务名找到执行器，在超时限制内执行
//! 3. 通过完成流水线上报结果，推进下游任务和任务图状态
//!
//! 执行期间由 [`HeartbeatManager`] 为持有的租约续约。

pub mod executors;
pub mod heartbeat;
pub mod registry;
pub mod service;

pub use executors::{
    ExecutionContext, ExecutionOutput, NoopExecutor, ShellExecutor, ShellTaskParams, TaskExecutor,
};
pub use heartbeat::HeartbeatManager;
pub use registry::ExecutorRegistry;
pub use service::{default_worker_id, WorkerService, WorkerServiceBuilder, WorkerServiceConfig};
