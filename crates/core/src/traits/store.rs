use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    GraphContext, GraphDefinition, GraphObject, GraphStatus, GraphTaskView, LeaseClaim,
    TaskDependency, TaskDependencyItem, TaskState,
};
use crate::TaskGraphResult;

/// 任务定位：任务图ID + 任务ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub graph_id: Uuid,
    pub task_id: Uuid,
}

impl TaskRef {
    pub fn new(graph_id: Uuid, task_id: Uuid) -> Self {
        Self { graph_id, task_id }
    }
}

impl From<&TaskDependency> for TaskRef {
    fn from(task: &TaskDependency) -> Self {
        Self::new(task.graph_id, task.task_id)
    }
}

/// 权威任务记录的状态更新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStateUpdate {
    pub task_id: Uuid,
    pub graph_id: Uuid,
    pub state: TaskState,
    /// 只在 `succeeded` 时保留
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// 任务图镜像的状态更新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphTaskStateUpdate {
    pub task_id: Uuid,
    pub graph_id: Uuid,
    pub state: TaskState,
    #[serde(default)]
    pub error: Option<String>,
    /// 合并进任务图共享上下文
    #[serde(default)]
    pub context: GraphContext,
}

/// 依赖传播的输入：某个任务到达了终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTransition {
    pub graph_id: Uuid,
    pub task_id: Uuid,
    pub state: TaskState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadyTasks {
    pub tasks: Vec<TaskDependency>,
    pub graph_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckoutResult {
    /// 调用方持有租约（包括重复领取）
    Acquired(TaskDependency),
    /// 已被其他工作节点持有，调用方应尝试其他任务
    Contended { owner: String },
    /// 未被租用但已不可领取（已结束或不可达）
    Unavailable,
}

impl CheckoutResult {
    pub fn is_acquired(&self) -> bool {
        matches!(self, CheckoutResult::Acquired(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphFinishedCheck {
    pub graph_id: Uuid,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphTransition {
    Applied(GraphObject),
    /// 已被其他参与者迁移到终态，不是错误
    AlreadyFinished { status: GraphStatus },
}

impl GraphTransition {
    pub fn status(&self) -> GraphStatus {
        match self {
            GraphTransition::Applied(graph) => graph.status,
            GraphTransition::AlreadyFinished { status } => *status,
        }
    }
}

/// 任务图协调存储的操作集合
///
/// 调度与执行层只通过该接口访问协调状态，两种存储引擎对外行为完全一致。
/// 传播类操作都可以安全地重复调用。
#[async_trait]
pub trait TaskGraphStore: Send + Sync {
    // 创建
    async fn persist_graph_definition(&self, definition: &GraphDefinition) -> TaskGraphResult<()>;

    async fn get_graph_definitions(
        &self,
        injectable_name: Option<&str>,
    ) -> TaskGraphResult<Vec<GraphDefinition>>;

    async fn get_graph_definition(&self, injectable_name: &str) -> TaskGraphResult<GraphDefinition>;

    async fn persist_graph_object(&self, graph: &GraphObject) -> TaskGraphResult<()>;

    async fn persist_task_dependencies(
        &self,
        item: &TaskDependencyItem,
        graph_id: Uuid,
    ) -> TaskGraphResult<TaskDependency>;

    // 查询
    async fn get_task_by_id(&self, task: &TaskRef) -> TaskGraphResult<GraphTaskView>;

    /// 不区分状态读取任务图
    async fn get_graph_by_id(&self, graph_id: Uuid) -> TaskGraphResult<Option<GraphObject>>;

    /// 任务图下全部任务的权威记录
    async fn get_graph_tasks(&self, graph_id: Uuid) -> TaskGraphResult<Vec<TaskDependency>>;

    async fn get_active_graph_by_id(&self, graph_id: Uuid) -> TaskGraphResult<Option<GraphObject>>;

    async fn find_active_graphs(&self, domain: &str) -> TaskGraphResult<Vec<GraphObject>>;

    async fn find_active_graph_for_target(&self, target: &str)
        -> TaskGraphResult<Option<GraphObject>>;

    async fn get_service_graphs(&self) -> TaskGraphResult<Vec<GraphObject>>;

    // 租约
    async fn find_ready_tasks(
        &self,
        domain: &str,
        graph_id: Option<Uuid>,
    ) -> TaskGraphResult<ReadyTasks>;

    async fn checkout_task(&self, worker_id: &str, task: &TaskRef)
        -> TaskGraphResult<CheckoutResult>;

    async fn get_own_tasks(&self, worker_id: &str) -> TaskGraphResult<Vec<TaskDependency>>;

    /// 返回续约成功的任务数
    async fn heartbeat_tasks_for_runner(&self, worker_id: &str) -> TaskGraphResult<usize>;

    async fn find_expired_leases(
        &self,
        domain: &str,
        lease_timeout: Duration,
    ) -> TaskGraphResult<Vec<TaskDependency>>;

    /// 观察到的租约仍然有效时才清除，返回是否清除
    async fn expire_lease(&self, task_id: Uuid, observed: &LeaseClaim) -> TaskGraphResult<bool>;

    // 完成与传播
    async fn set_task_state(&self, update: &TaskStateUpdate) -> TaskGraphResult<TaskDependency>;

    async fn set_task_state_in_graph(
        &self,
        update: &GraphTaskStateUpdate,
    ) -> TaskGraphResult<GraphObject>;

    /// 返回被移除依赖的下游任务数
    async fn update_dependent_tasks(&self, transition: &TaskTransition) -> TaskGraphResult<usize>;

    /// 返回新标记为不可达的任务数
    async fn update_unreachable_tasks(&self, transition: &TaskTransition)
        -> TaskGraphResult<usize>;

    async fn mark_task_evaluated(&self, task: &TaskRef) -> TaskGraphResult<TaskDependency>;

    // 任务图生命周期
    async fn check_graph_finished(&self, graph_id: Uuid) -> TaskGraphResult<GraphFinishedCheck>;

    async fn set_graph_done(
        &self,
        status: GraphStatus,
        graph_id: Uuid,
    ) -> TaskGraphResult<GraphTransition>;

    // 恢复与清理
    async fn find_unevaluated_tasks(
        &self,
        domain: &str,
        limit: Option<i64>,
    ) -> TaskGraphResult<Vec<TaskDependency>>;

    async fn find_completed_tasks(&self, limit: Option<i64>) -> TaskGraphResult<Vec<TaskDependency>>;

    async fn delete_tasks(&self, task_ids: &[Uuid]) -> TaskGraphResult<u64>;

    async fn delete_graph(&self, graph_id: Uuid) -> TaskGraphResult<u64>;
}
