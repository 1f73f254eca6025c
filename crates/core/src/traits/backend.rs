//! 存储后端能力接口
//!
//! 协调逻辑只依赖三类能力：读取单行、按固定访问模式查询、条件更新。
//! 两种存储引擎以各自的原生手段实现条件更新：
//!
//! - PostgreSQL：前置条件嵌入 `WHERE`，`RETURNING` 在一次往返中返回新行
//! - SQLite：`UPDATE … WHERE <前置条件>` 后检查影响行数，未生效时重新读取当前行
//!
//! 每次生效的变更都会写入新的 `rowrev`，作为后续条件更新的版本令牌。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::BackendKind;
use crate::models::{
    Dependencies, GraphContext, GraphDefinition, GraphObject, GraphStatus, GraphTaskEntry,
    LeaseClaim, TaskDependency, TaskState,
};
use crate::TaskGraphResult;

/// 条件更新结果
///
/// `applied == false` 时 `current` 是行的当前值，调用方据此决定重试或放弃
/// （其他参与者可能已经完成了同样的目标）。`current == None` 表示行已不存在。
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalUpdate<T> {
    pub applied: bool,
    pub current: Option<T>,
}

impl<T> ConditionalUpdate<T> {
    pub fn applied(row: T) -> Self {
        Self {
            applied: true,
            current: Some(row),
        }
    }

    pub fn rejected(current: Option<T>) -> Self {
        Self {
            applied: false,
            current,
        }
    }
}

/// 任务依赖记录的更新前置条件
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPrecondition {
    /// 行版本令牌未变化
    Revision(String),
    /// 租约持有者等于给定值（空字符串表示未租用）
    LeaseOwner(String),
    /// 租约持有者与心跳时间都与观察值一致
    LeaseClaim(LeaseClaim),
    /// 未租用、可达且仍处于 `pending`
    Claimable,
}

/// 任务图记录的更新前置条件
#[derive(Debug, Clone, PartialEq)]
pub enum GraphPrecondition {
    Revision(String),
    Status(GraphStatus),
}

/// 租约字段的变更
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseUpdate {
    Acquire {
        owner: String,
        heartbeat: DateTime<Utc>,
    },
    Renew {
        heartbeat: DateTime<Utc>,
    },
    Release,
}

/// 任务依赖记录的变更集合
///
/// `reachable` 只能被置为 `false`，`evaluated` 只能被置为 `true`，
/// 单调性由类型本身保证。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskMutation {
    pub state: Option<TaskState>,
    /// `Some(None)` 表示清空上下文
    pub context: Option<Option<serde_json::Value>>,
    pub dependencies: Option<Dependencies>,
    pub mark_unreachable: bool,
    pub mark_evaluated: bool,
    pub lease: Option<LeaseUpdate>,
}

impl TaskMutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn context(mut self, context: Option<serde_json::Value>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn dependencies(mut self, dependencies: Dependencies) -> Self {
        self.dependencies = Some(dependencies);
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.mark_unreachable = true;
        self
    }

    pub fn evaluated(mut self) -> Self {
        self.mark_evaluated = true;
        self
    }

    pub fn lease(mut self, lease: LeaseUpdate) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.context.is_none()
            && self.dependencies.is_none()
            && !self.mark_unreachable
            && !self.mark_evaluated
            && self.lease.is_none()
    }
}

/// 任务图记录的变更集合
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphMutation {
    pub tasks: Option<std::collections::BTreeMap<Uuid, GraphTaskEntry>>,
    pub context: Option<GraphContext>,
    pub status: Option<GraphStatus>,
}

impl GraphMutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(mut self, tasks: std::collections::BTreeMap<Uuid, GraphTaskEntry>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn context(mut self, context: GraphContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn status(mut self, status: GraphStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_none() && self.context.is_none() && self.status.is_none()
    }
}

/// 任务依赖记录的查询条件（固定访问模式，不是通用查询）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQuery {
    pub graph_id: Option<Uuid>,
    pub domain: Option<String>,
    pub states: Option<Vec<TaskState>>,
    pub reachable: Option<bool>,
    pub evaluated: Option<bool>,
    /// 精确匹配租约持有者，空字符串匹配未租用
    pub lease_owner: Option<String>,
    pub leased: Option<bool>,
    pub heartbeat_before: Option<DateTime<Utc>>,
    pub no_outstanding_dependencies: bool,
    /// 依赖集合中包含该任务
    pub depends_on: Option<Uuid>,
    pub limit: Option<i64>,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(mut self, graph_id: Uuid) -> Self {
        self.graph_id = Some(graph_id);
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn state(mut self, state: TaskState) -> Self {
        self.states = Some(vec![state]);
        self
    }

    pub fn states(mut self, states: Vec<TaskState>) -> Self {
        self.states = Some(states);
        self
    }

    pub fn reachable(mut self, reachable: bool) -> Self {
        self.reachable = Some(reachable);
        self
    }

    pub fn evaluated(mut self, evaluated: bool) -> Self {
        self.evaluated = Some(evaluated);
        self
    }

    pub fn lease_owner(mut self, owner: impl Into<String>) -> Self {
        self.lease_owner = Some(owner.into());
        self
    }

    pub fn leased(mut self, leased: bool) -> Self {
        self.leased = Some(leased);
        self
    }

    pub fn heartbeat_before(mut self, before: DateTime<Utc>) -> Self {
        self.heartbeat_before = Some(before);
        self
    }

    pub fn without_dependencies(mut self) -> Self {
        self.no_outstanding_dependencies = true;
        self
    }

    pub fn depends_on(mut self, task_id: Uuid) -> Self {
        self.depends_on = Some(task_id);
        self
    }

    pub fn limit(mut self, limit: Option<i64>) -> Self {
        self.limit = limit;
        self
    }
}

/// 任务图记录的查询条件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphQuery {
    pub instance_id: Option<Uuid>,
    pub domain: Option<String>,
    pub status: Option<GraphStatus>,
    pub context_target: Option<String>,
    pub service_graph: Option<bool>,
    pub limit: Option<i64>,
}

impl GraphQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn status(mut self, status: GraphStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn context_target(mut self, target: impl Into<String>) -> Self {
        self.context_target = Some(target.into());
        self
    }

    pub fn service_graph(mut self, service_graph: bool) -> Self {
        self.service_graph = Some(service_graph);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// 存储后端接口
///
/// 协调逻辑（重试循环、租约、依赖传播、任务图生命周期）只针对该接口编写一次，
/// 具体实现在启动时根据配置选择。
#[async_trait]
pub trait StoreBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// 幂等地创建表和索引
    async fn migrate(&self) -> TaskGraphResult<()>;

    async fn health_check(&self) -> TaskGraphResult<()>;

    async fn insert_task(&self, task: &TaskDependency) -> TaskGraphResult<()>;

    async fn read_task(&self, task_id: Uuid) -> TaskGraphResult<Option<TaskDependency>>;

    async fn query_tasks(&self, query: &TaskQuery) -> TaskGraphResult<Vec<TaskDependency>>;

    /// 当且仅当前置条件仍然成立时应用变更
    async fn try_update_task(
        &self,
        task_id: Uuid,
        precondition: &TaskPrecondition,
        mutation: &TaskMutation,
    ) -> TaskGraphResult<ConditionalUpdate<TaskDependency>>;

    async fn delete_tasks(&self, task_ids: &[Uuid]) -> TaskGraphResult<u64>;

    async fn insert_graph(&self, graph: &GraphObject) -> TaskGraphResult<()>;

    async fn read_graph(&self, instance_id: Uuid) -> TaskGraphResult<Option<GraphObject>>;

    async fn query_graphs(&self, query: &GraphQuery) -> TaskGraphResult<Vec<GraphObject>>;

    async fn try_update_graph(
        &self,
        instance_id: Uuid,
        precondition: &GraphPrecondition,
        mutation: &GraphMutation,
    ) -> TaskGraphResult<ConditionalUpdate<GraphObject>>;

    async fn delete_graph(&self, instance_id: Uuid) -> TaskGraphResult<u64>;

    /// 插入或覆盖同名定义
    async fn upsert_graph_definition(&self, definition: &GraphDefinition) -> TaskGraphResult<()>;

    async fn query_graph_definitions(
        &self,
        injectable_name: Option<&str>,
    ) -> TaskGraphResult<Vec<GraphDefinition>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_mutations() {
        assert!(TaskMutation::new().is_empty());
        assert!(!TaskMutation::new().evaluated().is_empty());
        assert!(!TaskMutation::new().context(None).is_empty());
        assert!(GraphMutation::new().is_empty());
        assert!(!GraphMutation::new().status(GraphStatus::Failed).is_empty());
    }

    #[test]
    fn test_task_query_builder() {
        let graph_id = Uuid::new_v4();
        let query = TaskQuery::new()
            .graph(graph_id)
            .state(TaskState::Pending)
            .reachable(true)
            .lease_owner("")
            .without_dependencies();
        assert_eq!(query.graph_id, Some(graph_id));
        assert_eq!(query.states, Some(vec![TaskState::Pending]));
        assert_eq!(query.lease_owner.as_deref(), Some(""));
        assert!(query.no_outstanding_dependencies);
        assert_eq!(query.limit, None);
    }
}
