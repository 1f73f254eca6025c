use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{RequiredState, TaskState};

/// 默认任务域
pub const DEFAULT_DOMAIN: &str = "default";

/// 未完成的依赖集合：依赖任务ID -> 需要达到的状态
pub type Dependencies = BTreeMap<Uuid, RequiredState>;

/// 任务依赖记录
///
/// 每个任务实例一条，是任务状态、租约和依赖集合的权威来源。
///
/// # 不变量
///
/// - `dependencies` 只会缩小
/// - `reachable` 只会从 `true` 变为 `false`
/// - `state` 只会从 `Pending` 迁移到某一个终态
/// - 每次变更都会写入新的 `rowrev`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub graph_id: Uuid,
    pub domain: String,
    pub state: TaskState,
    pub reachable: bool,
    pub evaluated: bool,
    pub dependencies: Dependencies,
    pub terminal_on_states: Vec<TaskState>,
    /// 空字符串表示未被租用
    pub lease_owner: String,
    pub lease_heartbeat: DateTime<Utc>,
    pub context: Option<serde_json::Value>,
    pub rowrev: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 提交任务图时每个任务的依赖描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDependencyItem {
    pub task_id: Uuid,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default)]
    pub terminal_on_states: Vec<TaskState>,
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

/// 某一时刻观察到的租约持有情况
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseClaim {
    pub owner: String,
    pub heartbeat: DateTime<Utc>,
}

impl TaskDependency {
    /// 根据依赖描述创建新的待执行记录
    pub fn new(item: &TaskDependencyItem, graph_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            task_id: item.task_id,
            graph_id,
            domain: item.domain.clone(),
            state: TaskState::Pending,
            reachable: true,
            evaluated: false,
            dependencies: item.dependencies.clone(),
            terminal_on_states: item.terminal_on_states.clone(),
            lease_owner: String::new(),
            lease_heartbeat: now,
            context: None,
            rowrev: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 可调度：可达、待执行、且没有未满足的依赖
    pub fn is_ready(&self) -> bool {
        self.reachable && self.state == TaskState::Pending && self.dependencies.is_empty()
    }

    pub fn is_leased(&self) -> bool {
        !self.lease_owner.is_empty()
    }

    pub fn is_leased_by(&self, owner: &str) -> bool {
        self.is_leased() && self.lease_owner == owner
    }

    pub fn lease_claim(&self) -> Option<LeaseClaim> {
        self.is_leased().then(|| LeaseClaim {
            owner: self.lease_owner.clone(),
            heartbeat: self.lease_heartbeat,
        })
    }

    /// 租约心跳是否早于 `now - timeout`
    pub fn is_lease_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.is_leased() && self.lease_heartbeat < now - timeout
    }

    /// 已结束且效果已传播
    pub fn is_completed(&self) -> bool {
        !self.reachable || (self.evaluated && self.state.is_finished())
    }

    pub fn depends_on(&self, task_id: &Uuid) -> Option<RequiredState> {
        self.dependencies.get(task_id).copied()
    }
}
