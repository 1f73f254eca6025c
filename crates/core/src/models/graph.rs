use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{GraphStatus, TaskState, DEFAULT_DOMAIN};

/// 共享上下文，任务完成时合并而不是覆盖
pub type GraphContext = serde_json::Map<String, serde_json::Value>;

/// 任务图中任务状态的镜像条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphTaskEntry {
    pub label: String,
    pub task_name: String,
    #[serde(default)]
    pub options: serde_json::Value,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 任务图实例记录
///
/// `tasks` 是任务状态的最终一致镜像，只用于单次读取的状态查询，
/// 调度决策始终以任务依赖记录为准。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphObject {
    pub instance_id: Uuid,
    pub name: String,
    /// 创建时的定义快照，之后不再变化
    pub definition: serde_json::Value,
    pub tasks: BTreeMap<Uuid, GraphTaskEntry>,
    pub context: GraphContext,
    pub status: GraphStatus,
    pub domain: String,
    pub context_target: String,
    pub service_graph: bool,
    pub rowrev: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraphObject {
    pub fn new(name: impl Into<String>, definition: serde_json::Value, context: GraphContext) -> Self {
        let now = Utc::now();
        let context_target = context
            .get("target")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Self {
            instance_id: Uuid::new_v4(),
            name: name.into(),
            definition,
            tasks: BTreeMap::new(),
            context,
            status: GraphStatus::Pending,
            domain: DEFAULT_DOMAIN.to_string(),
            context_target,
            service_graph: false,
            rowrev: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == GraphStatus::Pending
    }
}

/// 按ID读取的任务视图（来自任务图镜像）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphTaskView {
    pub graph_id: Uuid,
    pub context: GraphContext,
    pub task: Option<GraphTaskEntry>,
}
