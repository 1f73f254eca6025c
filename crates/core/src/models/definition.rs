use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{RequiredState, TaskState};

/// 任务图定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefinition {
    pub injectable_name: String,
    pub friendly_name: String,
    pub tasks: Vec<TaskDefinitionEntry>,
    #[serde(default)]
    pub service_graph: bool,
}

/// 定义中的单个任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinitionEntry {
    pub label: String,
    pub task_name: String,
    /// 依赖任务的label -> 需要达到的状态
    #[serde(default)]
    pub wait_on: BTreeMap<String, RequiredState>,
    /// 未设置时默认为失败、超时、取消
    #[serde(default)]
    pub terminal_on_states: Option<Vec<TaskState>>,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl TaskDefinitionEntry {
    pub fn terminal_states(&self) -> Vec<TaskState> {
        self.terminal_on_states.clone().unwrap_or_else(|| {
            vec![TaskState::Failed, TaskState::Timeout, TaskState::Cancelled]
        })
    }
}
