use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{TaskGraphError, TaskGraphResult};

/// 任务状态
///
/// `Pending` 是唯一的非终态，其余状态均为终态（finished）。
/// 状态只允许从 `Pending` 单向迁移到某一个终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskState {
    /// 所有终态
    pub const FINISHED: [TaskState; 4] = [
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Cancelled,
        TaskState::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Timeout => "timeout",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskState::Pending)
    }

    /// 除当前状态以外的其他终态
    pub fn other_finished_states(&self) -> Vec<TaskState> {
        Self::FINISHED
            .iter()
            .copied()
            .filter(|s| s != self)
            .collect()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = TaskGraphError;

    fn from_str(s: &str) -> TaskGraphResult<Self> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "cancelled" => Ok(TaskState::Cancelled),
            "timeout" => Ok(TaskState::Timeout),
            _ => Err(TaskGraphError::Serialization(format!(
                "无效的任务状态: {s}"
            ))),
        }
    }
}

/// 依赖条件
///
/// 依赖任务必须到达的状态。`Finished` 表示任意终态都满足条件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequiredState {
    Exactly(TaskState),
    Finished,
}

impl RequiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequiredState::Exactly(state) => state.as_str(),
            RequiredState::Finished => "finished",
        }
    }

    /// 依赖任务以 `state` 结束时该条件是否被满足
    pub fn is_satisfied_by(&self, state: TaskState) -> bool {
        match self {
            RequiredState::Finished => state.is_finished(),
            RequiredState::Exactly(required) => *required == state && state.is_finished(),
        }
    }

    /// 依赖任务以 `state` 结束后该条件是否永远无法满足
    pub fn is_unsatisfiable_after(&self, state: TaskState) -> bool {
        match self {
            RequiredState::Finished => false,
            RequiredState::Exactly(required) => {
                state.is_finished() && state.other_finished_states().contains(required)
            }
        }
    }
}

impl fmt::Display for RequiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequiredState {
    type Err = TaskGraphError;

    fn from_str(s: &str) -> TaskGraphResult<Self> {
        if s == "finished" {
            return Ok(RequiredState::Finished);
        }
        match s.parse::<TaskState>()? {
            TaskState::Pending => Err(TaskGraphError::Serialization(
                "依赖条件不能是 pending".to_string(),
            )),
            state => Ok(RequiredState::Exactly(state)),
        }
    }
}

impl Serialize for RequiredState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RequiredState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 任务图状态，只会从 `Pending` 迁移一次到某个终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
    Timeout,
}

impl GraphStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphStatus::Pending => "pending",
            GraphStatus::Succeeded => "succeeded",
            GraphStatus::Failed => "failed",
            GraphStatus::Cancelled => "cancelled",
            GraphStatus::Timeout => "timeout",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, GraphStatus::Pending)
    }
}

impl From<TaskState> for GraphStatus {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Pending => GraphStatus::Pending,
            TaskState::Succeeded => GraphStatus::Succeeded,
            TaskState::Failed => GraphStatus::Failed,
            TaskState::Cancelled => GraphStatus::Cancelled,
            TaskState::Timeout => GraphStatus::Timeout,
        }
    }
}

impl fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GraphStatus {
    type Err = TaskGraphError;

    fn from_str(s: &str) -> TaskGraphResult<Self> {
        Ok(s.parse::<TaskState>()
            .map_err(|_| TaskGraphError::Serialization(format!("无效的任务图状态: {s}")))?
            .into())
    }
}
