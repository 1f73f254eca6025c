use thiserror::Error;
use uuid::Uuid;

use crate::models::{GraphStatus, TaskState};

/// 任务图协调错误类型定义
#[derive(Debug, Error)]
pub enum TaskGraphError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("存储后端不可用: {0}")]
    BackendUnavailable(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: Uuid },

    #[error("任务图未找到: {id}")]
    GraphNotFound { id: Uuid },

    #[error("任务图定义未找到: {name}")]
    GraphDefinitionNotFound { name: String },

    #[error("条件更新冲突: {entity} 在 {attempts} 次尝试后仍未成功")]
    ConcurrencyConflict { entity: String, attempts: u32 },

    #[error("无效的任务状态转换: 任务 {task_id} 从 {from} 到 {to}")]
    InvalidStateTransition {
        task_id: Uuid,
        from: TaskState,
        to: TaskState,
    },

    #[error("无效的任务图状态: {0}")]
    InvalidGraphStatus(GraphStatus),

    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),

    #[error("无效的任务依赖: 任务 {task} 依赖 {dependency} - {reason}")]
    InvalidDependency {
        task: String,
        dependency: String,
        reason: String,
    },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("任务执行超时")]
    ExecutionTimeout,

    #[error("数据验证失败: {0}")]
    ValidationError(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl TaskGraphError {
    pub fn task_not_found(id: Uuid) -> Self {
        Self::TaskNotFound { id }
    }

    pub fn graph_not_found(id: Uuid) -> Self {
        Self::GraphNotFound { id }
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }

    /// NotFound类错误直接返回调用方，不在内部重试
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TaskGraphError::TaskNotFound { .. }
                | TaskGraphError::GraphNotFound { .. }
                | TaskGraphError::GraphDefinitionNotFound { .. }
        )
    }

    /// 调用方可以整体重试的错误（传输层故障、冲突上限）
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskGraphError::BackendUnavailable(_) | TaskGraphError::ConcurrencyConflict { .. } => {
                true
            }
            TaskGraphError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TaskGraphError::Internal(_) | TaskGraphError::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for TaskGraphError {
    fn from(err: serde_json::Error) -> Self {
        TaskGraphError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for TaskGraphError {
    fn from(err: anyhow::Error) -> Self {
        TaskGraphError::Internal(err.to_string())
    }
}

/// 统一的Result类型
pub type TaskGraphResult<T> = std::result::Result<T, TaskGraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::nil();
        assert_eq!(
            TaskGraphError::task_not_found(id).to_string(),
            format!("任务未找到: {id}")
        );
        assert_eq!(
            TaskGraphError::ExecutionTimeout.to_string(),
            "任务执行超时"
        );
        let conflict = TaskGraphError::ConcurrencyConflict {
            entity: "graph".to_string(),
            attempts: 21,
        };
        assert_eq!(
            conflict.to_string(),
            "条件更新冲突: graph 在 21 次尝试后仍未成功"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(TaskGraphError::BackendUnavailable("down".into()).is_retryable());
        assert!(TaskGraphError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!TaskGraphError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(!TaskGraphError::graph_not_found(Uuid::nil()).is_retryable());
        assert!(TaskGraphError::graph_not_found(Uuid::nil()).is_not_found());
        assert!(TaskGraphError::config_error("x").is_fatal());
    }

    #[test]
    fn test_from_serde_json() {
        let err: TaskGraphError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, TaskGraphError::Serialization(_)));
    }
}
