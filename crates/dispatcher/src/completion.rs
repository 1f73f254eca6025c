use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use taskgraph_core::{
    models::{GraphContext, GraphStatus, TaskDependency, TaskState},
    traits::{
        GraphTaskStateUpdate, GraphTransition, TaskGraphStore, TaskRef, TaskStateUpdate,
        TaskTransition,
    },
    TaskGraphResult,
};

/// 工作节点上报的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub graph_id: Uuid,
    pub task_id: Uuid,
    pub state: TaskState,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

impl TaskReport {
    pub fn succeeded(task: TaskRef, context: Option<serde_json::Value>) -> Self {
        Self {
            graph_id: task.graph_id,
            task_id: task.task_id,
            state: TaskState::Succeeded,
            error: None,
            context,
        }
    }

    pub fn failed(task: TaskRef, state: TaskState, error: impl Into<String>) -> Self {
        Self {
            graph_id: task.graph_id,
            task_id: task.task_id,
            state,
            error: Some(error.into()),
            context: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutcome {
    pub task: TaskDependency,
    pub resolved_dependents: usize,
    pub unreachable_dependents: usize,
    /// `None` 表示任务图仍在运行
    pub graph: Option<GraphTransition>,
}

/// 任务完成流水线
///
/// 权威记录 → 下游依赖 → 不可达传播 → 任务图镜像 → 标记已评估 → 任务图判定。
/// 每一步都可以重复执行，中途失败后由恢复扫描从头重跑。
pub struct TaskCompletionService {
    store: Arc<dyn TaskGraphStore>,
}

impl TaskCompletionService {
    pub fn new(store: Arc<dyn TaskGraphStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, report), fields(task_id = %report.task_id, state = %report.state))]
    pub async fn complete(&self, report: &TaskReport) -> TaskGraphResult<CompletionOutcome> {
        let record = self
            .store
            .set_task_state(&TaskStateUpdate {
                task_id: report.task_id,
                graph_id: report.graph_id,
                state: report.state,
                context: report.context.clone(),
            })
            .await?;
        self.propagate(&record, report.error.clone()).await
    }

    /// 对已经进入终态的记录执行其余步骤
    pub async fn propagate(
        &self,
        record: &TaskDependency,
        error: Option<String>,
    ) -> TaskGraphResult<CompletionOutcome> {
        let transition = TaskTransition {
            graph_id: record.graph_id,
            task_id: record.task_id,
            state: record.state,
        };

        let resolved_dependents = self.store.update_dependent_tasks(&transition).await?;
        let unreachable_dependents = self.store.update_unreachable_tasks(&transition).await?;

        let context = match (&record.state, &record.context) {
            (TaskState::Succeeded, Some(serde_json::Value::Object(map))) => map.clone(),
            _ => GraphContext::new(),
        };
        self.store
            .set_task_state_in_graph(&GraphTaskStateUpdate {
                task_id: record.task_id,
                graph_id: record.graph_id,
                state: record.state,
                error,
                context,
            })
            .await?;

        let task = self.store.mark_task_evaluated(&TaskRef::from(record)).await?;
        let graph = self.evaluate_graph(record.graph_id, Some(&task)).await?;

        debug!(
            "任务 {} 传播完成: 满足依赖 {} 个, 不可达 {} 个",
            record.task_id, resolved_dependents, unreachable_dependents
        );
        Ok(CompletionOutcome {
            task,
            resolved_dependents,
            unreachable_dependents,
            graph,
        })
    }

    /// 终止状态命中时直接结束任务图，否则在没有待执行任务时结束
    ///
    /// 未命中终止状态而结束时，只要有可达任务以失败、超时或取消结束，任务图即为
    /// `Failed`，即使依赖该失败的处理分支已经成功。
    pub async fn evaluate_graph(
        &self,
        graph_id: Uuid,
        finished_task: Option<&TaskDependency>,
    ) -> TaskGraphResult<Option<GraphTransition>> {
        if let Some(task) = finished_task {
            if task.terminal_on_states.contains(&task.state) {
                info!(
                    "任务 {} 以终止状态 {} 结束，任务图 {} 随之结束",
                    task.task_id, task.state, graph_id
                );
                let transition = self.store.set_graph_done(task.state.into(), graph_id).await?;
                return Ok(Some(transition));
            }
        }

        if !self.store.check_graph_finished(graph_id).await?.done {
            return Ok(None);
        }

        let tasks = self.store.get_graph_tasks(graph_id).await?;
        let unsuccessful = tasks
            .iter()
            .any(|t| t.reachable && t.state.is_finished() && t.state != TaskState::Succeeded);
        let status = if unsuccessful {
            GraphStatus::Failed
        } else {
            GraphStatus::Succeeded
        };
        let transition = self.store.set_graph_done(status, graph_id).await?;
        Ok(Some(transition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_constructors() {
        let task = TaskRef::new(Uuid::new_v4(), Uuid::new_v4());
        let ok = TaskReport::succeeded(task, Some(serde_json::json!({ "ip": "10.0.0.1" })));
        assert_eq!(ok.state, TaskState::Succeeded);
        assert!(ok.error.is_none());

        let failed = TaskReport::failed(task, TaskState::Timeout, "执行超时");
        assert_eq!(failed.state, TaskState::Timeout);
        assert_eq!(failed.error.as_deref(), Some("执行超时"));
        assert!(failed.context.is_none());
    }

    #[test]
    fn test_report_serde() {
        let task = TaskRef::new(Uuid::new_v4(), Uuid::new_v4());
        let report = TaskReport::failed(task, TaskState::Failed, "boom");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["graphId"], task.graph_id.to_string());
        let back: TaskReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
