//! 任务图生命周期：完成判定、终态迁移、恢复与清理查询

use std::collections::HashSet;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use taskgraph_core::{
    models::{GraphStatus, TaskDependency, TaskState},
    traits::{GraphFinishedCheck, GraphMutation, GraphPrecondition, GraphTransition, TaskQuery},
    TaskGraphError, TaskGraphResult,
};

use crate::store::CoordinationStore;

impl CoordinationStore {
    /// 镜像中的任务都已写入依赖记录，且没有可达且仍在 pending 的任务，才视为完成
    ///
    /// 提交过程中记录逐条写入，缺记录时先完成的任务不能结束任务图。
    pub(crate) async fn graph_finished(&self, graph_id: Uuid) -> TaskGraphResult<GraphFinishedCheck> {
        let Some(graph) = self.backend.read_graph(graph_id).await? else {
            return Ok(GraphFinishedCheck {
                graph_id,
                done: false,
            });
        };
        let tasks = self
            .backend
            .query_tasks(&TaskQuery::new().graph(graph_id))
            .await?;

        let persisted = tasks
            .iter()
            .filter(|task| graph.tasks.contains_key(&task.task_id))
            .count();
        if persisted < graph.tasks.len() {
            debug!(
                "任务图 {} 仅写入 {}/{} 条任务记录，暂不判定完成",
                graph_id,
                persisted,
                graph.tasks.len()
            );
            return Ok(GraphFinishedCheck {
                graph_id,
                done: false,
            });
        }

        let pending = tasks
            .iter()
            .any(|task| task.reachable && task.state == TaskState::Pending);
        Ok(GraphFinishedCheck {
            graph_id,
            done: !pending,
        })
    }

    /// pending → 终态只会成功一次，后到的参与者得到 `AlreadyFinished`
    #[instrument(skip(self))]
    pub(crate) async fn finish_graph(
        &self,
        status: GraphStatus,
        graph_id: Uuid,
    ) -> TaskGraphResult<GraphTransition> {
        if !status.is_finished() {
            return Err(TaskGraphError::InvalidGraphStatus(status));
        }

        let result = self
            .backend
            .try_update_graph(
                graph_id,
                &GraphPrecondition::Status(GraphStatus::Pending),
                &GraphMutation::new().status(status),
            )
            .await?;

        if result.applied {
            let graph = result
                .current
                .ok_or_else(|| TaskGraphError::graph_not_found(graph_id))?;
            metrics::counter!("taskgraph_graphs_completed_total", "status" => status.as_str())
                .increment(1);
            info!("任务图 {} ({}) 已结束: {}", graph.name, graph_id, status);
            return Ok(GraphTransition::Applied(graph));
        }

        match result.current {
            Some(graph) => Ok(GraphTransition::AlreadyFinished {
                status: graph.status,
            }),
            None => Err(TaskGraphError::graph_not_found(graph_id)),
        }
    }

    /// 已结束但完成后的传播尚未确认的任务
    pub(crate) async fn unevaluated_tasks(
        &self,
        domain: &str,
        limit: Option<i64>,
    ) -> TaskGraphResult<Vec<TaskDependency>> {
        self.backend
            .query_tasks(
                &TaskQuery::new()
                    .domain(domain)
                    .reachable(true)
                    .evaluated(false)
                    .states(TaskState::FINISHED.to_vec())
                    .limit(limit),
            )
            .await
    }

    /// 不可达的任务，以及已结束并完成传播的任务
    pub(crate) async fn completed_tasks(
        &self,
        limit: Option<i64>,
    ) -> TaskGraphResult<Vec<TaskDependency>> {
        let unreachable = self
            .backend
            .query_tasks(&TaskQuery::new().reachable(false).limit(limit))
            .await?;
        let evaluated = self
            .backend
            .query_tasks(
                &TaskQuery::new()
                    .evaluated(true)
                    .states(TaskState::FINISHED.to_vec())
                    .limit(limit),
            )
            .await?;

        let mut seen = HashSet::new();
        let mut tasks: Vec<TaskDependency> = unreachable
            .into_iter()
            .chain(evaluated)
            .filter(|task| seen.insert(task.task_id))
            .collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        if let Some(limit) = limit {
            tasks.truncate(limit.max(0) as usize);
        }
        Ok(tasks)
    }
}
