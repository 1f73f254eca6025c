use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use taskgraph_core::{
    config::StoreConfig,
    models::{
        GraphDefinition, GraphObject, GraphStatus, GraphTaskView, LeaseClaim, TaskDependency,
        TaskDependencyItem,
    },
    traits::{
        CheckoutResult, GraphFinishedCheck, GraphQuery, GraphTaskStateUpdate, GraphTransition,
        ReadyTasks, StoreBackend, TaskGraphStore, TaskQuery, TaskRef, TaskStateUpdate,
        TaskTransition,
    },
    TaskGraphError, TaskGraphResult,
};

use crate::retry_loop::{RetryLoop, RetryPolicy};

/// 任务图协调存储
///
/// 所有协调语义（租约、依赖传播、任务图生命周期）只在这里实现一次，
/// 具体存储引擎通过 [`StoreBackend`] 注入。
#[derive(Clone)]
pub struct CoordinationStore {
    pub(crate) backend: Arc<dyn StoreBackend>,
    pub(crate) retry: RetryLoop,
}

impl CoordinationStore {
    pub fn new(backend: Arc<dyn StoreBackend>, policy: RetryPolicy) -> Self {
        let retry = RetryLoop::new(Arc::clone(&backend), policy);
        Self { backend, retry }
    }

    pub fn from_config(backend: Arc<dyn StoreBackend>, config: &StoreConfig) -> Self {
        Self::new(backend, RetryPolicy::from(config))
    }

    pub fn backend(&self) -> Arc<dyn StoreBackend> {
        Arc::clone(&self.backend)
    }
}

#[async_trait]
impl TaskGraphStore for CoordinationStore {
    #[instrument(skip(self, definition), fields(name = %definition.injectable_name))]
    async fn persist_graph_definition(&self, definition: &GraphDefinition) -> TaskGraphResult<()> {
        if definition.injectable_name.trim().is_empty() {
            return Err(TaskGraphError::validation_error("任务图定义名称不能为空"));
        }
        self.backend.upsert_graph_definition(definition).await?;
        debug!("已保存任务图定义: {}", definition.injectable_name);
        Ok(())
    }

    async fn get_graph_definitions(
        &self,
        injectable_name: Option<&str>,
    ) -> TaskGraphResult<Vec<GraphDefinition>> {
        self.backend.query_graph_definitions(injectable_name).await
    }

    async fn get_graph_definition(&self, injectable_name: &str) -> TaskGraphResult<GraphDefinition> {
        self.backend
            .query_graph_definitions(Some(injectable_name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TaskGraphError::GraphDefinitionNotFound {
                name: injectable_name.to_string(),
            })
    }

    #[instrument(skip(self, graph), fields(graph_id = %graph.instance_id))]
    async fn persist_graph_object(&self, graph: &GraphObject) -> TaskGraphResult<()> {
        self.backend.insert_graph(graph).await
    }

    #[instrument(skip(self, item), fields(task_id = %item.task_id, graph_id = %graph_id))]
    async fn persist_task_dependencies(
        &self,
        item: &TaskDependencyItem,
        graph_id: Uuid,
    ) -> TaskGraphResult<TaskDependency> {
        if item.terminal_on_states.iter().any(|s| !s.is_finished()) {
            return Err(TaskGraphError::validation_error(format!(
                "任务 {} 的终止状态必须是终态",
                item.task_id
            )));
        }
        let record = TaskDependency::new(item, graph_id);
        self.backend.insert_task(&record).await?;
        Ok(record)
    }

    async fn get_task_by_id(&self, task: &TaskRef) -> TaskGraphResult<GraphTaskView> {
        let graph = self
            .backend
            .read_graph(task.graph_id)
            .await?
            .ok_or_else(|| TaskGraphError::graph_not_found(task.graph_id))?;
        Ok(GraphTaskView {
            graph_id: graph.instance_id,
            task: graph.tasks.get(&task.task_id).cloned(),
            context: graph.context,
        })
    }

    async fn get_graph_by_id(&self, graph_id: Uuid) -> TaskGraphResult<Option<GraphObject>> {
        self.backend.read_graph(graph_id).await
    }

    async fn get_graph_tasks(&self, graph_id: Uuid) -> TaskGraphResult<Vec<TaskDependency>> {
        self.backend
            .query_tasks(&TaskQuery::new().graph(graph_id))
            .await
    }

    async fn get_active_graph_by_id(&self, graph_id: Uuid) -> TaskGraphResult<Option<GraphObject>> {
        let graphs = self
            .backend
            .query_graphs(
                &GraphQuery::new()
                    .instance(graph_id)
                    .status(GraphStatus::Pending)
                    .limit(1),
            )
            .await?;
        Ok(graphs.into_iter().next())
    }

    async fn find_active_graphs(&self, domain: &str) -> TaskGraphResult<Vec<GraphObject>> {
        self.backend
            .query_graphs(&GraphQuery::new().domain(domain).status(GraphStatus::Pending))
            .await
    }

    async fn find_active_graph_for_target(
        &self,
        target: &str,
    ) -> TaskGraphResult<Option<GraphObject>> {
        let graphs = self
            .backend
            .query_graphs(
                &GraphQuery::new()
                    .context_target(target)
                    .status(GraphStatus::Pending)
                    .limit(1),
            )
            .await?;
        Ok(graphs.into_iter().next())
    }

    async fn get_service_graphs(&self) -> TaskGraphResult<Vec<GraphObject>> {
        self.backend
            .query_graphs(&GraphQuery::new().service_graph(true))
            .await
    }

    async fn find_ready_tasks(
        &self,
        domain: &str,
        graph_id: Option<Uuid>,
    ) -> TaskGraphResult<ReadyTasks> {
        self.ready_tasks(domain, graph_id).await
    }

    async fn checkout_task(
        &self,
        worker_id: &str,
        task: &TaskRef,
    ) -> TaskGraphResult<CheckoutResult> {
        self.checkout(worker_id, task).await
    }

    async fn get_own_tasks(&self, worker_id: &str) -> TaskGraphResult<Vec<TaskDependency>> {
        self.own_tasks(worker_id).await
    }

    async fn heartbeat_tasks_for_runner(&self, worker_id: &str) -> TaskGraphResult<usize> {
        self.heartbeat(worker_id).await
    }

    async fn find_expired_leases(
        &self,
        domain: &str,
        lease_timeout: Duration,
    ) -> TaskGraphResult<Vec<TaskDependency>> {
        self.expired_leases(domain, lease_timeout).await
    }

    async fn expire_lease(&self, task_id: Uuid, observed: &LeaseClaim) -> TaskGraphResult<bool> {
        self.release_expired(task_id, observed).await
    }

    async fn set_task_state(&self, update: &TaskStateUpdate) -> TaskGraphResult<TaskDependency> {
        self.record_task_state(update).await
    }

    async fn set_task_state_in_graph(
        &self,
        update: &GraphTaskStateUpdate,
    ) -> TaskGraphResult<GraphObject> {
        self.mirror_task_state(update).await
    }

    async fn update_dependent_tasks(&self, transition: &TaskTransition) -> TaskGraphResult<usize> {
        self.resolve_dependents(transition).await
    }

    async fn update_unreachable_tasks(
        &self,
        transition: &TaskTransition,
    ) -> TaskGraphResult<usize> {
        self.prune_unreachable(transition).await
    }

    async fn mark_task_evaluated(&self, task: &TaskRef) -> TaskGraphResult<TaskDependency> {
        self.mark_evaluated(task).await
    }

    async fn check_graph_finished(&self, graph_id: Uuid) -> TaskGraphResult<GraphFinishedCheck> {
        self.graph_finished(graph_id).await
    }

    async fn set_graph_done(
        &self,
        status: GraphStatus,
        graph_id: Uuid,
    ) -> TaskGraphResult<GraphTransition> {
        self.finish_graph(status, graph_id).await
    }

    async fn find_unevaluated_tasks(
        &self,
        domain: &str,
        limit: Option<i64>,
    ) -> TaskGraphResult<Vec<TaskDependency>> {
        self.unevaluated_tasks(domain, limit).await
    }

    async fn find_completed_tasks(&self, limit: Option<i64>) -> TaskGraphResult<Vec<TaskDependency>> {
        self.completed_tasks(limit).await
    }

    async fn delete_tasks(&self, task_ids: &[Uuid]) -> TaskGraphResult<u64> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        self.backend.delete_tasks(task_ids).await
    }

    async fn delete_graph(&self, graph_id: Uuid) -> TaskGraphResult<u64> {
        self.backend.delete_graph(graph_id).await
    }
}
