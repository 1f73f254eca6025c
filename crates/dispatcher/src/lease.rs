//! 租约：领取、心跳续约、过期回收

use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use taskgraph_core::{
    models::{LeaseClaim, TaskDependency, TaskState},
    traits::{CheckoutResult, LeaseUpdate, ReadyTasks, TaskMutation, TaskPrecondition, TaskQuery, TaskRef},
    TaskGraphError, TaskGraphResult,
};

use crate::store::CoordinationStore;

/// 心跳时并发续约的任务数
const HEARTBEAT_CONCURRENCY: usize = 8;

impl CoordinationStore {
    pub(crate) async fn ready_tasks(
        &self,
        domain: &str,
        graph_id: Option<Uuid>,
    ) -> TaskGraphResult<ReadyTasks> {
        let mut query = TaskQuery::new()
            .domain(domain)
            .state(TaskState::Pending)
            .reachable(true)
            .leased(false)
            .without_dependencies();
        if let Some(graph_id) = graph_id {
            query = query.graph(graph_id);
        }
        let tasks = self.backend.query_tasks(&query).await?;
        Ok(ReadyTasks { tasks, graph_id })
    }

    /// 只有一个参与者能把空租约改成自己的ID
    #[instrument(skip(self), fields(task_id = %task.task_id))]
    pub(crate) async fn checkout(
        &self,
        worker_id: &str,
        task: &TaskRef,
    ) -> TaskGraphResult<CheckoutResult> {
        if worker_id.is_empty() {
            return Err(TaskGraphError::validation_error("工作节点ID不能为空"));
        }

        let mutation = TaskMutation::new().lease(LeaseUpdate::Acquire {
            owner: worker_id.to_string(),
            heartbeat: Utc::now(),
        });
        let result = self
            .backend
            .try_update_task(task.task_id, &TaskPrecondition::Claimable, &mutation)
            .await?;

        if result.applied {
            let record = result
                .current
                .ok_or_else(|| TaskGraphError::task_not_found(task.task_id))?;
            metrics::counter!("taskgraph_lease_acquired_total").increment(1);
            debug!("工作节点 {} 领取了任务 {}", worker_id, task.task_id);
            return Ok(CheckoutResult::Acquired(record));
        }

        let current = result
            .current
            .ok_or_else(|| TaskGraphError::task_not_found(task.task_id))?;
        if current.is_leased_by(worker_id) {
            // 重复领取
            return Ok(CheckoutResult::Acquired(current));
        }
        if current.is_leased() {
            metrics::counter!("taskgraph_lease_contended_total").increment(1);
            return Ok(CheckoutResult::Contended {
                owner: current.lease_owner,
            });
        }
        Ok(CheckoutResult::Unavailable)
    }

    pub(crate) async fn own_tasks(&self, worker_id: &str) -> TaskGraphResult<Vec<TaskDependency>> {
        if worker_id.is_empty() {
            return Ok(Vec::new());
        }
        self.backend
            .query_tasks(
                &TaskQuery::new()
                    .lease_owner(worker_id)
                    .state(TaskState::Pending)
                    .reachable(true),
            )
            .await
    }

    /// 续约失败（租约已被回收或转移）的任务静默跳过
    #[instrument(skip(self))]
    pub(crate) async fn heartbeat(&self, worker_id: &str) -> TaskGraphResult<usize> {
        let tasks = self.own_tasks(worker_id).await?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let precondition = TaskPrecondition::LeaseOwner(worker_id.to_string());
        let mutation = TaskMutation::new().lease(LeaseUpdate::Renew { heartbeat: now });

        let renewed = stream::iter(tasks)
            .map(|task| {
                let precondition = &precondition;
                let mutation = &mutation;
                async move {
                    match self
                        .backend
                        .try_update_task(task.task_id, precondition, mutation)
                        .await
                    {
                        Ok(result) => result.applied,
                        Err(e) => {
                            warn!("任务 {} 续约失败: {}", task.task_id, e);
                            false
                        }
                    }
                }
            })
            .buffer_unordered(HEARTBEAT_CONCURRENCY)
            .filter(|applied| futures::future::ready(*applied))
            .count()
            .await;

        debug!("工作节点 {} 续约了 {} 个任务", worker_id, renewed);
        Ok(renewed)
    }

    pub(crate) async fn expired_leases(
        &self,
        domain: &str,
        lease_timeout: Duration,
    ) -> TaskGraphResult<Vec<TaskDependency>> {
        let cutoff = Utc::now() - lease_timeout;
        self.backend
            .query_tasks(
                &TaskQuery::new()
                    .domain(domain)
                    .state(TaskState::Pending)
                    .reachable(true)
                    .leased(true)
                    .heartbeat_before(cutoff),
            )
            .await
    }

    /// 持有者在观察之后续约过，则不回收
    #[instrument(skip(self, observed), fields(owner = %observed.owner))]
    pub(crate) async fn release_expired(
        &self,
        task_id: Uuid,
        observed: &LeaseClaim,
    ) -> TaskGraphResult<bool> {
        let result = self
            .backend
            .try_update_task(
                task_id,
                &TaskPrecondition::LeaseClaim(observed.clone()),
                &TaskMutation::new().lease(LeaseUpdate::Release),
            )
            .await?;
        if result.applied {
            metrics::counter!("taskgraph_lease_reclaimed_total").increment(1);
            info!("已回收工作节点 {} 持有的过期租约: 任务 {}", observed.owner, task_id);
        }
        Ok(result.applied)
    }
}
