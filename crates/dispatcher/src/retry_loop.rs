//! 条件更新重试循环
//!
//! 读取行 → 根据当前值计算期望变更 → 以行版本为前置条件尝试更新；
//! 被拒绝时用返回的当前行重新计算，直到生效或不再需要变更。
//! 每一轮都从最新状态重新推导变更，因此可以无限重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use taskgraph_core::{
    config::StoreConfig,
    models::{GraphObject, TaskDependency},
    traits::{
        ConditionalUpdate, GraphMutation, GraphPrecondition, StoreBackend, TaskMutation,
        TaskPrecondition,
    },
    TaskGraphError, TaskGraphResult,
};

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 达到该次数时输出告警，之后每累计同样次数再告警一次
    pub warn_threshold: u32,
    /// `None` 表示不设上限
    pub max_attempts: Option<u32>,
    /// 超过告警阈值后每轮重试前的最大随机退避
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            warn_threshold: 20,
            max_attempts: None,
            backoff_max: Duration::from_millis(50),
        }
    }
}

impl From<&StoreConfig> for RetryPolicy {
    fn from(config: &StoreConfig) -> Self {
        Self {
            warn_threshold: config.retry_warn_threshold.max(1),
            max_attempts: config.max_attempts(),
            backoff_max: Duration::from_millis(config.retry_backoff_max_ms),
        }
    }
}

/// 可以用版本令牌做条件更新的记录
#[async_trait]
pub trait CasRecord: Clone + Send + Sync + Sized + 'static {
    type Mutation: Send + Sync;

    const ENTITY: &'static str;

    fn rowrev(&self) -> &str;

    fn not_found(id: Uuid) -> TaskGraphError;

    async fn load(backend: &dyn StoreBackend, id: Uuid) -> TaskGraphResult<Option<Self>>;

    async fn try_apply(
        backend: &dyn StoreBackend,
        id: Uuid,
        rowrev: &str,
        mutation: &Self::Mutation,
    ) -> TaskGraphResult<ConditionalUpdate<Self>>;
}

#[async_trait]
impl CasRecord for TaskDependency {
    type Mutation = TaskMutation;

    const ENTITY: &'static str = "task";

    fn rowrev(&self) -> &str {
        &self.rowrev
    }

    fn not_found(id: Uuid) -> TaskGraphError {
        TaskGraphError::task_not_found(id)
    }

    async fn load(backend: &dyn StoreBackend, id: Uuid) -> TaskGraphResult<Option<Self>> {
        backend.read_task(id).await
    }

    async fn try_apply(
        backend: &dyn StoreBackend,
        id: Uuid,
        rowrev: &str,
        mutation: &TaskMutation,
    ) -> TaskGraphResult<ConditionalUpdate<Self>> {
        backend
            .try_update_task(id, &TaskPrecondition::Revision(rowrev.to_string()), mutation)
            .await
    }
}

#[async_trait]
impl CasRecord for GraphObject {
    type Mutation = GraphMutation;

    const ENTITY: &'static str = "graph";

    fn rowrev(&self) -> &str {
        &self.rowrev
    }

    fn not_found(id: Uuid) -> TaskGraphError {
        TaskGraphError::graph_not_found(id)
    }

    async fn load(backend: &dyn StoreBackend, id: Uuid) -> TaskGraphResult<Option<Self>> {
        backend.read_graph(id).await
    }

    async fn try_apply(
        backend: &dyn StoreBackend,
        id: Uuid,
        rowrev: &str,
        mutation: &GraphMutation,
    ) -> TaskGraphResult<ConditionalUpdate<Self>> {
        backend
            .try_update_graph(id, &GraphPrecondition::Revision(rowrev.to_string()), mutation)
            .await
    }
}

/// 重试循环的结果
#[derive(Debug, Clone)]
pub struct UpdateOutcome<R> {
    /// 变更后的行，或者无需变更时的当前行
    pub record: R,
    pub applied: bool,
    /// 发出的条件更新次数
    pub attempts: u32,
}

#[derive(Clone)]
pub struct RetryLoop {
    backend: Arc<dyn StoreBackend>,
    policy: RetryPolicy,
}

impl RetryLoop {
    pub fn new(backend: Arc<dyn StoreBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `desired` 返回 `Ok(None)` 表示当前行已满足目标；返回错误时循环立即结束
    pub async fn update_until_applied<R, F>(
        &self,
        id: Uuid,
        mut desired: F,
    ) -> TaskGraphResult<UpdateOutcome<R>>
    where
        R: CasRecord,
        F: FnMut(&R) -> TaskGraphResult<Option<R::Mutation>> + Send,
    {
        let backend = self.backend.as_ref();
        let mut current = R::load(backend, id).await?.ok_or_else(|| R::not_found(id))?;
        let mut attempts: u32 = 0;

        loop {
            let Some(mutation) = desired(&current)? else {
                return Ok(UpdateOutcome {
                    record: current,
                    applied: false,
                    attempts,
                });
            };

            attempts += 1;
            let result = R::try_apply(backend, id, current.rowrev(), &mutation).await?;
            if result.applied {
                let record = match result.current {
                    Some(record) => record,
                    None => return Err(R::not_found(id)),
                };
                if attempts > 1 {
                    debug!("{} {} 在第 {} 次尝试时更新成功", R::ENTITY, id, attempts);
                }
                return Ok(UpdateOutcome {
                    record,
                    applied: true,
                    attempts,
                });
            }

            metrics::counter!("taskgraph_cas_conflicts_total", "entity" => R::ENTITY).increment(1);

            if attempts % self.policy.warn_threshold.max(1) == 0 {
                warn!(
                    "{} {} 条件更新已被拒绝 {} 次，可能存在严重竞争",
                    R::ENTITY,
                    id,
                    attempts
                );
            }

            if let Some(max) = self.policy.max_attempts {
                if attempts >= max {
                    return Err(TaskGraphError::ConcurrencyConflict {
                        entity: format!("{} {}", R::ENTITY, id),
                        attempts,
                    });
                }
            }

            current = result.current.ok_or_else(|| R::not_found(id))?;

            if attempts >= self.policy.warn_threshold && !self.policy.backoff_max.is_zero() {
                let max_ms = self.policy.backoff_max.as_millis() as u64;
                let delay = rand::rng().random_range(0..=max_ms);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}
