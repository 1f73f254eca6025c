//! 任务完成后的状态记录与依赖传播
//!
//! 每个操作都基于条件更新重试循环，重复调用或与其他参与者并发执行时结果一致。

use std::collections::{HashSet, VecDeque};

use futures::stream::{self, StreamExt};
use tracing::{debug, instrument};
use uuid::Uuid;

use taskgraph_core::{
    models::{GraphObject, GraphTaskEntry, TaskDependency, TaskState},
    traits::{
        GraphMutation, GraphTaskStateUpdate, LeaseUpdate, TaskMutation, TaskQuery, TaskRef,
        TaskStateUpdate, TaskTransition,
    },
    TaskGraphError, TaskGraphResult,
};

use crate::store::CoordinationStore;

/// 传播时并发处理的下游任务数
const PROPAGATION_CONCURRENCY: usize = 8;

fn ensure_finished(task_id: Uuid, state: TaskState) -> TaskGraphResult<()> {
    if state.is_finished() {
        Ok(())
    } else {
        Err(TaskGraphError::validation_error(format!(
            "任务 {} 的目标状态必须是终态，实际为 {}",
            task_id, state
        )))
    }
}

fn ensure_same_graph(record: &TaskDependency, graph_id: Uuid) -> TaskGraphResult<()> {
    if record.graph_id == graph_id {
        Ok(())
    } else {
        Err(TaskGraphError::task_not_found(record.task_id))
    }
}

impl CoordinationStore {
    /// pending → 终态，同时释放租约；重复设置同一终态不做任何修改
    #[instrument(skip(self, update), fields(task_id = %update.task_id, state = %update.state))]
    pub(crate) async fn record_task_state(
        &self,
        update: &TaskStateUpdate,
    ) -> TaskGraphResult<TaskDependency> {
        ensure_finished(update.task_id, update.state)?;

        let context = match update.state {
            TaskState::Succeeded => update.context.clone(),
            _ => None,
        };

        let outcome = self
            .retry
            .update_until_applied(update.task_id, |record: &TaskDependency| {
                ensure_same_graph(record, update.graph_id)?;
                if record.state == update.state {
                    return Ok(None);
                }
                if record.state.is_finished() {
                    return Err(TaskGraphError::InvalidStateTransition {
                        task_id: record.task_id,
                        from: record.state,
                        to: update.state,
                    });
                }
                Ok(Some(
                    TaskMutation::new()
                        .state(update.state)
                        .context(context.clone())
                        .lease(LeaseUpdate::Release),
                ))
            })
            .await?;

        if outcome.applied {
            debug!("任务 {} 已进入 {} 状态", update.task_id, update.state);
        }
        Ok(outcome.record)
    }

    /// 把任务状态写入任务图镜像，并合并共享上下文
    #[instrument(skip(self, update), fields(graph_id = %update.graph_id, task_id = %update.task_id))]
    pub(crate) async fn mirror_task_state(
        &self,
        update: &GraphTaskStateUpdate,
    ) -> TaskGraphResult<GraphObject> {
        let outcome = self
            .retry
            .update_until_applied(update.graph_id, |graph: &GraphObject| {
                let mut entry = graph
                    .tasks
                    .get(&update.task_id)
                    .cloned()
                    .unwrap_or_else(|| GraphTaskEntry {
                        label: update.task_id.to_string(),
                        task_name: String::new(),
                        options: serde_json::Value::Null,
                        state: TaskState::Pending,
                        error: None,
                    });

                let error = match &update.error {
                    Some(error) => Some(error.clone()),
                    None if entry.state == update.state => entry.error.clone(),
                    None => None,
                };
                let entry_changed = !graph.tasks.contains_key(&update.task_id)
                    || entry.state != update.state
                    || entry.error != error;

                let context_changed = update
                    .context
                    .iter()
                    .any(|(key, value)| graph.context.get(key) != Some(value));

                if !entry_changed && !context_changed {
                    return Ok(None);
                }

                let mut mutation = GraphMutation::new();
                if entry_changed {
                    entry.state = update.state;
                    entry.error = error;
                    let mut tasks = graph.tasks.clone();
                    tasks.insert(update.task_id, entry);
                    mutation = mutation.tasks(tasks);
                }
                if context_changed {
                    let mut context = graph.context.clone();
                    for (key, value) in &update.context {
                        context.insert(key.clone(), value.clone());
                    }
                    mutation = mutation.context(context);
                }
                Ok(Some(mutation))
            })
            .await?;
        Ok(outcome.record)
    }

    /// 移除下游任务中已被满足的依赖条目，返回本次调用实际修改的任务数
    #[instrument(skip(self, transition), fields(task_id = %transition.task_id, state = %transition.state))]
    pub(crate) async fn resolve_dependents(
        &self,
        transition: &TaskTransition,
    ) -> TaskGraphResult<usize> {
        ensure_finished(transition.task_id, transition.state)?;

        let dependents = self
            .backend
            .query_tasks(
                &TaskQuery::new()
                    .graph(transition.graph_id)
                    .reachable(true)
                    .depends_on(transition.task_id),
            )
            .await?;

        let results: Vec<TaskGraphResult<bool>> = stream::iter(dependents)
            .filter(|dependent| {
                let satisfied = dependent
                    .depends_on(&transition.task_id)
                    .is_some_and(|required| required.is_satisfied_by(transition.state));
                futures::future::ready(satisfied)
            })
            .map(|dependent| async move {
                let outcome = self
                    .retry
                    .update_until_applied(dependent.task_id, |record: &TaskDependency| {
                        match record.depends_on(&transition.task_id) {
                            Some(required)
                                if record.reachable && required.is_satisfied_by(transition.state) =>
                            {
                                let mut dependencies = record.dependencies.clone();
                                dependencies.remove(&transition.task_id);
                                Ok(Some(TaskMutation::new().dependencies(dependencies)))
                            }
                            _ => Ok(None),
                        }
                    })
                    .await?;
                Ok(outcome.applied)
            })
            .buffer_unordered(PROPAGATION_CONCURRENCY)
            .collect()
            .await;

        let mut resolved = 0;
        for result in results {
            if result? {
                resolved += 1;
            }
        }
        if resolved > 0 {
            metrics::counter!("taskgraph_dependencies_resolved_total").increment(resolved as u64);
            debug!("任务 {} 结束，{} 个下游任务的依赖已满足", transition.task_id, resolved);
        }
        Ok(resolved)
    }

    /// 标记永远无法满足依赖的下游任务为不可达，并沿依赖链传递
    ///
    /// 已经不可达的任务（可能由其他参与者标记）也会继续向下游展开，
    /// 因此中途失败后重新调用可以补齐传播。
    #[instrument(skip(self, transition), fields(task_id = %transition.task_id, state = %transition.state))]
    pub(crate) async fn prune_unreachable(
        &self,
        transition: &TaskTransition,
    ) -> TaskGraphResult<usize> {
        ensure_finished(transition.task_id, transition.state)?;

        let mut marked = 0;
        let mut visited = HashSet::new();
        let mut frontier = VecDeque::new();
        // None 表示上游任务不可达，任何依赖条件都无法满足
        frontier.push_back((transition.task_id, Some(transition.state)));

        while let Some((source, state)) = frontier.pop_front() {
            let dependents = self
                .backend
                .query_tasks(
                    &TaskQuery::new()
                        .graph(transition.graph_id)
                        .depends_on(source),
                )
                .await?;

            for dependent in dependents {
                let doomed = match (dependent.depends_on(&source), state) {
                    (Some(required), Some(state)) => required.is_unsatisfiable_after(state),
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if !doomed || !visited.insert(dependent.task_id) {
                    continue;
                }

                let outcome = self
                    .retry
                    .update_until_applied(dependent.task_id, |record: &TaskDependency| {
                        if !record.reachable
                            || record.state.is_finished()
                            || record.depends_on(&source).is_none()
                        {
                            return Ok(None);
                        }
                        Ok(Some(TaskMutation::new().unreachable()))
                    })
                    .await?;

                if outcome.applied {
                    marked += 1;
                }
                if !outcome.record.reachable {
                    frontier.push_back((dependent.task_id, None));
                }
            }
        }

        if marked > 0 {
            metrics::counter!("taskgraph_tasks_unreachable_total").increment(marked as u64);
            debug!("任务 {} 结束，{} 个下游任务被标记为不可达", transition.task_id, marked);
        }
        Ok(marked)
    }

    /// 完成后的传播已全部结束
    pub(crate) async fn mark_evaluated(&self, task: &TaskRef) -> TaskGraphResult<TaskDependency> {
        let outcome = self
            .retry
            .update_until_applied(task.task_id, |record: &TaskDependency| {
                ensure_same_graph(record, task.graph_id)?;
                if !record.state.is_finished() {
                    return Err(TaskGraphError::validation_error(format!(
                        "任务 {} 尚未结束，不能标记为已评估",
                        record.task_id
                    )));
                }
                if record.evaluated {
                    return Ok(None);
                }
                Ok(Some(TaskMutation::new().evaluated()))
            })
            .await?;
        Ok(outcome.record)
    }
}
