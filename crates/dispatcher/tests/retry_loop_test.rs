
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use taskgraph_core::models::{GraphObject, TaskDependency, TaskState};
use taskgraph_core::traits::{GraphTaskStateUpdate, TaskGraphStore, TaskMutation};
use taskgraph_core::TaskGraphError;
use taskgraph_dispatcher::{RetryLoop, RetryPolicy};
use test_utils::{definition, entry, sqlite_backend, ContendedBackend, Harness};
use uuid::Uuid;

fn policy(max_attempts: Option<u32>) -> RetryPolicy {
    RetryPolicy {
        warn_threshold: 2,
        max_attempts,
        backoff_max: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn test_retry_until_applied_after_conflicts() {
    let contended = Arc::new(ContendedBackend::new(sqlite_backend().await));
    let harness = Harness::with_backend(contended.clone(), policy(None));
    let submitted = harness.submit(&definition("Graph.Retry", vec![entry("a", &[])])).await;
    let task = submitted.task("a");

    contended.inject_task_conflicts(3);
    let retry = RetryLoop::new(contended.clone(), policy(None));
    let outcome = retry
        .update_until_applied(task.task_id, |record: &TaskDependency| {
            Ok((!record.evaluated && record.state == TaskState::Pending)
                .then(|| TaskMutation::new().state(TaskState::Succeeded)))
        })
        .await
        .unwrap();

    assert!(outcome.applied);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(outcome.record.state, TaskState::Succeeded);
}

#[tokio::test]
async fn test_zero_warn_threshold_still_retries() {
    let contended = Arc::new(ContendedBackend::new(sqlite_backend().await));
    let harness = Harness::with_backend(contended.clone(), RetryPolicy::default());
    let submitted = harness.submit(&definition("Graph.Warn", vec![entry("a", &[])])).await;

    contended.inject_task_conflicts(2);
    let zero = RetryPolicy {
        warn_threshold: 0,
        max_attempts: None,
        backoff_max: Duration::ZERO,
    };
    let outcome = RetryLoop::new(contended.clone(), zero)
        .update_until_applied(submitted.task("a").task_id, |_: &TaskDependency| {
            Ok(Some(TaskMutation::new().evaluated()))
        })
        .await
        .unwrap();

    assert!(outcome.applied);
    assert_eq!(outcome.attempts, 3);
    assert!(outcome.record.evaluated);
}

#[tokio::test]
async fn test_retry_cap_surfaces_conflict() {
    let contended = Arc::new(ContendedBackend::new(sqlite_backend().await));
    let harness = Harness::with_backend(contended.clone(), policy(Some(2)));
    let submitted = harness.submit(&definition("Graph.Cap", vec![entry("a", &[])])).await;

    contended.inject_task_conflicts(5);
    let retry = RetryLoop::new(contended.clone(), policy(Some(2)));
    let result = retry
        .update_until_applied(submitted.task("a").task_id, |_: &TaskDependency| {
            Ok(Some(TaskMutation::new().evaluated()))
        })
        .await;

    match result {
        Err(TaskGraphError::ConcurrencyConflict { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("应返回冲突错误: {other:?}"),
    }
    let record = harness.task(submitted.task("a")).await;
    assert!(!record.evaluated);
}

#[tokio::test]
async fn test_no_mutation_needed_skips_update() {
    let contended = Arc::new(ContendedBackend::new(sqlite_backend().await));
    let harness = Harness::with_backend(contended.clone(), RetryPolicy::default());
    let submitted = harness.submit(&definition("Graph.Noop", vec![entry("a", &[])])).await;
    let before = contended.task_updates.load(Ordering::SeqCst);

    let outcome = harness.task(submitted.task("a")).await;
    let retry = RetryLoop::new(contended.clone(), RetryPolicy::default());
    let result = retry
        .update_until_applied(outcome.task_id, |_: &TaskDependency| Ok(None))
        .await
        .unwrap();

    assert!(!result.applied);
    assert_eq!(result.attempts, 0);
    assert_eq!(result.record.rowrev, outcome.rowrev);
    assert_eq!(contended.task_updates.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn test_missing_row_is_not_found() {
    let retry = RetryLoop::new(sqlite_backend().await, RetryPolicy::default());
    let missing = Uuid::new_v4();

    let task = retry
        .update_until_applied(missing, |_: &TaskDependency| Ok(Some(TaskMutation::new())))
        .await;
    assert!(matches!(task, Err(TaskGraphError::TaskNotFound { id }) if id == missing));

    let graph = retry
        .update_until_applied(missing, |_: &GraphObject| Ok(None))
        .await;
    assert!(matches!(graph, Err(TaskGraphError::GraphNotFound { id }) if id == missing));
}

#[tokio::test]
async fn test_graph_mirror_survives_conflicts() {
    let contended = Arc::new(ContendedBackend::new(sqlite_backend().await));
    let harness = Harness::with_backend(contended.clone(), policy(None));
    let submitted = harness
        .submit(&definition("Graph.Mirror", vec![entry("a", &[]), entry("b", &[])]))
        .await;

    contended.inject_graph_conflicts(4);
    let mut context = taskgraph_core::models::GraphContext::new();
    context.insert("a".to_string(), serde_json::json!(1));
    let graph = harness
        .store
        .set_task_state_in_graph(&GraphTaskStateUpdate {
            task_id: submitted.ids["a"],
            graph_id: submitted.id(),
            state: TaskState::Succeeded,
            error: None,
            context,
        })
        .await
        .unwrap();

    assert_eq!(graph.tasks[&submitted.ids["a"]].state, TaskState::Succeeded);
    assert_eq!(graph.context["a"], serde_json::json!(1));
    assert_eq!(graph.tasks[&submitted.ids["b"]].state, TaskState::Pending);
}

#[tokio::test]
async fn test_concurrent_mirror_updates_do_not_clobber() {
    let harness = Harness::new().await;
    let labels: Vec<String> = (0..8).map(|i| format!("t{i}")).collect();
    let tasks = labels.iter().map(|l| entry(l, &[])).collect();
    let submitted = harness.submit(&definition("Graph.Siblings", tasks)).await;

    let updates = labels.iter().map(|label| {
        let store = harness.store.clone();
        let mut context = taskgraph_core::models::GraphContext::new();
        context.insert(label.clone(), serde_json::json!(true));
        let update = GraphTaskStateUpdate {
            task_id: submitted.ids[label.as_str()],
            graph_id: submitted.id(),
            state: TaskState::Succeeded,
            error: None,
            context,
        };
        async move { store.set_task_state_in_graph(&update).await }
    });
    for result in join_all(updates).await {
        result.unwrap();
    }

    let graph = harness.graph(submitted.id()).await;
    for label in &labels {
        assert_eq!(graph.tasks[&submitted.ids[label.as_str()]].state, TaskState::Succeeded);
        assert_eq!(graph.context[label.as_str()], serde_json::json!(true));
    }
}
