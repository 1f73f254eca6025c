
use serde_json::json;
use taskgraph_core::models::{RequiredState, TaskState};
use taskgraph_core::traits::{
    GraphTransition, TaskGraphStore, TaskRef, TaskStateUpdate, TaskTransition,
};
use taskgraph_core::TaskGraphError;
use taskgraph_dispatcher::TaskReport;
use test_utils::{definition, entry, failed, succeeded, tolerant_entry, Harness};

#[tokio::test]
async fn test_success_resolves_and_prunes_dependents() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition(
            "Graph.Branch",
            vec![
                entry("a", &[]),
                entry("b", &[("a", succeeded())]),
                entry("c", &[("a", failed())]),
            ],
        ))
        .await;

    let outcome = harness
        .run("worker-1", submitted.task("a"), TaskState::Succeeded)
        .await;
    assert_eq!(outcome.resolved_dependents, 1);
    assert_eq!(outcome.unreachable_dependents, 1);
    assert!(outcome.task.evaluated);
    assert!(!outcome.task.is_leased());
    assert!(outcome.graph.is_none());

    let b = harness.task(submitted.task("b")).await;
    assert!(b.dependencies.is_empty());
    assert!(b.is_ready());

    let c = harness.task(submitted.task("c")).await;
    assert!(!c.reachable);
    assert_eq!(c.state, TaskState::Pending);

    let graph = harness.graph(submitted.id()).await;
    assert_eq!(graph.tasks[&submitted.ids["a"]].state, TaskState::Succeeded);
    assert_eq!(graph.tasks[&submitted.ids["c"]].state, TaskState::Pending);
}

#[tokio::test]
async fn test_unreachability_is_transitive() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition(
            "Graph.Chain",
            vec![
                entry("a", &[]),
                entry("on_fail", &[("a", failed())]),
                entry("after", &[("on_fail", RequiredState::Finished)]),
                entry("last", &[("after", succeeded())]),
                entry("ok", &[("a", succeeded())]),
            ],
        ))
        .await;

    let outcome = harness
        .run("worker-1", submitted.task("a"), TaskState::Succeeded)
        .await;
    assert_eq!(outcome.unreachable_dependents, 3);

    for label in ["on_fail", "after", "last"] {
        assert!(!harness.task(submitted.task(label)).await.reachable, "{label}");
    }
    assert!(harness.task(submitted.task("ok")).await.is_ready());

    // 重复传播不会再修改任何记录
    let transition = TaskTransition {
        graph_id: submitted.id(),
        task_id: submitted.ids["a"],
        state: TaskState::Succeeded,
    };
    assert_eq!(harness.store.update_unreachable_tasks(&transition).await.unwrap(), 0);
    assert_eq!(harness.store.update_dependent_tasks(&transition).await.unwrap(), 0);
}

#[tokio::test]
async fn test_finished_requirement_accepts_any_terminal_state() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition(
            "Graph.Finally",
            vec![
                tolerant_entry("a", &[]),
                entry("cleanup", &[("a", RequiredState::Finished)]),
                entry("next", &[("a", succeeded())]),
            ],
        ))
        .await;

    let outcome = harness
        .run("worker-1", submitted.task("a"), TaskState::Failed)
        .await;
    assert_eq!(outcome.resolved_dependents, 1);
    assert_eq!(outcome.unreachable_dependents, 1);
    // 容忍失败的任务不会结束任务图
    assert!(outcome.graph.is_none());

    assert!(harness.task(submitted.task("cleanup")).await.is_ready());
    assert!(!harness.task(submitted.task("next")).await.reachable);

    let graph = harness.graph(submitted.id()).await;
    let mirrored = &graph.tasks[&submitted.ids["a"]];
    assert_eq!(mirrored.state, TaskState::Failed);
    assert_eq!(mirrored.error.as_deref(), Some("执行失败"));
}

#[tokio::test]
async fn test_completion_is_idempotent() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition(
            "Graph.Twice",
            vec![entry("a", &[]), entry("b", &[("a", succeeded())])],
        ))
        .await;
    let task = submitted.task("a");

    harness.store.checkout_task("worker-1", &task).await.unwrap();
    let report = TaskReport::succeeded(task, Some(json!({ "macAddress": "aa:bb" })));
    let first = harness.completion.complete(&report).await.unwrap();
    let snapshot_a = harness.task(task).await;
    let snapshot_b = harness.task(submitted.task("b")).await;
    let snapshot_graph = harness.graph(submitted.id()).await;

    let second = harness.completion.complete(&report).await.unwrap();
    assert_eq!(first.task.state, second.task.state);
    assert_eq!(second.resolved_dependents, 0);
    assert_eq!(second.unreachable_dependents, 0);

    // 第二次调用不产生任何写入
    assert_eq!(harness.task(task).await, snapshot_a);
    assert_eq!(harness.task(submitted.task("b")).await, snapshot_b);
    assert_eq!(harness.graph(submitted.id()).await, snapshot_graph);
    assert_eq!(snapshot_graph.context["macAddress"], json!("aa:bb"));
}

#[tokio::test]
async fn test_conflicting_terminal_state_rejected() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition("Graph.Conflict", vec![tolerant_entry("a", &[])]))
        .await;
    let task = submitted.task("a");
    harness.run("worker-1", task, TaskState::Succeeded).await;

    let result = harness
        .store
        .set_task_state(&TaskStateUpdate {
            task_id: task.task_id,
            graph_id: task.graph_id,
            state: TaskState::Failed,
            context: None,
        })
        .await;
    assert!(matches!(
        result,
        Err(TaskGraphError::InvalidStateTransition {
            from: TaskState::Succeeded,
            to: TaskState::Failed,
            ..
        })
    ));

    let pending = harness
        .store
        .set_task_state(&TaskStateUpdate {
            task_id: task.task_id,
            graph_id: task.graph_id,
            state: TaskState::Pending,
            context: None,
        })
        .await;
    assert!(matches!(pending, Err(TaskGraphError::ValidationError(_))));
}

#[tokio::test]
async fn test_context_kept_only_on_success() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition(
            "Graph.Context",
            vec![tolerant_entry("ok", &[]), tolerant_entry("bad", &[])],
        ))
        .await;

    harness
        .store
        .checkout_task("worker-1", &submitted.task("ok"))
        .await
        .unwrap();
    harness
        .completion
        .complete(&TaskReport::succeeded(
            submitted.task("ok"),
            Some(json!({ "ip": "10.1.1.1" })),
        ))
        .await
        .unwrap();

    harness
        .store
        .checkout_task("worker-1", &submitted.task("bad"))
        .await
        .unwrap();
    let mut report = TaskReport::failed(submitted.task("bad"), TaskState::Failed, "磁盘错误");
    report.context = Some(json!({ "leaked": true }));
    harness.completion.complete(&report).await.unwrap();

    assert_eq!(
        harness.task(submitted.task("ok")).await.context,
        Some(json!({ "ip": "10.1.1.1" }))
    );
    assert_eq!(harness.task(submitted.task("bad")).await.context, None);

    let graph = harness.graph(submitted.id()).await;
    assert_eq!(graph.context["ip"], json!("10.1.1.1"));
    assert!(!graph.context.contains_key("leaked"));
}

#[tokio::test]
async fn test_mark_evaluated_requires_finished_task() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition("Graph.Eval", vec![entry("a", &[])]))
        .await;

    let result = harness.store.mark_task_evaluated(&submitted.task("a")).await;
    assert!(matches!(result, Err(TaskGraphError::ValidationError(_))));

    let wrong_graph = TaskRef::new(uuid::Uuid::new_v4(), submitted.ids["a"]);
    assert!(matches!(
        harness.store.mark_task_evaluated(&wrong_graph).await,
        Err(TaskGraphError::TaskNotFound { .. })
    ));
}

#[tokio::test]
async fn test_task_view_reads_mirror() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition("Graph.View", vec![entry("a", &[])]))
        .await;

    let view = harness.store.get_task_by_id(&submitted.task("a")).await.unwrap();
    assert_eq!(view.graph_id, submitted.id());
    let task = view.task.unwrap();
    assert_eq!(task.label, "a");
    assert_eq!(task.task_name, "noop");
    assert_eq!(task.options["label"], json!("a"));

    let outcome = harness
        .run("worker-1", submitted.task("a"), TaskState::Succeeded)
        .await;
    assert!(matches!(outcome.graph, Some(GraphTransition::Applied(_))));
    let view = harness.store.get_task_by_id(&submitted.task("a")).await.unwrap();
    assert_eq!(view.task.unwrap().state, TaskState::Succeeded);

    let missing = TaskRef::new(uuid::Uuid::new_v4(), submitted.ids["a"]);
    assert!(matches!(
        harness.store.get_task_by_id(&missing).await,
        Err(TaskGraphError::GraphNotFound { .. })
    ));
}
