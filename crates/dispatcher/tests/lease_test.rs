
use chrono::{Duration, Utc};
use futures::future::join_all;
use taskgraph_core::models::TaskState;
use taskgraph_core::traits::{
    CheckoutResult, LeaseUpdate, TaskGraphStore, TaskMutation, TaskPrecondition, TaskRef,
    TaskStateUpdate,
};
use taskgraph_core::TaskGraphError;
use taskgraph_dispatcher::{LeaseReaper, LeaseReaperConfig, LeaseReaperService};
use test_utils::{definition, entry, succeeded, Harness};
use uuid::Uuid;

/// 把租约心跳拨回到 `age` 之前
async fn age_lease(harness: &Harness, task: TaskRef, owner: &str, age: Duration) {
    let result = harness
        .backend
        .try_update_task(
            task.task_id,
            &TaskPrecondition::LeaseOwner(owner.to_string()),
            &TaskMutation::new().lease(LeaseUpdate::Renew {
                heartbeat: Utc::now() - age,
            }),
        )
        .await
        .unwrap();
    assert!(result.applied);
}

#[tokio::test]
async fn test_find_ready_tasks() {
    let harness = Harness::new().await;
    let first = harness
        .submit(&definition(
            "Graph.Ready",
            vec![entry("a", &[]), entry("b", &[]), entry("c", &[("a", succeeded())])],
        ))
        .await;
    let second = harness
        .submit(&definition("Graph.Other", vec![entry("x", &[])]))
        .await;
    harness
        .submit_with(
            &definition("Graph.Lab", vec![entry("y", &[])]),
            Default::default(),
            "lab",
        )
        .await;

    let ready = harness.store.find_ready_tasks("default", None).await.unwrap();
    assert_eq!(ready.graph_id, None);
    assert_eq!(ready.tasks.len(), 3);
    assert!(ready.tasks.iter().all(|t| t.is_ready()));
    assert!(!ready.tasks.iter().any(|t| t.task_id == first.ids["c"]));

    let scoped = harness
        .store
        .find_ready_tasks("default", Some(first.id()))
        .await
        .unwrap();
    assert_eq!(scoped.graph_id, Some(first.id()));
    assert_eq!(scoped.tasks.len(), 2);

    // 已租用的任务不再出现在候选集中
    harness
        .store
        .checkout_task("worker-1", &second.task("x"))
        .await
        .unwrap();
    let ready = harness.store.find_ready_tasks("default", None).await.unwrap();
    assert_eq!(ready.tasks.len(), 2);

    let lab = harness.store.find_ready_tasks("lab", None).await.unwrap();
    assert_eq!(lab.tasks.len(), 1);
}

#[tokio::test]
async fn test_checkout_is_exclusive_and_idempotent() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition("Graph.Checkout", vec![entry("a", &[])]))
        .await;
    let task = submitted.task("a");

    match harness.store.checkout_task("worker-1", &task).await.unwrap() {
        CheckoutResult::Acquired(record) => {
            assert_eq!(record.lease_owner, "worker-1");
        }
        other => panic!("首次领取应成功: {other:?}"),
    }

    match harness.store.checkout_task("worker-2", &task).await.unwrap() {
        CheckoutResult::Contended { owner } => assert_eq!(owner, "worker-1"),
        other => panic!("第二个工作节点应领取失败: {other:?}"),
    }

    // 同一工作节点重复领取视为成功
    assert!(harness
        .store
        .checkout_task("worker-1", &task)
        .await
        .unwrap()
        .is_acquired());
    assert_eq!(harness.task(task).await.lease_owner, "worker-1");
}

#[tokio::test]
async fn test_concurrent_checkout_single_winner() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition("Graph.Race", vec![entry("a", &[])]))
        .await;
    let task = submitted.task("a");

    let attempts = (0..6).map(|i| {
        let store = harness.store.clone();
        async move { store.checkout_task(&format!("worker-{i}"), &task).await }
    });
    let results: Vec<CheckoutResult> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let winners: Vec<_> = results
        .iter()
        .filter_map(|r| match r {
            CheckoutResult::Acquired(record) => Some(record.lease_owner.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let CheckoutResult::Contended { owner } = result {
            assert_eq!(owner, &winners[0]);
        }
    }
}

#[tokio::test]
async fn test_checkout_unavailable_and_missing() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition("Graph.Done", vec![entry("a", &[])]))
        .await;
    let task = submitted.task("a");

    harness
        .store
        .set_task_state(&TaskStateUpdate {
            task_id: task.task_id,
            graph_id: task.graph_id,
            state: TaskState::Cancelled,
            context: None,
        })
        .await
        .unwrap();
    assert_eq!(
        harness.store.checkout_task("worker-1", &task).await.unwrap(),
        CheckoutResult::Unavailable
    );

    let missing = TaskRef::new(submitted.id(), Uuid::new_v4());
    assert!(matches!(
        harness.store.checkout_task("worker-1", &missing).await,
        Err(TaskGraphError::TaskNotFound { .. })
    ));
    assert!(matches!(
        harness.store.checkout_task("", &task).await,
        Err(TaskGraphError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_heartbeat_renews_own_tasks_only() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition(
            "Graph.Heartbeat",
            vec![entry("a", &[]), entry("b", &[]), entry("c", &[])],
        ))
        .await;

    for label in ["a", "b"] {
        harness
            .store
            .checkout_task("worker-1", &submitted.task(label))
            .await
            .unwrap();
        age_lease(&harness, submitted.task(label), "worker-1", Duration::seconds(30)).await;
    }
    harness
        .store
        .checkout_task("worker-2", &submitted.task("c"))
        .await
        .unwrap();

    assert_eq!(harness.store.get_own_tasks("worker-1").await.unwrap().len(), 2);
    assert_eq!(harness.store.heartbeat_tasks_for_runner("worker-1").await.unwrap(), 2);
    assert_eq!(harness.store.heartbeat_tasks_for_runner("nobody").await.unwrap(), 0);

    let refreshed = harness.task(submitted.task("a")).await;
    assert!(refreshed.lease_heartbeat > Utc::now() - Duration::seconds(5));
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition("Graph.Expire", vec![entry("a", &[]), entry("b", &[])]))
        .await;
    let stale = submitted.task("a");
    let fresh = submitted.task("b");

    harness.store.checkout_task("worker-1", &stale).await.unwrap();
    harness.store.checkout_task("worker-1", &fresh).await.unwrap();
    age_lease(&harness, stale, "worker-1", Duration::seconds(120)).await;

    let expired = harness
        .store
        .find_expired_leases("default", Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].task_id, stale.task_id);

    let claim = expired[0].lease_claim().unwrap();
    assert!(harness.store.expire_lease(stale.task_id, &claim).await.unwrap());
    // 第二次回收同一个观察值不再生效
    assert!(!harness.store.expire_lease(stale.task_id, &claim).await.unwrap());

    let ready = harness.store.find_ready_tasks("default", None).await.unwrap();
    assert!(ready.tasks.iter().any(|t| t.task_id == stale.task_id));
    assert!(harness
        .store
        .checkout_task("worker-2", &stale)
        .await
        .unwrap()
        .is_acquired());

    // 失去租约后心跳不再续约该任务
    assert_eq!(harness.store.heartbeat_tasks_for_runner("worker-1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_renewed_lease_is_not_clobbered() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition("Graph.Renew", vec![entry("a", &[])]))
        .await;
    let task = submitted.task("a");

    harness.store.checkout_task("worker-1", &task).await.unwrap();
    age_lease(&harness, task, "worker-1", Duration::seconds(120)).await;
    let observed = harness
        .store
        .find_expired_leases("default", Duration::seconds(60))
        .await
        .unwrap()[0]
        .lease_claim()
        .unwrap();

    // 扫描之后持有者恢复了心跳
    harness.store.heartbeat_tasks_for_runner("worker-1").await.unwrap();
    assert!(!harness.store.expire_lease(task.task_id, &observed).await.unwrap());
    assert_eq!(harness.task(task).await.lease_owner, "worker-1");
}

#[tokio::test]
async fn test_lease_reaper_sweeps_domains() {
    let harness = Harness::new().await;
    let submitted = harness
        .submit(&definition("Graph.Reaper", vec![entry("a", &[]), entry("b", &[])]))
        .await;
    for label in ["a", "b"] {
        harness
            .store
            .checkout_task("worker-gone", &submitted.task(label))
            .await
            .unwrap();
    }
    age_lease(&harness, submitted.task("a"), "worker-gone", Duration::seconds(600)).await;

    let reaper = LeaseReaper::new(
        harness.dyn_store(),
        Some(LeaseReaperConfig {
            lease_timeout: Duration::seconds(60),
            reap_interval: std::time::Duration::from_millis(10),
            domains: vec!["default".to_string(), "lab".to_string()],
        }),
    );
    assert_eq!(reaper.reap_expired_leases().await.unwrap(), 1);
    assert_eq!(reaper.reap_expired_leases().await.unwrap(), 0);

    assert!(!harness.task(submitted.task("a")).await.is_leased());
    assert!(harness.task(submitted.task("b")).await.is_leased());
}

#[tokio::test]
async fn test_lease_reaper_start_stop() {
    let harness = Harness::new().await;
    let reaper = std::sync::Arc::new(LeaseReaper::new(
        harness.dyn_store(),
        Some(LeaseReaperConfig {
            reap_interval: std::time::Duration::from_millis(10),
            ..LeaseReaperConfig::default()
        }),
    ));

    let running = reaper.clone();
    let handle = tokio::spawn(async move { running.start().await });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    reaper.stop().await.unwrap();

    let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("回收循环应在停止后退出")
        .unwrap();
    assert!(result.is_ok());
}
