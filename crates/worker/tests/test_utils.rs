#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use taskgraph_core::models::{
    GraphContext, GraphDefinition, GraphObject, RequiredState, TaskDefinitionEntry, TaskState,
};
use taskgraph_core::traits::{TaskGraphStore, TaskRef};
use taskgraph_dispatcher::{CoordinationStore, GraphFactory, RetryPolicy, TaskCompletionService};
use taskgraph_infrastructure::DatabaseManager;
use taskgraph_worker::{ExecutorRegistry, WorkerService, WorkerServiceConfig};

pub fn task(label: &str, task_name: &str, wait_on: &[&str], options: serde_json::Value) -> TaskDefinitionEntry {
    TaskDefinitionEntry {
        label: label.to_string(),
        task_name: task_name.to_string(),
        wait_on: wait_on
            .iter()
            .map(|l| (l.to_string(), RequiredState::Exactly(TaskState::Succeeded)))
            .collect(),
        terminal_on_states: None,
        options,
    }
}

pub fn definition(name: &str, tasks: Vec<TaskDefinitionEntry>) -> GraphDefinition {
    GraphDefinition {
        injectable_name: name.to_string(),
        friendly_name: name.to_string(),
        tasks,
        service_graph: false,
    }
}

pub fn worker_config(worker_id: &str) -> WorkerServiceConfig {
    WorkerServiceConfig {
        worker_id: worker_id.to_string(),
        poll_interval: Duration::from_millis(10),
        task_timeout: Duration::from_secs(5),
        claim_backoff: Duration::from_millis(1),
        heartbeat_interval: Duration::from_millis(50),
        ..WorkerServiceConfig::default()
    }
}

pub struct Submitted {
    pub graph: GraphObject,
    pub ids: HashMap<String, Uuid>,
}

impl Submitted {
    pub fn id(&self) -> Uuid {
        self.graph.instance_id
    }

    pub fn task(&self, label: &str) -> TaskRef {
        TaskRef::new(self.graph.instance_id, self.ids[label])
    }
}

pub struct Harness {
    pub store: Arc<dyn TaskGraphStore>,
    pub completion: Arc<TaskCompletionService>,
    pub factory: GraphFactory,
}

impl Harness {
    pub async fn new() -> Self {
        let manager = DatabaseManager::connect("sqlite::memory:").await.unwrap();
        manager.migrate().await.unwrap();
        let store: Arc<dyn TaskGraphStore> = Arc::new(CoordinationStore::new(
            manager.store_backend(),
            RetryPolicy::default(),
        ));
        Self {
            completion: Arc::new(TaskCompletionService::new(Arc::clone(&store))),
            factory: GraphFactory::new(Arc::clone(&store)),
            store,
        }
    }

    pub async fn submit(&self, definition: &GraphDefinition) -> Submitted {
        let graph = self
            .factory
            .submit(definition, GraphContext::new(), "default")
            .await
            .unwrap();
        let ids = graph
            .tasks
            .iter()
            .map(|(id, entry)| (entry.label.clone(), *id))
            .collect();
        Submitted { graph, ids }
    }

    pub fn worker(&self, config: WorkerServiceConfig, registry: ExecutorRegistry) -> WorkerService {
        WorkerService::builder(Arc::clone(&self.store), Arc::clone(&self.completion))
            .config(config)
            .registry(Arc::new(registry))
            .build()
    }

    pub async fn graph(&self, graph_id: Uuid) -> GraphObject {
        self.store.get_graph_by_id(graph_id).await.unwrap().unwrap()
    }

    /// 单线程地领取并执行，直到没有就绪任务
    pub async fn run_to_idle(&self, worker: &WorkerService) -> usize {
        let mut executed = 0;
        while let Some(record) = worker.claim_next().await.unwrap() {
            worker.execute(TaskRef::from(&record)).await.unwrap();
            executed += 1;
        }
        executed
    }
}
