use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};
use uuid::Uuid;

use taskgraph_core::{
    config::CleanupConfig, models::TaskDependency, traits::TaskGraphStore, TaskGraphResult,
};

/// 已完成任务图清理配置
#[derive(Debug, Clone)]
pub struct GraphCleanerConfig {
    pub interval: Duration,
    /// 每轮读取的已完成任务数上限
    pub batch_size: i64,
}

impl Default for GraphCleanerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 500,
        }
    }
}

impl From<&CleanupConfig> for GraphCleanerConfig {
    fn from(config: &CleanupConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_seconds),
            batch_size: config.batch_size,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted_graphs: Vec<Uuid>,
    pub deleted_tasks: u64,
}

#[async_trait]
pub trait GraphCleanerService: Send + Sync {
    async fn start(&self) -> TaskGraphResult<()>;

    async fn stop(&self) -> TaskGraphResult<()>;

    /// 删除终态任务图及其全部任务记录
    async fn clean_completed_graphs(&self) -> TaskGraphResult<CleanupReport>;
}

pub struct CompletedGraphCleaner {
    store: Arc<dyn TaskGraphStore>,
    config: GraphCleanerConfig,
    running: Arc<tokio::sync::RwLock<bool>>,
}

impl CompletedGraphCleaner {
    pub fn new(store: Arc<dyn TaskGraphStore>, config: Option<GraphCleanerConfig>) -> Self {
        Self {
            store,
            config: config.unwrap_or_default(),
            running: Arc::new(tokio::sync::RwLock::new(false)),
        }
    }

    async fn cleanup_loop(&self) -> TaskGraphResult<()> {
        info!("启动已完成任务图清理循环");

        loop {
            if !*self.running.read().await {
                info!("收到停止信号，退出已完成任务图清理循环");
                break;
            }

            match self.clean_completed_graphs().await {
                Ok(report) if !report.deleted_graphs.is_empty() => info!(
                    "清理了 {} 个任务图，{} 条任务记录",
                    report.deleted_graphs.len(),
                    report.deleted_tasks
                ),
                Ok(_) => {}
                Err(e) => error!("清理已完成任务图时出错: {}", e),
            }

            tokio::time::sleep(self.config.interval).await;
        }

        Ok(())
    }

    /// 返回删除的任务记录数，任务图未结束时返回 `None`
    async fn clean_graph(
        &self,
        graph_id: Uuid,
        completed: &[TaskDependency],
    ) -> TaskGraphResult<Option<u64>> {
        let Some(graph) = self.store.get_graph_by_id(graph_id).await? else {
            // 任务图已删除，残留的任务记录直接清除
            let ids: Vec<Uuid> = completed.iter().map(|t| t.task_id).collect();
            return Ok(Some(self.store.delete_tasks(&ids).await?));
        };
        if !graph.status.is_finished() {
            return Ok(None);
        }

        let tasks = self.store.get_graph_tasks(graph_id).await?;
        if !tasks.iter().all(|t| !t.reachable || t.state.is_finished()) {
            debug!("任务图 {} 已结束但仍有未完成的任务，暂不清理", graph_id);
            return Ok(None);
        }

        let ids: Vec<Uuid> = tasks.iter().map(|t| t.task_id).collect();
        let deleted = self.store.delete_tasks(&ids).await?;
        self.store.delete_graph(graph_id).await?;
        Ok(Some(deleted))
    }
}

#[async_trait]
impl GraphCleanerService for CompletedGraphCleaner {
    async fn start(&self) -> TaskGraphResult<()> {
        info!("启动已完成任务图清理服务");
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        self.cleanup_loop().await
    }

    async fn stop(&self) -> TaskGraphResult<()> {
        info!("停止已完成任务图清理服务");
        let mut running = self.running.write().await;
        *running = false;
        Ok(())
    }

    async fn clean_completed_graphs(&self) -> TaskGraphResult<CleanupReport> {
        let completed = self
            .store
            .find_completed_tasks(Some(self.config.batch_size))
            .await?;

        let mut by_graph: BTreeMap<Uuid, Vec<TaskDependency>> = BTreeMap::new();
        for task in completed {
            by_graph.entry(task.graph_id).or_default().push(task);
        }

        let mut report = CleanupReport::default();
        for (graph_id, tasks) in by_graph {
            match self.clean_graph(graph_id, &tasks).await {
                Ok(Some(deleted)) => {
                    report.deleted_tasks += deleted;
                    report.deleted_graphs.push(graph_id);
                }
                Ok(None) => {}
                Err(e) => error!("清理任务图 {} 失败: {}", graph_id, e),
            }
        }
        Ok(report)
    }
}
