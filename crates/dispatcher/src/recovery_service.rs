use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};
use uuid::Uuid;

use taskgraph_core::{
    config::{RecoveryConfig, StoreConfig},
    models::DEFAULT_DOMAIN,
    traits::{GraphTransition, TaskGraphStore},
    TaskGraphResult,
};

use crate::completion::TaskCompletionService;

/// 恢复服务配置
#[derive(Debug, Clone)]
pub struct RecoveryServiceConfig {
    /// 扫描间隔
    pub interval: Duration,
    /// 每个任务域每轮最多处理的任务数
    pub batch_size: i64,
    pub domains: Vec<String>,
}

impl Default for RecoveryServiceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
            domains: vec![DEFAULT_DOMAIN.to_string()],
        }
    }
}

impl RecoveryServiceConfig {
    pub fn from_config(recovery: &RecoveryConfig, store: &StoreConfig) -> Self {
        Self {
            interval: Duration::from_secs(recovery.interval_seconds),
            batch_size: recovery.batch_size,
            domains: store.domains.clone(),
        }
    }
}

/// 恢复报告
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// 重新执行了完成流水线的任务
    pub recovered_tasks: Vec<Uuid>,
    /// 本轮迁移到终态的任务图
    pub finalized_graphs: Vec<Uuid>,
    pub recovery_duration_ms: u64,
    pub errors: Vec<String>,
}

/// 恢复服务接口
#[async_trait]
pub trait RecoveryService: Send + Sync {
    /// 执行一轮完整恢复
    async fn recover_system_state(&self) -> TaskGraphResult<RecoveryReport>;

    /// 对已结束但未评估的任务重跑完成流水线
    async fn recover_unevaluated_tasks(&self) -> TaskGraphResult<Vec<Uuid>>;

    /// 结束所有任务都已完成、但状态仍为 pending 的任务图
    async fn finalize_finished_graphs(&self) -> TaskGraphResult<Vec<Uuid>>;

    async fn start(&self) -> TaskGraphResult<()>;

    async fn stop(&self) -> TaskGraphResult<()>;
}

pub struct SystemRecoveryService {
    store: Arc<dyn TaskGraphStore>,
    completion: Arc<TaskCompletionService>,
    config: RecoveryServiceConfig,
    running: Arc<tokio::sync::RwLock<bool>>,
}

impl SystemRecoveryService {
    pub fn new(
        store: Arc<dyn TaskGraphStore>,
        completion: Arc<TaskCompletionService>,
        config: Option<RecoveryServiceConfig>,
    ) -> Self {
        Self {
            store,
            completion,
            config: config.unwrap_or_default(),
            running: Arc::new(tokio::sync::RwLock::new(false)),
        }
    }

    async fn recovery_loop(&self) -> TaskGraphResult<()> {
        info!("启动恢复扫描循环");

        loop {
            if !*self.running.read().await {
                info!("收到停止信号，退出恢复扫描循环");
                break;
            }

            if let Err(e) = self.recover_system_state().await {
                error!("恢复扫描时出错: {}", e);
            }

            tokio::time::sleep(self.config.interval).await;
        }

        Ok(())
    }
}

#[async_trait]
impl RecoveryService for SystemRecoveryService {
    async fn recover_system_state(&self) -> TaskGraphResult<RecoveryReport> {
        let start_time = std::time::Instant::now();
        let mut report = RecoveryReport::default();

        match self.recover_unevaluated_tasks().await {
            Ok(tasks) => report.recovered_tasks = tasks,
            Err(e) => {
                let error_msg = format!("恢复未评估任务失败: {e}");
                error!("{}", error_msg);
                report.errors.push(error_msg);
            }
        }

        match self.finalize_finished_graphs().await {
            Ok(graphs) => report.finalized_graphs = graphs,
            Err(e) => {
                let error_msg = format!("结束已完成任务图失败: {e}");
                error!("{}", error_msg);
                report.errors.push(error_msg);
            }
        }

        report.recovery_duration_ms = start_time.elapsed().as_millis() as u64;
        if !report.recovered_tasks.is_empty() || !report.finalized_graphs.is_empty() {
            info!(
                "恢复扫描完成，耗时 {}ms，恢复任务 {} 个，结束任务图 {} 个",
                report.recovery_duration_ms,
                report.recovered_tasks.len(),
                report.finalized_graphs.len()
            );
        }
        Ok(report)
    }

    async fn recover_unevaluated_tasks(&self) -> TaskGraphResult<Vec<Uuid>> {
        let mut recovered = Vec::new();

        for domain in &self.config.domains {
            let tasks = self
                .store
                .find_unevaluated_tasks(domain, Some(self.config.batch_size))
                .await?;

            for task in tasks {
                debug!("任务 {} 已结束但未评估，重新传播", task.task_id);
                match self.completion.propagate(&task, None).await {
                    Ok(_) => recovered.push(task.task_id),
                    Err(e) => error!("恢复任务 {} 失败: {}", task.task_id, e),
                }
            }
        }

        Ok(recovered)
    }

    async fn finalize_finished_graphs(&self) -> TaskGraphResult<Vec<Uuid>> {
        let mut finalized = Vec::new();

        for domain in &self.config.domains {
            for graph in self.store.find_active_graphs(domain).await? {
                // 记录未写全的任务图由 check_graph_finished 判为未完成
                match self.completion.evaluate_graph(graph.instance_id, None).await {
                    Ok(Some(GraphTransition::Applied(done))) => {
                        info!("任务图 {} 已由恢复扫描结束: {}", done.instance_id, done.status);
                        finalized.push(done.instance_id);
                    }
                    Ok(_) => {}
                    Err(e) => error!("判定任务图 {} 失败: {}", graph.instance_id, e),
                }
            }
        }

        Ok(finalized)
    }

    async fn start(&self) -> TaskGraphResult<()> {
        info!("启动恢复服务");
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        self.recovery_loop().await
    }

    async fn stop(&self) -> TaskGraphResult<()> {
        info!("停止恢复服务");
        let mut running = self.running.write().await;
        *running = false;
        Ok(())
    }
}
