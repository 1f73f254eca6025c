use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use taskgraph_core::{
    models::{GraphContext, GraphDefinition, GraphObject},
    traits::TaskGraphStore,
    AppConfig, TaskGraphResult,
};
use taskgraph_dispatcher::{
    CompletedGraphCleaner, CoordinationStore, GraphCleanerConfig, GraphCleanerService,
    GraphFactory, LeaseReaper, LeaseReaperConfig, LeaseReaperService, RecoveryService,
    RecoveryServiceConfig, SystemRecoveryService, TaskCompletionService,
};
use taskgraph_infrastructure::DatabaseManager;
use taskgraph_worker::{ExecutorRegistry, WorkerService, WorkerServiceConfig};

/// 停止信号发出后等待后台循环退出的时间
const SERVICE_STOP_GRACE: Duration = Duration::from_secs(5);

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 只运行工作节点
    Worker,
    /// 租约回收、恢复扫描、已完成任务图清理
    Coordinator,
    All,
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "worker" => Ok(AppMode::Worker),
            "coordinator" => Ok(AppMode::Coordinator),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    store: Arc<dyn TaskGraphStore>,
    completion: Arc<TaskCompletionService>,
}

impl Application {
    /// 连接数据库并确保表结构存在
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("连接数据库: {}", mask_database_url(&config.database.url));

        let database = DatabaseManager::from_config(&config)
            .await
            .context("连接数据库失败")?;
        database.migrate().await.context("初始化数据库结构失败")?;

        let store: Arc<dyn TaskGraphStore> = Arc::new(CoordinationStore::from_config(
            database.store_backend(),
            &config.store,
        ));
        let completion = Arc::new(TaskCompletionService::new(Arc::clone(&store)));

        info!("存储引擎: {}", database.backend_kind());
        Ok(Self {
            config,
            database,
            store,
            completion,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn TaskGraphStore> {
        Arc::clone(&self.store)
    }

    pub async fn run(&self, mode: AppMode, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", mode);

        match mode {
            AppMode::Worker => {
                if !self.config.worker.enabled {
                    return Err(anyhow::anyhow!("Worker模式被禁用，请检查配置"));
                }
                self.run_worker(shutdown_rx).await
            }
            AppMode::Coordinator => self.run_coordinator(shutdown_rx).await,
            AppMode::All => {
                if !self.config.worker.enabled {
                    info!("Worker已在配置中禁用，只运行协调服务");
                    return self.run_coordinator(shutdown_rx).await;
                }
                let (coordinator, worker) = tokio::join!(
                    self.run_coordinator(shutdown_rx.resubscribe()),
                    self.run_worker(shutdown_rx)
                );
                coordinator.and(worker)
            }
        }
    }

    async fn run_coordinator(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动协调服务");

        let reaper = Arc::new(LeaseReaper::new(
            self.store(),
            Some(LeaseReaperConfig::from_config(
                &self.config.lease,
                &self.config.store,
            )),
        ));
        let reaper_handle = {
            let reaper = Arc::clone(&reaper);
            spawn_service("租约回收", async move { reaper.start().await })
        };

        let recovery = self.config.recovery.enabled.then(|| {
            Arc::new(SystemRecoveryService::new(
                self.store(),
                Arc::clone(&self.completion),
                Some(RecoveryServiceConfig::from_config(
                    &self.config.recovery,
                    &self.config.store,
                )),
            ))
        });
        let recovery_handle = recovery.as_ref().map(|recovery| {
            let recovery = Arc::clone(recovery);
            spawn_service("恢复扫描", async move { recovery.start().await })
        });

        let cleaner = self.config.cleanup.enabled.then(|| {
            Arc::new(CompletedGraphCleaner::new(
                self.store(),
                Some(GraphCleanerConfig::from(&self.config.cleanup)),
            ))
        });
        let cleaner_handle = cleaner.as_ref().map(|cleaner| {
            let cleaner = Arc::clone(cleaner);
            spawn_service("已完成任务图清理", async move { cleaner.start().await })
        });

        let _ = shutdown_rx.recv().await;
        info!("协调服务收到关闭信号");

        reaper.stop().await?;
        join_service("租约回收", reaper_handle).await;

        if let (Some(recovery), Some(handle)) = (recovery, recovery_handle) {
            recovery.stop().await?;
            join_service("恢复扫描", handle).await;
        }
        if let (Some(cleaner), Some(handle)) = (cleaner, cleaner_handle) {
            cleaner.stop().await?;
            join_service("已完成任务图清理", handle).await;
        }

        info!("协调服务已停止");
        Ok(())
    }

    async fn run_worker(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let registry = Arc::new(ExecutorRegistry::with_builtin().await);
        let worker = WorkerService::builder(self.store(), Arc::clone(&self.completion))
            .config(WorkerServiceConfig::from_config(
                &self.config.worker,
                &self.config.lease,
            ))
            .registry(registry)
            .build();
        info!(
            "启动Worker服务: {}，执行器: {:?}",
            worker.worker_id(),
            worker.registry().list_executors().await
        );

        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.start().await })
        };

        let _ = shutdown_rx.recv().await;
        info!("Worker收到关闭信号");
        worker.stop();

        match handle.await {
            Ok(result) => result.context("Worker运行失败")?,
            Err(e) => error!("Worker任务异常退出: {}", e),
        }

        info!("Worker服务已停止");
        Ok(())
    }

    /// 读取定义文件，保存定义并创建一个任务图实例
    pub async fn submit_definition_file(
        &self,
        path: &Path,
        context: GraphContext,
        domain: &str,
    ) -> Result<GraphObject> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("读取任务图定义失败: {}", path.display()))?;
        let definition: GraphDefinition = serde_json::from_str(&content)
            .with_context(|| format!("解析任务图定义失败: {}", path.display()))?;

        GraphFactory::validate(&definition).context("任务图定义无效")?;
        self.store
            .persist_graph_definition(&definition)
            .await
            .context("保存任务图定义失败")?;

        let graph = GraphFactory::new(self.store())
            .submit(&definition, context, domain)
            .await
            .context("创建任务图失败")?;
        Ok(graph)
    }

    pub async fn close(&self) {
        self.database.close().await;
    }
}

fn spawn_service<F>(name: &'static str, service: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = TaskGraphResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = service.await {
            error!("{}服务运行失败: {}", name, e);
        }
    })
}

/// 后台循环在两次扫描之间休眠，超过宽限时间直接中止
async fn join_service(name: &str, mut handle: JoinHandle<()>) {
    if tokio::time::timeout(SERVICE_STOP_GRACE, &mut handle)
        .await
        .is_err()
    {
        warn!("{}服务未在 {:?} 内退出，强制中止", name, SERVICE_STOP_GRACE);
        handle.abort();
    }
}

/// 屏蔽数据库URL中的敏感信息
pub fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}
