use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use taskgraph_core::{
    config::{LeaseConfig, WorkerConfig},
    models::{TaskDependency, TaskState, DEFAULT_DOMAIN},
    traits::{CheckoutResult, TaskGraphStore, TaskRef},
    TaskGraphError, TaskGraphResult,
};
use taskgraph_dispatcher::{CompletionOutcome, TaskCompletionService, TaskReport};

use crate::executors::ExecutionContext;
use crate::heartbeat::HeartbeatManager;
use crate::registry::ExecutorRegistry;

/// `<hostname>-<pid>`
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

#[derive(Debug, Clone)]
pub struct WorkerServiceConfig {
    pub worker_id: String,
    pub domain: String,
    pub max_concurrent_tasks: usize,
    pub poll_interval: Duration,
    pub task_timeout: Duration,
    /// 单次领取最多遍历就绪任务的轮数
    pub max_claim_attempts: u32,
    /// 第一轮之后的退避，每轮翻倍
    pub claim_backoff: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerServiceConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            domain: DEFAULT_DOMAIN.to_string(),
            max_concurrent_tasks: 4,
            poll_interval: Duration::from_millis(1000),
            task_timeout: Duration::from_secs(300),
            max_claim_attempts: 3,
            claim_backoff: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl WorkerServiceConfig {
    pub fn from_config(worker: &WorkerConfig, lease: &LeaseConfig) -> Self {
        let worker_id = if worker.worker_id.is_empty() {
            default_worker_id()
        } else {
            worker.worker_id.clone()
        };
        Self {
            worker_id,
            domain: worker.domain.clone(),
            max_concurrent_tasks: worker.max_concurrent_tasks,
            poll_interval: Duration::from_millis(worker.poll_interval_ms),
            task_timeout: Duration::from_secs(worker.task_timeout_seconds),
            max_claim_attempts: worker.max_claim_attempts,
            claim_backoff: Duration::from_millis(worker.claim_backoff_ms),
            heartbeat_interval: Duration::from_secs(lease.heartbeat_interval_seconds),
        }
    }
}

pub struct WorkerServiceBuilder {
    store: Arc<dyn TaskGraphStore>,
    completion: Arc<TaskCompletionService>,
    registry: Option<Arc<ExecutorRegistry>>,
    config: WorkerServiceConfig,
}

impl WorkerServiceBuilder {
    pub fn new(store: Arc<dyn TaskGraphStore>, completion: Arc<TaskCompletionService>) -> Self {
        Self {
            store,
            completion,
            registry: None,
            config: WorkerServiceConfig::default(),
        }
    }

    pub fn config(mut self, config: WorkerServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = worker_id.into();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.config.domain = domain.into();
        self
    }

    pub fn registry(mut self, registry: Arc<ExecutorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> WorkerService {
        let (shutdown_tx, _) = broadcast::channel(1);
        let max_concurrent_tasks = self.config.max_concurrent_tasks.max(1);
        WorkerService {
            heartbeat: HeartbeatManager::new(
                self.config.worker_id.clone(),
                Arc::clone(&self.store),
                self.config.heartbeat_interval,
            ),
            store: self.store,
            completion: self.completion,
            registry: self.registry.unwrap_or_default(),
            permits: Arc::new(Semaphore::new(max_concurrent_tasks)),
            config: WorkerServiceConfig {
                max_concurrent_tasks,
                ..self.config
            },
            shutdown_tx,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// 工作节点
///
/// 轮询就绪任务、领取、执行，再通过完成流水线上报结果。
/// 节点之间不直接通信，互斥完全依赖存储层的条件更新。
#[derive(Clone)]
pub struct WorkerService {
    config: WorkerServiceConfig,
    store: Arc<dyn TaskGraphStore>,
    completion: Arc<TaskCompletionService>,
    registry: Arc<ExecutorRegistry>,
    heartbeat: HeartbeatManager,
    permits: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
    /// 在循环订阅之前调用 `stop` 也能生效
    stopped: Arc<AtomicBool>,
}

impl WorkerService {
    pub fn builder(
        store: Arc<dyn TaskGraphStore>,
        completion: Arc<TaskCompletionService>,
    ) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(store, completion)
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &WorkerServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// 正在执行的任务数
    pub fn running_tasks(&self) -> usize {
        self.config.max_concurrent_tasks - self.permits.available_permits()
    }

    /// 领取一个就绪任务
    ///
    /// 按顺序尝试候选任务，被其他节点抢先的直接跳过；一整轮都没领到时退避后重新查询，
    /// 最多 `max_claim_attempts` 轮。
    pub async fn claim_next(&self) -> TaskGraphResult<Option<TaskDependency>> {
        for pass in 0..self.config.max_claim_attempts {
            let ready = self.store.find_ready_tasks(&self.config.domain, None).await?;
            if ready.tasks.is_empty() {
                return Ok(None);
            }

            for candidate in &ready.tasks {
                let task = TaskRef::from(candidate);
                match self.store.checkout_task(&self.config.worker_id, &task).await {
                    Ok(CheckoutResult::Acquired(record)) => {
                        debug!("工作节点 {} 领取任务 {}", self.config.worker_id, record.task_id);
                        return Ok(Some(record));
                    }
                    Ok(CheckoutResult::Contended { owner }) => {
                        debug!("任务 {} 已被 {} 领取", task.task_id, owner);
                    }
                    Ok(CheckoutResult::Unavailable) => {
                        debug!("任务 {} 已不可领取", task.task_id);
                    }
                    // 任务图在查询之后被清理
                    Err(TaskGraphError::TaskNotFound { id }) => {
                        debug!("任务 {} 已不存在", id);
                    }
                    Err(e) => return Err(e),
                }
            }

            if pass + 1 < self.config.max_claim_attempts {
                let backoff = self.config.claim_backoff.saturating_mul(2u32.saturating_pow(pass));
                debug!("第 {} 轮未领取到任务，{:?} 后重试", pass + 1, backoff);
                tokio::time::sleep(backoff).await;
            }
        }

        debug!(
            "工作节点 {} 在 {} 轮内未领取到任务",
            self.config.worker_id, self.config.max_claim_attempts
        );
        Ok(None)
    }

    /// 执行一个已领取的任务并上报结果
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id, task_id = %task.task_id))]
    pub async fn execute(&self, task: TaskRef) -> TaskGraphResult<CompletionOutcome> {
        let view = self.store.get_task_by_id(&task).await?;

        let report = match view.task {
            Some(entry) => {
                let context = ExecutionContext {
                    task,
                    label: entry.label,
                    task_name: entry.task_name,
                    options: entry.options,
                    graph_context: view.context,
                    worker_id: self.config.worker_id.clone(),
                };
                self.run_executor(&context).await
            }
            None => {
                warn!("任务图 {} 中没有任务 {} 的条目", task.graph_id, task.task_id);
                TaskReport::failed(task, TaskState::Failed, "任务图中没有该任务的条目")
            }
        };

        let outcome = self.completion.complete(&report).await?;
        if let Some(transition) = &outcome.graph {
            info!("任务图 {} 结束: {}", task.graph_id, transition.status());
        }
        Ok(outcome)
    }

    async fn run_executor(&self, context: &ExecutionContext) -> TaskReport {
        let task = context.task;
        let Some(executor) = self.registry.get(&context.task_name).await else {
            warn!("没有可执行 {} 的执行器", context.task_name);
            return TaskReport::failed(
                task,
                TaskState::Failed,
                format!("不支持的任务类型: {}", context.task_name),
            );
        };

        info!("开始执行任务 {} ({})", context.label, context.task_name);
        let started = Instant::now();

        let report = match tokio::time::timeout(self.config.task_timeout, executor.execute(context)).await
        {
            Ok(Ok(output)) if output.state == TaskState::Pending => TaskReport::failed(
                task,
                TaskState::Failed,
                "执行器返回了未结束的状态",
            ),
            Ok(Ok(output)) => TaskReport {
                graph_id: task.graph_id,
                task_id: task.task_id,
                state: output.state,
                error: output.error,
                context: output.context,
            },
            Ok(Err(e)) => TaskReport::failed(task, TaskState::Failed, e.to_string()),
            Err(_) => TaskReport::failed(
                task,
                TaskState::Timeout,
                format!("任务执行超时 ({:?})", self.config.task_timeout),
            ),
        };

        info!(
            "任务 {} 执行结束: state={}, duration={}ms",
            context.label,
            report.state,
            started.elapsed().as_millis()
        );
        report
    }

    /// 在有空闲并发槽时领取一个任务并在后台执行，返回是否领取到任务
    pub async fn poll_once(&self) -> TaskGraphResult<bool> {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return Ok(false);
        };

        let Some(record) = self.claim_next().await? else {
            return Ok(false);
        };

        let worker = self.clone();
        let task = TaskRef::from(&record);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = worker.execute(task).await {
                // 已写入终态的任务由恢复扫描补完，未写入的等待租约过期后重新调度
                error!("任务 {} 上报结果失败: {}", task.task_id, e);
            }
        });

        Ok(true)
    }

    /// 运行轮询循环直到 `stop` 被调用，退出前等待在途任务结束
    pub async fn start(&self) -> TaskGraphResult<()> {
        info!(
            "启动工作节点 {}: domain={}, max_concurrent_tasks={}",
            self.config.worker_id, self.config.domain, self.config.max_concurrent_tasks
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let heartbeat_handle = self.heartbeat.start(self.shutdown_tx.subscribe());

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                info!("工作节点 {} 已被停止", self.config.worker_id);
                break;
            }

            let claimed = match self.poll_once().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!("领取任务失败: {}", e);
                    false
                }
            };

            // 领到任务时立即尝试下一个
            let delay = if claimed {
                Duration::ZERO
            } else {
                self.config.poll_interval
            };
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("工作节点 {} 收到停止信号", self.config.worker_id);
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.wait_for_running_tasks().await;
        if let Err(e) = heartbeat_handle.await {
            error!("心跳任务异常退出: {}", e);
        }
        info!("工作节点 {} 已停止", self.config.worker_id);
        Ok(())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if self.shutdown_tx.send(()).is_err() {
            debug!("工作节点 {} 未在运行", self.config.worker_id);
        }
    }

    async fn wait_for_running_tasks(&self) {
        let running = self.running_tasks();
        if running == 0 {
            return;
        }
        info!("等待 {} 个在途任务结束", running);

        let all = self.config.max_concurrent_tasks as u32;
        match tokio::time::timeout(self.config.task_timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(_permits)) => debug!("在途任务已全部结束"),
            Ok(Err(e)) => error!("等待在途任务失败: {}", e),
            Err(_) => warn!("等待在途任务超时，未完成的任务将在租约过期后重新调度"),
        }
    }
}
