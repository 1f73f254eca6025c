use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use taskgraph_core::{traits::TaskGraphStore, TaskGraphResult};

/// 定期为本节点持有的全部租约续约
#[derive(Clone)]
pub struct HeartbeatManager {
    worker_id: String,
    store: Arc<dyn TaskGraphStore>,
    heartbeat_interval: Duration,
}

impl HeartbeatManager {
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn TaskGraphStore>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            heartbeat_interval,
        }
    }

    /// 续约一次，返回续约成功的租约数
    pub async fn beat(&self) -> TaskGraphResult<usize> {
        let renewed = self.store.heartbeat_tasks_for_runner(&self.worker_id).await?;
        debug!("工作节点 {} 续约 {} 个租约", self.worker_id, renewed);
        Ok(renewed)
    }

    /// 在后台循环续约，收到关闭信号后退出
    pub fn start(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(async move {
            let mut heartbeat_interval = interval(manager.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = heartbeat_interval.tick() => {
                        if let Err(e) = manager.beat().await {
                            error!("工作节点 {} 续约租约失败: {}", manager.worker_id, e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("心跳任务退出: {}", manager.worker_id);
                        break;
                    }
                }
            }
        })
    }
}
