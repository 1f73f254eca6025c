use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use taskgraph_core::{
    config::{LeaseConfig, StoreConfig},
    models::DEFAULT_DOMAIN,
    traits::TaskGraphStore,
    TaskGraphResult,
};

/// 过期租约回收配置
#[derive(Debug, Clone)]
pub struct LeaseReaperConfig {
    /// 心跳超过该时长未更新即视为过期
    pub lease_timeout: chrono::Duration,
    /// 扫描间隔
    pub reap_interval: Duration,
    /// 需要扫描的任务域
    pub domains: Vec<String>,
}

impl Default for LeaseReaperConfig {
    fn default() -> Self {
        Self {
            lease_timeout: chrono::Duration::seconds(60),
            reap_interval: Duration::from_secs(15),
            domains: vec![DEFAULT_DOMAIN.to_string()],
        }
    }
}

impl LeaseReaperConfig {
    pub fn from_config(lease: &LeaseConfig, store: &StoreConfig) -> Self {
        Self {
            lease_timeout: lease.timeout(),
            reap_interval: Duration::from_secs(lease.reap_interval_seconds),
            domains: store.domains.clone(),
        }
    }
}

/// 过期租约回收服务接口
#[async_trait]
pub trait LeaseReaperService: Send + Sync {
    /// 启动回收循环，直到 `stop` 被调用
    async fn start(&self) -> TaskGraphResult<()>;

    async fn stop(&self) -> TaskGraphResult<()>;

    /// 执行一轮扫描，返回回收的租约数
    async fn reap_expired_leases(&self) -> TaskGraphResult<usize>;
}

pub struct LeaseReaper {
    store: Arc<dyn TaskGraphStore>,
    config: LeaseReaperConfig,
    running: Arc<tokio::sync::RwLock<bool>>,
}

impl LeaseReaper {
    pub fn new(store: Arc<dyn TaskGraphStore>, config: Option<LeaseReaperConfig>) -> Self {
        Self {
            store,
            config: config.unwrap_or_default(),
            running: Arc::new(tokio::sync::RwLock::new(false)),
        }
    }

    async fn reap_loop(&self) -> TaskGraphResult<()> {
        info!("启动过期租约回收循环");

        loop {
            if !*self.running.read().await {
                info!("收到停止信号，退出过期租约回收循环");
                break;
            }

            match self.reap_expired_leases().await {
                Ok(count) if count > 0 => info!("本轮回收了 {} 个过期租约", count),
                Ok(_) => {}
                Err(e) => error!("回收过期租约时出错: {}", e),
            }

            tokio::time::sleep(self.config.reap_interval).await;
        }

        Ok(())
    }
}

#[async_trait]
impl LeaseReaperService for LeaseReaper {
    async fn start(&self) -> TaskGraphResult<()> {
        info!("启动过期租约回收服务");
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        self.reap_loop().await
    }

    async fn stop(&self) -> TaskGraphResult<()> {
        info!("停止过期租约回收服务");
        let mut running = self.running.write().await;
        *running = false;
        Ok(())
    }

    async fn reap_expired_leases(&self) -> TaskGraphResult<usize> {
        let mut reclaimed = 0;

        for domain in &self.config.domains {
            let expired = self
                .store
                .find_expired_leases(domain, self.config.lease_timeout)
                .await?;
            if expired.is_empty() {
                continue;
            }
            debug!("任务域 {} 中发现 {} 个过期租约", domain, expired.len());

            for task in expired {
                let Some(claim) = task.lease_claim() else {
                    continue;
                };
                warn!(
                    "任务 {} 的租约已过期: 持有者 {}, 上次心跳 {}",
                    task.task_id,
                    claim.owner,
                    claim.heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
                );
                match self.store.expire_lease(task.task_id, &claim).await {
                    Ok(true) => reclaimed += 1,
                    Ok(false) => debug!("任务 {} 的租约已被续约或转移，跳过", task.task_id),
                    Err(e) => error!("回收任务 {} 的租约失败: {}", task.task_id, e),
                }
            }
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_app_sections() {
        let lease = LeaseConfig {
            timeout_seconds: 45,
            reap_interval_seconds: 5,
            ..LeaseConfig::default()
        };
        let store = StoreConfig {
            domains: vec!["default".to_string(), "lab".to_string()],
            ..StoreConfig::default()
        };

        let config = LeaseReaperConfig::from_config(&lease, &store);
        assert_eq!(config.lease_timeout, chrono::Duration::seconds(45));
        assert_eq!(config.reap_interval, Duration::from_secs(5));
        assert_eq!(config.domains, vec!["default", "lab"]);
    }
}
