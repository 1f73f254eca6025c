use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 为空时使用 `<hostname>-<pid>`
    pub worker_id: String,
    pub domain: String,
    pub max_concurrent_tasks: usize,
    pub poll_interval_ms: u64,
    pub task_timeout_seconds: u64,
    /// 单次领取的最大完整轮数
    pub max_claim_attempts: u32,
    /// 轮与轮之间的初始退避，按指数增长
    pub claim_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: String::new(),
            domain: crate::models::DEFAULT_DOMAIN.to_string(),
            max_concurrent_tasks: 4,
            poll_interval_ms: 1000,
            task_timeout_seconds: 300,
            max_claim_attempts: 3,
            claim_backoff_ms: 100,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.domain.is_empty() {
            return Err(anyhow::anyhow!("任务域不能为空"));
        }

        if self.max_concurrent_tasks == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }

        if self.task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务超时时间必须大于0"));
        }

        if self.max_claim_attempts == 0 {
            return Err(anyhow::anyhow!("最大领取轮数必须大于0"));
        }

        Ok(())
    }
}
