use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::executors::{NoopExecutor, ShellExecutor, TaskExecutor};

/// 按任务名查找执行器
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn TaskExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// 预先注册 `noop` 和 `shell`
    pub async fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(NoopExecutor)).await;
        registry.register(Arc::new(ShellExecutor::new())).await;
        registry
    }

    /// 同名执行器会被替换
    pub async fn register(&self, executor: Arc<dyn TaskExecutor>) {
        let name = executor.name().to_string();
        let mut executors = self.executors.write().await;
        if executors.insert(name.clone(), executor).is_some() {
            warn!("执行器 {} 已存在，替换为新的实现", name);
        } else {
            info!("注册执行器: {}", name);
        }
    }

    pub async fn get(&self, task_name: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.read().await.get(task_name).cloned()
    }

    pub async fn contains(&self, task_name: &str) -> bool {
        self.executors.read().await.contains_key(task_name)
    }

    pub async fn list_executors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_executors() {
        let registry = ExecutorRegistry::with_builtin().await;
        assert_eq!(registry.list_executors().await, vec!["noop", "shell"]);
        assert!(registry.contains("shell").await);
        assert!(registry.get("http").await.is_none());

        registry.register(Arc::new(NoopExecutor)).await;
        assert_eq!(registry.list_executors().await.len(), 2);
    }
}
