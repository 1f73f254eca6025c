use std::collections::HashMap;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use taskgraph_core::{
    models::{GraphContext, TaskState},
    traits::TaskRef,
    TaskGraphError, TaskGraphResult,
};

/// 执行器看到的任务信息，来自任务图镜像
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task: TaskRef,
    pub label: String,
    pub task_name: String,
    pub options: serde_json::Value,
    /// 领取时任务图共享上下文的快照
    pub graph_context: GraphContext,
    pub worker_id: String,
}

/// 执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    pub state: TaskState,
    /// 成功时合并进任务图上下文
    pub context: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ExecutionOutput {
    pub fn succeeded(context: Option<serde_json::Value>) -> Self {
        Self {
            state: TaskState::Succeeded,
            context,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: TaskState::Failed,
            context: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 对应任务定义中的 `taskName`
    fn name(&self) -> &str;

    /// 返回 `Err` 时任务按失败上报
    async fn execute(&self, context: &ExecutionContext) -> TaskGraphResult<ExecutionOutput>;
}

/// 不做任何事，把 options 原样写回上下文
#[derive(Debug, Default)]
pub struct NoopExecutor;

#[async_trait]
impl TaskExecutor for NoopExecutor {
    fn name(&self) -> &str {
        "noop"
    }

    async fn execute(&self, context: &ExecutionContext) -> TaskGraphResult<ExecutionOutput> {
        debug!("noop任务: {} ({})", context.label, context.task.task_id);
        let echoed = match &context.options {
            serde_json::Value::Object(map) if !map.is_empty() => Some(context.options.clone()),
            _ => None,
        };
        Ok(ExecutionOutput::succeeded(echoed))
    }
}

/// Shell任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellTaskParams {
    /// 要执行的命令
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// Shell任务执行器
///
/// 成功时把输出以 `{label: {stdout, exitCode}}` 写入上下文；
/// 退出码非零时任务失败，错误信息取stderr。
#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, context: &ExecutionContext) -> TaskGraphResult<ExecutionOutput> {
        let start_time = Instant::now();

        let params: ShellTaskParams = serde_json::from_value(context.options.clone())
            .map_err(|e| TaskGraphError::TaskExecution(format!("解析Shell任务参数失败: {e}")))?;

        info!(
            "执行Shell任务: task_id={}, command={}, args={:?}",
            context.task.task_id, params.command, params.args
        );

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // 超时后 future 被丢弃，进程随之结束
            .kill_on_drop(true)
            .env("TASKGRAPH_GRAPH_ID", context.task.graph_id.to_string())
            .env("TASKGRAPH_TASK_ID", context.task.task_id.to_string())
            .env("TASKGRAPH_WORKER_ID", &context.worker_id);

        if let Some(ref dir) = params.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &params.env_vars {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TaskGraphError::TaskExecution(format!("启动Shell命令失败: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskGraphError::TaskExecution("无法获取stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TaskGraphError::TaskExecution("无法获取stderr".to_string()))?;

        let mut stdout_reader = BufReader::new(stdout);
        let mut stderr_reader = BufReader::new(stderr);
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();

        let stdout_task = async {
            let mut line = String::new();
            while stdout_reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                stdout_lines.push(line.trim_end().to_string());
                line.clear();
            }
        };
        let stderr_task = async {
            let mut line = String::new();
            while stderr_reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                stderr_lines.push(line.trim_end().to_string());
                line.clear();
            }
        };
        tokio::join!(stdout_task, stderr_task);

        let exit_status = child
            .wait()
            .await
            .map_err(|e| TaskGraphError::TaskExecution(format!("等待进程结束失败: {e}")))?;
        let exit_code = exit_status.code();

        info!(
            "Shell任务执行完成: task_id={}, success={}, exit_code={:?}, duration={}ms",
            context.task.task_id,
            exit_status.success(),
            exit_code,
            start_time.elapsed().as_millis()
        );

        if !exit_status.success() {
            let message = if stderr_lines.is_empty() {
                format!("命令执行失败，退出码: {exit_code:?}")
            } else {
                stderr_lines.join("\n")
            };
            return Ok(ExecutionOutput::failed(message));
        }

        Ok(ExecutionOutput::succeeded(Some(json!({
            context.label.as_str(): {
                "stdout": stdout_lines.join("\n"),
                "exitCode": exit_code,
            }
        }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn context(task_name: &str, options: serde_json::Value) -> ExecutionContext {
        ExecutionContext {
            task: TaskRef::new(Uuid::new_v4(), Uuid::new_v4()),
            label: "step".to_string(),
            task_name: task_name.to_string(),
            options,
            graph_context: GraphContext::new(),
            worker_id: "worker-test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_noop_echoes_options() {
        let output = NoopExecutor
            .execute(&context("noop", json!({ "ip": "10.0.0.1" })))
            .await
            .unwrap();
        assert_eq!(output.state, TaskState::Succeeded);
        assert_eq!(output.context, Some(json!({ "ip": "10.0.0.1" })));

        let output = NoopExecutor.execute(&context("noop", json!(null))).await.unwrap();
        assert_eq!(output.context, None);
    }

    #[tokio::test]
    async fn test_shell_success_captures_stdout() {
        let output = ShellExecutor::new()
            .execute(&context(
                "shell",
                json!({ "command": "sh", "args": ["-c", "echo hello; echo world"] }),
            ))
            .await
            .unwrap();
        assert_eq!(output.state, TaskState::Succeeded);
        let captured = output.context.unwrap();
        assert_eq!(captured["step"]["stdout"], json!("hello\nworld"));
        assert_eq!(captured["step"]["exitCode"], json!(0));
    }

    #[tokio::test]
    async fn test_shell_nonzero_exit_fails() {
        let output = ShellExecutor::new()
            .execute(&context(
                "shell",
                json!({ "command": "sh", "args": ["-c", "echo boom >&2; exit 3"] }),
            ))
            .await
            .unwrap();
        assert_eq!(output.state, TaskState::Failed);
        assert_eq!(output.error.as_deref(), Some("boom"));
        assert!(output.context.is_none());
    }

    #[tokio::test]
    async fn test_shell_passes_task_environment() {
        let ctx = context(
            "shell",
            json!({
                "command": "sh",
                "args": ["-c", "echo $TASKGRAPH_WORKER_ID-$NAME"],
                "envVars": { "NAME": "x" }
            }),
        );
        let output = ShellExecutor::new().execute(&ctx).await.unwrap();
        assert_eq!(output.context.unwrap()["step"]["stdout"], json!("worker-test-x"));
    }

    #[tokio::test]
    async fn test_shell_invalid_params() {
        let result = ShellExecutor::new()
            .execute(&context("shell", json!({ "args": ["-c", "true"] })))
            .await;
        assert!(matches!(result, Err(TaskGraphError::TaskExecution(_))));
    }
}
