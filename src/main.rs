use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use taskgraph::shutdown::{wait_for_os_signal, ShutdownManager};
use taskgraph::{AppMode, Application};
use taskgraph_core::models::{GraphContext, DEFAULT_DOMAIN};
use taskgraph_core::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("taskgraph")
        .version("1.0.0")
        .about("分布式任务图协调存储")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认位置查找"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["worker", "coordinator", "all", "migrate", "submit"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker ID，覆盖配置"),
        )
        .arg(
            Arg::new("definition")
                .short('d')
                .long("definition")
                .value_name("FILE")
                .help("任务图定义文件 (JSON，仅在submit模式下使用)")
                .required_if_eq("mode", "submit"),
        )
        .arg(
            Arg::new("context")
                .long("context")
                .value_name("JSON")
                .help("任务图初始上下文 (JSON对象)"),
        )
        .arg(
            Arg::new("domain")
                .long("domain")
                .value_name("DOMAIN")
                .help("任务图所属的任务域")
                .default_value(DEFAULT_DOMAIN),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");

    let mut config = AppConfig::load(config_path).context("加载配置失败")?;
    if let Some(id) = matches.get_one::<String>("worker-id") {
        config.worker.worker_id = id.clone();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;
    if config.observability.metrics_enabled {
        init_metrics(&config.observability.metrics_bind_address)?;
    }

    info!("启动任务图协调服务，模式: {mode_str}");

    let app = Application::new(config).await?;

    match mode_str {
        "migrate" => {
            info!("数据库结构已就绪");
            app.close().await;
            return Ok(());
        }
        "submit" => {
            let definition = matches
                .get_one::<String>("definition")
                .ok_or_else(|| anyhow::anyhow!("submit模式需要 --definition"))?;
            let context = match matches.get_one::<String>("context") {
                Some(json) => serde_json::from_str::<GraphContext>(json)
                    .context("解析 --context 失败，需要JSON对象")?,
                None => GraphContext::new(),
            };
            let domain = matches
                .get_one::<String>("domain")
                .map(String::as_str)
                .unwrap_or(DEFAULT_DOMAIN);

            let graph = app
                .submit_definition_file(Path::new(definition), context, domain)
                .await?;
            info!("任务图已提交: {} ({})", graph.name, graph.instance_id);
            println!("{}", graph.instance_id);
            app.close().await;
            return Ok(());
        }
        _ => {}
    }

    let mode: AppMode = mode_str.parse()?;
    let app = Arc::new(app);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(mode, shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    wait_for_os_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    app.close().await;
    info!("任务图协调服务已退出");
    Ok(())
}

fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 安装全局指标记录器并在给定地址暴露 `/metrics`
fn init_metrics(bind_address: &str) -> Result<()> {
    let addr: std::net::SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("启动Prometheus指标导出失败: {e}"))?;
    info!("Prometheus指标导出已启动: http://{addr}/metrics");
    Ok(())
}
