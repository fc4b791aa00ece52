mod error;
mod farm;
mod logger;

use anyhow::Context;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use farm::api::{ApiServer, StatusSocketServer};
use farm::{ConcurrentJobExecutor, FarmConfig, create_driver};

/// 配置文件路径：命令行第一个参数、FARM_CONFIG 或 farm.toml
fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FARM_CONFIG").ok())
        .unwrap_or_else(|| "farm.toml".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let (config, from_file) =
        FarmConfig::load_or_default(&path).with_context(|| format!("加载配置失败: {}", path))?;

    let _log_guard = logger::init_tracing(&config.logging)?;

    if from_file {
        info!("已加载配置文件: {}", path);
    } else {
        warn!("配置文件 {} 不存在，使用默认配置", path);
    }

    info!(
        driver = ?config.driver.kind,
        max_concurrent_jobs = config.executor.max_concurrent_jobs,
        templates = config.templates.len(),
        "启动设备农场编排服务..."
    );

    let driver = create_driver(&config.driver).context("创建自动化驱动失败")?;
    let executor = ConcurrentJobExecutor::from_config(&config, driver)?;

    let shutdown = CancellationToken::new();

    let sweeper = executor.spawn_liveness_sweeper(config.heartbeat.sweep_interval(), shutdown.clone());
    let publisher = executor.spawn_snapshot_publisher(
        Duration::from_secs(config.broadcast.snapshot_interval_secs.max(1)),
        shutdown.clone(),
    );

    let socket_server = StatusSocketServer::new(config.server.socket_port, std::sync::Arc::clone(&executor));
    let forwarder = socket_server.spawn_forwarder(shutdown.clone());
    let socket_task = {
        let bind = config.server.bind.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { socket_server.run(&bind, shutdown).await })
    };

    let api_server = ApiServer::new(std::sync::Arc::clone(&executor));
    let addr = format!("{}:{}", config.server.bind, config.server.http_port);
    let mut api_task = tokio::spawn(api_server.run(addr, shutdown.clone()));

    let finished_early = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("监听退出信号失败: {}", e);
            }
            info!("收到退出信号，正在关闭...");
            None
        }
        joined = &mut api_task => Some(joined),
    };

    executor.shutdown().await;
    shutdown.cancel();

    let joined = match finished_early {
        Some(joined) => joined,
        None => api_task.await,
    };
    match joined {
        Ok(Err(e)) => error!("HTTP 服务器运行失败: {}", e),
        Err(e) => error!("HTTP 服务器任务异常: {:?}", e),
        Ok(Ok(())) => {}
    }
    for task in [socket_task, forwarder, sweeper, publisher] {
        if let Err(e) = task.await {
            error!("后台任务异常退出: {:?}", e);
        }
    }

    info!("服务已关闭");
    Ok(())
}
