//! 日志初始化
//!
//! 标准输出始终开启；配置了目录时另外按天滚动写入文件。

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::farm::config::LoggingConfig;

/// 日志守卫，需在 main 结束前一直持有，否则文件日志可能丢失
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// `RUST_LOG` 优先于配置中的过滤规则
fn build_filter(default_directives: &str) -> anyhow::Result<EnvFilter> {
    let directives = match std::env::var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default_directives.to_string(),
    };

    EnvFilter::try_new(&directives).with_context(|| format!("日志过滤规则非法: {}", directives))
}

/// 初始化全局日志
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<LogGuard> {
    let filter = build_filter(&config.filter)?;

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)
                .with_context(|| format!("无法创建日志目录: {}", directory))?;
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()
        .context("日志系统已初始化")?;

    Ok(LogGuard { _file: guard })
}
