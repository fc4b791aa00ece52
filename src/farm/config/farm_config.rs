use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::farm::template::TemplateDefinition;

/// 完整的农场配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub executor: ExecutorConfig,
    pub container: ContainerConfig,
    pub broadcast: BroadcastConfig,
    pub driver: DriverConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
    pub templates: Vec<TemplateDefinition>,
}

/// HTTP / Socket.IO 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub http_port: u16,
    pub socket_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            http_port: 3000,
            socket_port: 4000,
        }
    }
}

/// Agent 心跳配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Agent 上报心跳的间隔（秒）
    pub interval_secs: u64,

    /// TTL = interval × ttl_multiplier
    pub ttl_multiplier: u32,

    /// 离线扫描间隔（秒）
    pub sweep_interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            ttl_multiplier: 5,
            sweep_interval_secs: 5,
        }
    }
}

impl HeartbeatConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.interval_secs * self.ttl_multiplier as u64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// 任务执行器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// 全局最大并发任务数
    pub max_concurrent_jobs: usize,

    /// 保留的历史任务数
    pub history_limit: usize,

    /// 设备初始化超时（秒）
    pub init_timeout_secs: u64,

    /// 单个动作超时（秒）
    pub action_timeout_secs: u64,

    /// 允许失败的账号数，超过即判定任务失败；不设置时只有全部失败才算失败
    pub max_failed_accounts: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 20,
            history_limit: 50,
            init_timeout_secs: 30,
            action_timeout_secs: 60,
            max_failed_accounts: None,
        }
    }
}

/// 容器切换配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// 每个检查点的超时（秒）
    pub step_timeout_secs: u64,

    /// 暂时性失败后重试前的等待（毫秒）
    pub retry_delay_ms: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 15,
            retry_delay_ms: 1500,
        }
    }
}

/// 状态广播配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// 每个订阅者的缓冲区大小
    pub subscriber_buffer: usize,

    /// 汇总快照广播间隔（秒）
    pub snapshot_interval_secs: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            snapshot_interval_secs: 10,
        }
    }
}

/// 自动化驱动类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// 通过设备所在 Agent 的 HTTP 接口驱动
    Http,
    /// 通过本机 ADB 驱动
    Adb,
    /// 进程内脚本驱动（演练用）
    Scripted,
}

/// 驱动配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub kind: DriverKind,

    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::Http,
            request_timeout_secs: 30,
        }
    }
}

/// 历史记录配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// JSONL 文件路径，不设置时只保存在内存中
    pub path: Option<String>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "phone_farm=info,tower_http=info".to_string(),
            directory: None,
            file_prefix: "farm.log".to_string(),
        }
    }
}

impl FarmConfig {
    /// 从 TOML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_toml(&content)
    }

    /// 从 TOML 字符串解析配置
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FarmConfig = toml::from_str(content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// 从文件加载，并使用环境变量覆盖
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        Ok(config)
    }

    /// 文件不存在时使用默认配置，返回值的第二项表示是否读取了文件
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<(Self, bool), ConfigError> {
        if path.as_ref().exists() {
            return Ok((Self::from_file_with_env(path)?, true));
        }

        let mut config = Self::default();
        config.apply_env()?;
        Ok((config, false))
    }

    /// 使用环境变量覆盖
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var("FARM_HTTP_PORT") {
            self.server.http_port = parse_env("FARM_HTTP_PORT", &port)?;
        }

        if let Ok(port) = std::env::var("FARM_SOCKET_PORT") {
            self.server.socket_port = parse_env("FARM_SOCKET_PORT", &port)?;
        }

        if let Ok(max) = std::env::var("FARM_MAX_CONCURRENT_JOBS") {
            self.executor.max_concurrent_jobs = parse_env("FARM_MAX_CONCURRENT_JOBS", &max)?;
        }

        if let Ok(filter) = std::env::var("FARM_LOG_FILTER") {
            self.logging.filter = filter;
        }

        self.validate()
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.max_concurrent_jobs == 0 {
            return Err(ConfigError::ValidationError(
                "executor.max_concurrent_jobs 必须大于 0".to_string(),
            ));
        }

        if self.heartbeat.ttl().is_zero() {
            return Err(ConfigError::ValidationError(
                "heartbeat.interval_secs 与 ttl_multiplier 必须大于 0".to_string(),
            ));
        }

        if self.broadcast.subscriber_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "broadcast.subscriber_buffer 必须大于 0".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for template in &self.templates {
            if !names.insert(template.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "模板名称重复: {}",
                    template.name
                )));
            }
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("环境变量 {} 的值非法: {}", name, value)))
}

/// 配置错误
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO 错误: {0}")]
    IoError(String),

    #[error("解析错误: {0}")]
    ParseError(String),

    #[error("验证错误: {0}")]
    ValidationError(String),
}
