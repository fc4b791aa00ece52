use thiserror::Error;

use crate::farm::config::ConfigError;
use crate::farm::driver::DriverError;
use crate::farm::template::TemplateError;

/// 应用程序统一错误类型
#[derive(Error, Debug)]
pub enum AppError {
    /// 请求参数非法
    #[error("请求参数非法: {0}")]
    InvalidInput(String),

    /// 自动化驱动错误
    #[error("驱动错误: {0}")]
    Driver(#[from] DriverError),

    /// 模板错误
    #[error("模板错误: {0}")]
    Template(#[from] TemplateError),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// IO 错误
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl AppError {
    /// 将错误转换为 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::InvalidInput(_) => 400,
            AppError::Driver(_) => 502,
            AppError::Template(TemplateError::NotFound(_)) => 404,
            AppError::Template(_) => 400,
            AppError::Config(_) => 500,
            AppError::IoError(_) => 500,
            AppError::JsonError(_) => 400,
        }
    }
}
