use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::farm::AccountId;
use crate::farm::pool::Device;

/// 发往自动化驱动的单个动作
///
/// 编排层不解释动作内容，只负责按顺序下发并处理超时与结果。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// 动作类型，如 `launch`、`like`、`container.select`
    pub kind: String,

    /// 动作参数
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Action {
    pub fn new(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }

    /// 读取字符串参数
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// 读取整数参数
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }
}

/// 动作执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,

    #[serde(default)]
    pub message: String,

    /// 驱动返回的附加数据
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ActionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// 驱动错误
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("驱动调用超时: {0}")]
    Timeout(String),

    /// 暂时性失败，例如界面尚未出现
    #[error("暂时性失败: {0}")]
    Transient(String),

    #[error("驱动拒绝执行: {0}")]
    Rejected(String),

    #[error("连接失败: {0}")]
    Connection(String),
}

impl DriverError {
    /// 是否值得重试
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Timeout(_) | DriverError::Transient(_))
    }
}

/// UI 自动化驱动
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// 驱动名称，用于日志
    fn name(&self) -> &'static str;

    /// 连接设备，确认驱动端点可达
    async fn connect(&self, device: &Device) -> Result<Arc<dyn DriverSession>, DriverError>;
}

/// 已建立的设备会话
#[async_trait]
pub trait DriverSession: Send + Sync {
    /// 以指定账号身份执行一个动作
    async fn run_action(
        &self,
        action: &Action,
        account: &AccountId,
    ) -> Result<ActionResult, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transient_classification() {
        assert!(DriverError::Timeout("t".into()).is_transient());
        assert!(DriverError::Transient("t".into()).is_transient());
        assert!(!DriverError::Rejected("r".into()).is_transient());
        assert!(!DriverError::Connection("c".into()).is_transient());
    }

    #[test]
    fn test_action_params() {
        let action = Action::new("like", json!({ "count": 10, "target": "feed" }));
        assert_eq!(action.param_u64("count"), Some(10));
        assert_eq!(action.param_str("target"), Some("feed"));
        assert_eq!(action.param_str("count"), None);
    }

    #[test]
    fn test_action_result_defaults() {
        let result: ActionResult = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(result.success);
        assert!(result.message.is_empty());
        assert!(result.data.is_null());
    }
}
