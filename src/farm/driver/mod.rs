//! UI 自动化驱动模块
//!
//! 编排层只把驱动当作带超时的 RPC 边界，不解释动作的具体含义。

mod adb;
mod http;
mod scripted;
mod traits;

pub use scripted::ScriptedDriver;
pub use traits::{Action, ActionResult, AutomationDriver, DriverError, DriverSession};

use std::sync::Arc;
use std::time::Duration;

use adb::AdbDriver;
use http::HttpAgentDriver;

use crate::farm::config::{DriverConfig, DriverKind};

/// 按配置创建驱动
pub fn create_driver(config: &DriverConfig) -> Result<Arc<dyn AutomationDriver>, DriverError> {
    let driver: Arc<dyn AutomationDriver> = match config.kind {
        DriverKind::Http => Arc::new(HttpAgentDriver::new(Duration::from_secs(
            config.request_timeout_secs,
        ))?),
        DriverKind::Adb => Arc::new(AdbDriver::new()),
        DriverKind::Scripted => Arc::new(ScriptedDriver::new()),
    };
    Ok(driver)
}
