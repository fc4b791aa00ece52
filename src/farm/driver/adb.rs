//! 基于本机 ADB 的驱动
//!
//! 设备序列号需已连接到本机 ADB Server，动作被翻译为 `adb shell` 命令。

use adb_client::server::ADBServer;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{Action, ActionResult, AutomationDriver, DriverError, DriverSession};
use crate::farm::AccountId;
use crate::farm::pool::Device;

/// ADB 驱动
pub struct AdbDriver;

impl AdbDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AdbDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AutomationDriver for AdbDriver {
    fn name(&self) -> &'static str {
        "adb"
    }

    async fn connect(&self, device: &Device) -> Result<Arc<dyn DriverSession>, DriverError> {
        let serial = device.endpoint.serial.clone();

        // adb_client 是同步接口
        let wanted_serial = serial.clone();
        let state = tokio::task::spawn_blocking(move || {
            let mut server = ADBServer::default();
            server
                .devices()
                .map(|devices| {
                    devices
                        .into_iter()
                        .find(|d| d.identifier == wanted_serial)
                        .map(|d| d.state.to_string())
                })
                .map_err(|e| DriverError::Connection(format!("获取 ADB 设备列表失败: {:?}", e)))
        })
        .await
        .map_err(|e| DriverError::Connection(format!("ADB 查询任务失败: {}", e)))??;

        match state {
            Some(state) if state.eq_ignore_ascii_case("device") => {
                info!(device_id = %device.id, serial = %serial, "ADB 设备已就绪");
                Ok(Arc::new(AdbSession { serial }))
            }
            Some(state) => Err(DriverError::Transient(format!(
                "ADB 设备 {} 状态异常: {}",
                serial, state
            ))),
            None => Err(DriverError::Connection(format!("ADB 设备未连接: {}", serial))),
        }
    }
}

struct AdbSession {
    serial: String,
}

impl AdbSession {
    /// 执行 ADB shell 命令
    async fn shell(&self, command: &str) -> Result<String, DriverError> {
        debug!("执行 ADB 命令: adb -s {} shell {}", self.serial, command);

        let output = tokio::process::Command::new("adb")
            .args(["-s", &self.serial, "shell", command])
            .output()
            .await
            .map_err(|e| DriverError::Connection(format!("执行命令失败: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::Transient(format!("命令执行失败: {}", stderr.trim())));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// 把动作翻译为 shell 命令；`wait` 返回 None
fn shell_command(action: &Action) -> Result<Option<String>, DriverError> {
    let missing = |name: &str| DriverError::Rejected(format!("动作 {} 缺少参数 {}", action.kind, name));

    let command = match action.kind.as_str() {
        "shell" => action.param_str("command").ok_or_else(|| missing("command"))?.to_string(),
        "launch" => {
            let package = action.param_str("package").ok_or_else(|| missing("package"))?;
            format!("monkey -p {} -c android.intent.category.LAUNCHER 1", package)
        }
        "tap" => {
            let x = action.param_u64("x").ok_or_else(|| missing("x"))?;
            let y = action.param_u64("y").ok_or_else(|| missing("y"))?;
            format!("input tap {} {}", x, y)
        }
        "swipe" => {
            let coords: Vec<u64> = ["x1", "y1", "x2", "y2"]
                .iter()
                .map(|k| action.param_u64(k).ok_or_else(|| missing(k)))
                .collect::<Result<_, _>>()?;
            let duration = action.param_u64("duration_ms").unwrap_or(300);
            format!(
                "input swipe {} {} {} {} {}",
                coords[0], coords[1], coords[2], coords[3], duration
            )
        }
        "text" => {
            let text = action.param_str("text").ok_or_else(|| missing("text"))?;
            format!("input text '{}'", text.replace(' ', "%s").replace('\'', ""))
        }
        "key" => {
            let keycode = action.param_u64("keycode").ok_or_else(|| missing("keycode"))?;
            format!("input keyevent {}", keycode)
        }
        "back" => "input keyevent 4".to_string(),
        "home" => "input keyevent 3".to_string(),
        "wait" => return Ok(None),
        other => {
            return Err(DriverError::Rejected(format!("ADB 驱动不支持的动作: {}", other)));
        }
    };

    Ok(Some(command))
}

#[async_trait]
impl DriverSession for AdbSession {
    async fn run_action(
        &self,
        action: &Action,
        account: &AccountId,
    ) -> Result<ActionResult, DriverError> {
        match shell_command(action)? {
            Some(command) => {
                let output = self.shell(&command).await?;
                debug!(account = %account, kind = %action.kind, "ADB 动作完成");
                Ok(ActionResult::success(output))
            }
            None => {
                let ms = action.param_u64("ms").unwrap_or(1000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ActionResult::success(format!("等待 {}ms", ms)))
            }
        }
    }
}
