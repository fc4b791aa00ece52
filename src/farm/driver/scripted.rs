//! 进程内脚本驱动
//!
//! 按账号与动作类型预先设定结果，可注入延迟与失败，用于演练和测试。

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::traits::{Action, ActionResult, AutomationDriver, DriverError, DriverSession};
use crate::farm::pool::Device;
use crate::farm::{AccountId, DeviceId};

/// 驱动收到的一次调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCall {
    pub device_id: DeviceId,
    pub account: AccountId,
    pub kind: String,
}

#[derive(Default)]
struct Script {
    connect_delay: Duration,
    connect_error: Option<DriverError>,
    action_delay: Duration,
    /// 剩余的暂时性失败次数（打开容器管理界面）
    flaky_switches: HashMap<AccountId, u32>,
    /// 确认启动时界面尚未就绪的剩余次数
    unready_confirms: HashMap<AccountId, u32>,
    /// 选择容器总是被拒绝
    broken_switches: HashSet<AccountId>,
    /// 打开容器管理界面时卡住
    stalled_switches: HashSet<AccountId>,
    failing_actions: HashSet<(AccountId, String)>,
    calls: Vec<ScriptedCall>,
}

/// 脚本驱动
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
impl ScriptedDriver {
    /// 连接耗时
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.script().connect_delay = delay;
        self
    }

    /// 连接失败
    pub fn with_connect_error(self, error: DriverError) -> Self {
        self.script().connect_error = Some(error);
        self
    }

    /// 每个动作（含容器检查点）的耗时
    pub fn with_action_delay(self, delay: Duration) -> Self {
        self.script().action_delay = delay;
        self
    }

    /// 账号的容器切换先暂时性失败 `times` 次
    pub fn with_flaky_switch(self, account: &str, times: u32) -> Self {
        self.script().flaky_switches.insert(account.to_string(), times);
        self
    }

    /// 账号确认启动时先返回 `times` 次未就绪
    pub fn with_unready_confirm(self, account: &str, times: u32) -> Self {
        self.script().unready_confirms.insert(account.to_string(), times);
        self
    }

    /// 账号的容器切换总是失败
    pub fn with_broken_switch(self, account: &str) -> Self {
        self.script().broken_switches.insert(account.to_string());
        self
    }

    /// 账号的容器切换在第一个检查点卡住
    pub fn with_stalled_switch(self, account: &str) -> Self {
        self.script().stalled_switches.insert(account.to_string());
        self
    }

    /// 账号执行指定类型的动作时返回失败结果
    pub fn with_failing_action(self, account: &str, kind: &str) -> Self {
        self.script()
            .failing_actions
            .insert((account.to_string(), kind.to_string()));
        self
    }

    /// 已收到的全部调用
    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.script().calls.clone()
    }

    /// 指定账号收到的动作类型
    pub fn kinds_for(&self, account: &str) -> Vec<String> {
        self.script()
            .calls
            .iter()
            .filter(|call| call.account == account)
            .map(|call| call.kind.clone())
            .collect()
    }
}

#[async_trait]
impl AutomationDriver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self, device: &Device) -> Result<Arc<dyn DriverSession>, DriverError> {
        let (delay, error) = {
            let script = self.script();
            (script.connect_delay, script.connect_error.clone())
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = error {
            return Err(error);
        }

        debug!(device_id = %device.id, "脚本驱动已连接");
        Ok(Arc::new(ScriptedSession {
            device_id: device.id.clone(),
            driver: self.clone(),
        }))
    }
}

/// 单次调用的预定结果
enum Outcome {
    Done(Result<ActionResult, DriverError>),
    Stall,
}

struct ScriptedSession {
    device_id: DeviceId,
    driver: ScriptedDriver,
}

impl ScriptedSession {
    fn decide(&self, action: &Action, account: &AccountId) -> (Duration, Outcome) {
        let mut script = self.driver.script();
        let call = ScriptedCall {
            device_id: self.device_id.clone(),
            account: account.clone(),
            kind: action.kind.clone(),
        };
        debug!(device_id = %call.device_id, account = %call.account, kind = %call.kind, "脚本驱动收到动作");
        script.calls.push(call);

        let outcome = match action.kind.as_str() {
            "container.open_manager" if script.stalled_switches.contains(account) => Outcome::Stall,
            "container.open_manager" => match script.flaky_switches.get_mut(account) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Outcome::Done(Err(DriverError::Transient("容器管理界面尚未出现".into())))
                }
                _ => Outcome::Done(Ok(ActionResult::success("容器管理界面已打开"))),
            },
            "container.select" if script.broken_switches.contains(account) => {
                Outcome::Done(Err(DriverError::Rejected(format!("找不到账号 {} 的容器", account))))
            }
            "container.select" => {
                let container_id = action
                    .param_str("container_id")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("ctr-{}", account));
                Outcome::Done(Ok(ActionResult::success("已选择容器")
                    .with_data(json!({ "container_id": container_id }))))
            }
            "container.confirm_launch" => match script.unready_confirms.get_mut(account) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Outcome::Done(Ok(ActionResult::failure("启动确认框尚未出现")))
                }
                _ => Outcome::Done(Ok(ActionResult::success("已确认启动"))),
            },
            kind if script.failing_actions.contains(&(account.clone(), kind.to_string())) => {
                Outcome::Done(Ok(ActionResult::failure(format!("动作 {} 执行失败", kind))))
            }
            kind => Outcome::Done(Ok(ActionResult::success(format!("动作 {} 完成", kind)))),
        };

        (script.action_delay, outcome)
    }
}

#[async_trait]
impl DriverSession for ScriptedSession {
    async fn run_action(
        &self,
        action: &Action,
        account: &AccountId,
    ) -> Result<ActionResult, DriverError> {
        let (delay, outcome) = self.decide(action, account);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            Outcome::Done(result) => result,
            Outcome::Stall => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(DriverError::Timeout("脚本驱动卡住".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_switch_recovers() {
        let driver = ScriptedDriver::new().with_flaky_switch("A1", 1);
        let session = driver.connect(&Device::idle("D1")).await.unwrap();
        let open = Action::new("container.open_manager", serde_json::Value::Null);
        let account = "A1".to_string();

        assert!(session.run_action(&open, &account).await.unwrap_err().is_transient());
        assert!(session.run_action(&open, &account).await.unwrap().success);
        assert_eq!(driver.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_select_returns_container_id() {
        let driver = ScriptedDriver::new();
        let session = driver.connect(&Device::idle("D1")).await.unwrap();
        let select = Action::new("container.select", json!({ "account": "A1" }));

        let result = session.run_action(&select, &"A1".to_string()).await.unwrap();
        assert_eq!(result.data["container_id"], "ctr-A1");
    }

    #[tokio::test]
    async fn test_failing_action_and_connect_error() {
        let driver = ScriptedDriver::new().with_failing_action("A2", "like");
        let session = driver.connect(&Device::idle("D1")).await.unwrap();
        let like = Action::new("like", json!({}));

        assert!(session.run_action(&like, &"A1".to_string()).await.unwrap().success);
        assert!(!session.run_action(&like, &"A2".to_string()).await.unwrap().success);
        assert_eq!(driver.kinds_for("A2"), vec!["like"]);

        let broken = ScriptedDriver::new().with_connect_error(DriverError::Connection("refused".into()));
        assert!(broken.connect(&Device::idle("D1")).await.is_err());
    }
}
