//! 容器切换协调器
//!
//! 只负责检查点的顺序、超时与重试，界面操作全部交给自动化驱动。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::farm::config::ContainerConfig;
use crate::farm::driver::{Action, ActionResult, DriverError, DriverSession};
use crate::farm::pipeline::RetryPolicy;
use crate::farm::{AccountId, DeviceId};

/// 切换检查点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStep {
    /// 打开容器管理界面
    OpenManager,
    /// 选择目标容器
    SelectContainer,
    /// 确认启动
    ConfirmLaunch,
}

impl SwitchStep {
    pub const ALL: [SwitchStep; 3] = [
        SwitchStep::OpenManager,
        SwitchStep::SelectContainer,
        SwitchStep::ConfirmLaunch,
    ];

    /// 发给驱动的动作类型
    pub fn action_kind(&self) -> &'static str {
        match self {
            SwitchStep::OpenManager => "container.open_manager",
            SwitchStep::SelectContainer => "container.select",
            SwitchStep::ConfirmLaunch => "container.confirm_launch",
        }
    }
}

impl fmt::Display for SwitchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action_kind())
    }
}

/// 设备当前激活的容器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerBinding {
    pub device_id: DeviceId,
    pub account_id: AccountId,
    pub container_id: String,
    pub bound_at: DateTime<Utc>,
}

/// 切换成功
#[derive(Debug, Clone)]
pub struct SwitchOutcome {
    pub binding: ContainerBinding,
    /// 本次切换用掉的重试次数
    pub retries: u32,
}

/// 切换失败，只影响当前账号
#[derive(thiserror::Error, Debug, Clone)]
#[error("容器切换在 {step} 失败（尝试 {attempts} 次）: {source}")]
pub struct SwitchError {
    pub step: SwitchStep,
    pub attempts: u32,
    pub retries: u32,
    pub source: DriverError,
}

/// 容器切换协调器
pub struct ContainerSwitchCoordinator {
    step_timeout: Duration,
    retry_delay: Duration,

    /// 一次切换内所有检查点共享的重试次数
    retry_budget: u32,

    /// 每台设备当前的绑定，成功切换后覆盖
    bindings: RwLock<HashMap<DeviceId, ContainerBinding>>,

    /// 已知的 (设备, 账号) → 容器
    known: RwLock<HashMap<(DeviceId, AccountId), String>>,
}

impl ContainerSwitchCoordinator {
    pub fn new(step_timeout: Duration, retry_delay: Duration) -> Self {
        Self {
            step_timeout,
            retry_delay,
            retry_budget: 1,
            bindings: RwLock::new(HashMap::new()),
            known: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ContainerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.step_timeout_secs),
            Duration::from_millis(config.retry_delay_ms),
        )
    }

    /// 设备当前的容器绑定
    pub fn binding(&self, device_id: &str) -> Option<ContainerBinding> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    /// 账号在设备上已知的容器
    pub fn known_container(&self, device_id: &str, account_id: &str) -> Option<String> {
        self.known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(device_id.to_string(), account_id.to_string()))
            .cloned()
    }

    /// 把设备切换到账号对应的容器
    pub async fn switch(
        &self,
        session: &dyn DriverSession,
        device_id: &str,
        account_id: &AccountId,
    ) -> Result<SwitchOutcome, SwitchError> {
        let known = self.known_container(device_id, account_id);
        let mut retries = 0;
        let mut budget = self.retry_budget;
        let mut selected = None;

        for step in SwitchStep::ALL {
            let action = Action::new(
                step.action_kind(),
                json!({ "account": account_id, "container_id": known }),
            );
            let action = &action;

            let attempted = RetryPolicy::new(budget + 1, self.retry_delay)
                .run(
                    || self.run_step(session, step, action, account_id),
                    DriverError::is_transient,
                )
                .await;
            budget -= attempted.retries();
            retries += attempted.retries();

            match attempted.result {
                Ok(result) => {
                    debug!(device_id, account_id = %account_id, %step, "检查点完成");
                    if step == SwitchStep::SelectContainer {
                        selected = result
                            .data
                            .get("container_id")
                            .and_then(|v| v.as_str())
                            .map(str::to_string);
                    }
                }
                Err(source) => {
                    warn!(device_id, account_id = %account_id, %step, "容器切换失败: {}", source);
                    return Err(SwitchError {
                        step,
                        attempts: attempted.attempts,
                        retries,
                        source,
                    });
                }
            }
        }

        let container_id = selected
            .or(known)
            .unwrap_or_else(|| account_id.clone());

        let binding = ContainerBinding {
            device_id: device_id.to_string(),
            account_id: account_id.clone(),
            container_id: container_id.clone(),
            bound_at: Utc::now(),
        };

        self.known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((device_id.to_string(), account_id.clone()), container_id);
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_string(), binding.clone());

        info!(
            device_id,
            account_id = %account_id,
            container_id = %binding.container_id,
            retries,
            "容器切换完成"
        );

        Ok(SwitchOutcome { binding, retries })
    }

    /// 执行单个检查点，超时与“界面未就绪”都视为暂时性失败
    async fn run_step(
        &self,
        session: &dyn DriverSession,
        step: SwitchStep,
        action: &Action,
        account_id: &AccountId,
    ) -> Result<ActionResult, DriverError> {
        match tokio::time::timeout(self.step_timeout, session.run_action(action, account_id)).await
        {
            Ok(Ok(result)) if result.success => Ok(result),
            Ok(Ok(result)) => Err(DriverError::Transient(format!(
                "检查点 {} 未就绪: {}",
                step, result.message
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DriverError::Timeout(format!(
                "检查点 {} 超时（{:?}）",
                step, self.step_timeout
            ))),
        }
    }
}
