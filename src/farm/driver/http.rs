//! 基于 Agent HTTP 接口的驱动
//!
//! 设备所在的 Agent 暴露 `GET /health` 与 `POST /devices/{serial}/actions`。

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::traits::{Action, ActionResult, AutomationDriver, DriverError, DriverSession};
use crate::farm::AccountId;
use crate::farm::pool::Device;

/// HTTP 驱动
pub struct HttpAgentDriver {
    client: Client,
}

impl HttpAgentDriver {
    /// 创建新的 HTTP 驱动
    pub fn new(request_timeout: Duration) -> Result<Self, DriverError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DriverError::Connection(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl AutomationDriver for HttpAgentDriver {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn connect(&self, device: &Device) -> Result<Arc<dyn DriverSession>, DriverError> {
        let base_url = format!("http://{}:{}", device.endpoint.host, device.endpoint.port);
        let url = format!("{}/health", base_url);

        debug!(device_id = %device.id, url = %url, "检查 Agent 端点");

        let response = self.client.get(&url).send().await.map_err(map_send_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status, "Agent 健康检查失败".to_string()));
        }

        Ok(Arc::new(HttpSession {
            client: self.client.clone(),
            actions_url: format!("{}/devices/{}/actions", base_url, device.endpoint.serial),
        }))
    }
}

/// 动作请求体
#[derive(Serialize)]
struct ActionRequest<'a> {
    action: &'a Action,
    account: &'a str,
}

struct HttpSession {
    client: Client,
    actions_url: String,
}

#[async_trait]
impl DriverSession for HttpSession {
    async fn run_action(
        &self,
        action: &Action,
        account: &AccountId,
    ) -> Result<ActionResult, DriverError> {
        let response = self
            .client
            .post(&self.actions_url)
            .json(&ActionRequest { action, account })
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DriverError::Transient(format!("读取响应失败: {}", e)))?;

        if !status.is_success() {
            error!(kind = %action.kind, account, %status, "动作请求失败: {}", body);
            return Err(map_status(status, body));
        }

        serde_json::from_str(&body)
            .map_err(|e| DriverError::Rejected(format!("解析响应失败: {}", e)))
    }
}

fn map_send_error(e: reqwest::Error) -> DriverError {
    if e.is_timeout() {
        DriverError::Timeout(e.to_string())
    } else if e.is_connect() {
        DriverError::Connection(e.to_string())
    } else {
        DriverError::Transient(e.to_string())
    }
}

fn map_status(status: StatusCode, body: String) -> DriverError {
    let message = format!("{} - {}", status, body);
    match status {
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::BAD_GATEWAY
        | StatusCode::CONFLICT => DriverError::Transient(message),
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => DriverError::Timeout(message),
        _ => DriverError::Rejected(message),
    }
}
