//! HTTP 接口
//!
//! 任务提交与查询、Agent 配对与心跳、设备与订阅者状态。

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::farm::broadcast::{FarmSnapshot, SubscriberInfo};
use crate::farm::container::ContainerBinding;
use crate::farm::executor::{AgentRegistration, ConcurrentJobExecutor, JobListing, SubmitRejection};
use crate::farm::heartbeat::{AgentInfo, HeartbeatAck};
use crate::farm::pipeline::{Job, JobRequest};
use crate::farm::pool::{Device, DeviceFilter};
use crate::farm::{DeviceId, JobId};

/// API 响应
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,

    /// 拒绝原因代码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    pub data: Option<T>,
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T>(message: impl Into<String>, data: T) -> ApiResult<T> {
    (
        StatusCode::OK,
        Json(ApiResponse {
            success: true,
            message: message.into(),
            code: None,
            data: Some(data),
        }),
    )
}

fn reject<T>(status: StatusCode, code: &str, message: impl Into<String>) -> ApiResult<T> {
    (
        status,
        Json(ApiResponse {
            success: false,
            message: message.into(),
            code: Some(code.to_string()),
            data: None,
        }),
    )
}

/// 提交拒绝对应的 HTTP 状态码
pub fn rejection_status(rejection: &SubmitRejection) -> StatusCode {
    match rejection {
        SubmitRejection::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SubmitRejection::TemplateNotFound(_) | SubmitRejection::DeviceNotFound => {
            StatusCode::NOT_FOUND
        }
        SubmitRejection::DeviceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        SubmitRejection::DeviceBusy => StatusCode::CONFLICT,
        SubmitRejection::ConcurrencyLimit => StatusCode::TOO_MANY_REQUESTS,
    }
}

/// 提交成功
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

/// 停止结果
#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub job_id: JobId,
    pub stopped: bool,
}

/// 心跳请求
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    #[serde(default)]
    pub device_ids: Vec<DeviceId>,
    /// Agent 本地时间，仅用于日志
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

pub struct ApiServer {
    pub app: Router,
}

impl ApiServer {
    pub fn new(executor: Arc<ConcurrentJobExecutor>) -> Self {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route("/jobs", post(Self::submit_job).get(Self::list_jobs))
            .route("/jobs/{id}", get(Self::get_job))
            .route("/jobs/{id}/stop", post(Self::stop_job))
            .route("/agents", get(Self::list_agents))
            .route("/agents/register", post(Self::register_agent))
            .route("/agents/heartbeat", post(Self::heartbeat))
            .route("/devices", get(Self::list_devices))
            .route("/devices/available", get(Self::list_available))
            .route("/devices/{id}/binding", get(Self::device_binding))
            .route("/snapshot", get(Self::snapshot))
            .route("/subscribers", get(Self::subscribers))
            .layer(cors)
            .with_state(executor);

        ApiServer { app }
    }

    /// 启动 API 服务器，收到关闭信号后优雅退出
    pub async fn run(self, addr: String, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("HTTP 服务器运行在 http://{}", addr);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    }

    /// 提交任务
    async fn submit_job(
        State(executor): State<Arc<ConcurrentJobExecutor>>,
        Json(request): Json<JobRequest>,
    ) -> ApiResult<SubmitResponse> {
        debug!(device_id = %request.device_id, template = %request.template, "收到任务提交请求");

        match executor.submit(request) {
            Ok(job_id) => ok("任务已受理", SubmitResponse { job_id }),
            Err(rejection) => {
                warn!(code = rejection.code(), "任务被拒绝: {}", rejection);
                reject(rejection_status(&rejection), rejection.code(), rejection.to_string())
            }
        }
    }

    /// 在线任务与最近历史
    async fn list_jobs(State(executor): State<Arc<ConcurrentJobExecutor>>) -> ApiResult<JobListing> {
        let listing = executor.list();
        ok(format!("共 {} 个在线任务", listing.active.len()), listing)
    }

    async fn get_job(
        State(executor): State<Arc<ConcurrentJobExecutor>>,
        Path(id): Path<JobId>,
    ) -> ApiResult<Job> {
        match executor.status(id).await {
            Some(job) => ok(job.state.as_str(), job),
            None => reject(StatusCode::NOT_FOUND, "job_not_found", format!("任务不存在: {}", id)),
        }
    }

    async fn stop_job(
        State(executor): State<Arc<ConcurrentJobExecutor>>,
        Path(id): Path<JobId>,
    ) -> ApiResult<StopResponse> {
        if executor.stop(id) {
            return ok("已请求停止", StopResponse { job_id: id, stopped: true });
        }

        match executor.status(id).await {
            Some(job) => reject(
                StatusCode::CONFLICT,
                "job_finished",
                format!("任务已结束: {}", job.state),
            ),
            None => reject(StatusCode::NOT_FOUND, "job_not_found", format!("任务不存在: {}", id)),
        }
    }

    async fn list_agents(State(executor): State<Arc<ConcurrentJobExecutor>>) -> ApiResult<Vec<AgentInfo>> {
        let agents = executor.agents();
        ok(format!("共 {} 个 Agent", agents.len()), agents)
    }

    /// Agent 配对
    async fn register_agent(
        State(executor): State<Arc<ConcurrentJobExecutor>>,
        Json(registration): Json<AgentRegistration>,
    ) -> ApiResult<HeartbeatAck> {
        let agent_id = registration.agent_id.clone();
        match executor.register_agent(registration) {
            Ok(ack) => ok(format!("Agent {} 已配对", agent_id), ack),
            Err(e) => {
                warn!(agent_id = %agent_id, "Agent 配对失败: {}", e);
                let status = StatusCode::from_u16(e.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                reject(status, "invalid_request", e.to_string())
            }
        }
    }

    /// Agent 心跳
    async fn heartbeat(
        State(executor): State<Arc<ConcurrentJobExecutor>>,
        Json(request): Json<HeartbeatRequest>,
    ) -> ApiResult<HeartbeatAck> {
        if let Some(sent_at) = request.timestamp {
            debug!(agent_id = %request.agent_id, %sent_at, "收到心跳");
        }

        let ack = executor.record_heartbeat(&request.agent_id, &request.device_ids);
        if ack.accepted {
            ok("ok", ack)
        } else {
            reject(StatusCode::BAD_REQUEST, "invalid_request", "心跳格式非法")
        }
    }

    async fn list_devices(State(executor): State<Arc<ConcurrentJobExecutor>>) -> ApiResult<Vec<Device>> {
        let devices = executor.pool().list_devices();
        ok(format!("共 {} 个设备", devices.len()), devices)
    }

    async fn list_available(
        State(executor): State<Arc<ConcurrentJobExecutor>>,
        Query(filter): Query<DeviceFilter>,
    ) -> ApiResult<Vec<Device>> {
        let devices = executor.pool().list_available(&filter);
        ok(format!("共 {} 个可用设备", devices.len()), devices)
    }

    /// 设备当前激活的容器
    async fn device_binding(
        State(executor): State<Arc<ConcurrentJobExecutor>>,
        Path(id): Path<DeviceId>,
    ) -> ApiResult<ContainerBinding> {
        match executor.coordinator().binding(&id) {
            Some(binding) => ok(format!("账号 {}", binding.account_id), binding),
            None => reject(
                StatusCode::NOT_FOUND,
                "binding_not_found",
                format!("设备 {} 没有容器绑定", id),
            ),
        }
    }

    async fn snapshot(State(executor): State<Arc<ConcurrentJobExecutor>>) -> ApiResult<FarmSnapshot> {
        ok("ok", executor.snapshot())
    }

    async fn subscribers(
        State(executor): State<Arc<ConcurrentJobExecutor>>,
    ) -> ApiResult<Vec<SubscriberInfo>> {
        ok("ok", executor.broadcaster().subscribers())
    }
}
