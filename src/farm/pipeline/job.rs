use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use super::state::{FailureReason, JobState};
use crate::farm::{AccountId, DeviceId, JobId};

/// 任务提交请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub device_id: DeviceId,
    pub account_ids: Vec<AccountId>,

    /// 模板名称
    #[serde(alias = "template_ref")]
    pub template: String,
}

/// 单个账号的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountResult {
    pub account_id: AccountId,
    pub success: bool,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,

    pub actions_run: usize,
    pub actions_failed: usize,
}

/// 任务执行过程中记录的错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub stage: JobState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,

    pub message: String,
    pub at: DateTime<Utc>,
}

/// 任务快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub device_id: DeviceId,
    pub account_ids: Vec<AccountId>,
    pub template: String,

    pub state: JobState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,

    /// 0 - 100
    pub progress: u8,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub results: Vec<AccountResult>,
    pub errors: Vec<JobError>,

    /// 各阶段的重试次数
    pub retries: BTreeMap<JobState, u32>,
}

impl Job {
    pub fn new(id: JobId, request: JobRequest) -> Self {
        Self {
            id,
            device_id: request.device_id,
            account_ids: request.account_ids,
            template: request.template,
            state: JobState::Pending,
            failure: None,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            results: Vec::new(),
            errors: Vec::new(),
            retries: BTreeMap::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 失败的账号数
    pub fn failed_accounts(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }
}

/// 任务的控制信号
#[derive(Debug, Clone, Default)]
pub struct JobControl {
    /// 协作式停止，在账号之间的检查点生效
    pub stop: CancellationToken,

    /// 设备离线，立即中止当前阶段
    pub lost: CancellationToken,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }
}
