//! 状态事件定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::farm::pipeline::{FailureReason, Job, JobState};
use crate::farm::{AgentId, DeviceId, JobId};

/// 任务状态变化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusEvent {
    pub job_id: JobId,
    pub device_id: DeviceId,
    pub state: JobState,
    pub progress: u8,
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,

    /// 最近一条错误信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 设备上线 / 离线
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLivenessEvent {
    pub device_id: DeviceId,
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
}

/// 农场汇总快照，供订阅者容忍丢失的事件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FarmSnapshot {
    pub active_count: usize,
    pub online_devices: usize,
    pub offline_devices: usize,
    pub free_devices: usize,
    pub held_devices: usize,
    pub total_devices: usize,
    pub subscribers: usize,
    pub timestamp: DateTime<Utc>,
}

/// 广播的状态事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StatusEvent {
    #[serde(rename = "job.status")]
    JobStatus(JobStatusEvent),

    #[serde(rename = "device.offline")]
    DeviceOffline(DeviceLivenessEvent),

    #[serde(rename = "device.online")]
    DeviceOnline(DeviceLivenessEvent),

    #[serde(rename = "farm.snapshot")]
    Snapshot(FarmSnapshot),
}

impl StatusEvent {
    /// 事件名称，同时用作 Socket.IO 事件名
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::JobStatus(_) => "job.status",
            StatusEvent::DeviceOffline(_) => "device.offline",
            StatusEvent::DeviceOnline(_) => "device.online",
            StatusEvent::Snapshot(_) => "farm.snapshot",
        }
    }

    pub fn job_status(job: &Job) -> Self {
        StatusEvent::JobStatus(JobStatusEvent {
            job_id: job.id,
            device_id: job.device_id.clone(),
            state: job.state,
            progress: job.progress,
            timestamp: Utc::now(),
            reason: job.failure,
            message: job.errors.last().map(|e| e.message.clone()),
        })
    }

    pub fn device_offline(device_id: &str, agent_id: &str) -> Self {
        StatusEvent::DeviceOffline(DeviceLivenessEvent {
            device_id: device_id.to_string(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        })
    }

    pub fn device_online(device_id: &str, agent_id: &str) -> Self {
        StatusEvent::DeviceOnline(DeviceLivenessEvent {
            device_id: device_id.to_string(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        })
    }
}
