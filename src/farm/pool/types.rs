//! 设备池相关的类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::farm::{AgentId, DeviceId, JobId};

/// 自动化驱动的连接端点（Agent 主机、端口、设备序列号）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    pub serial: String,
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.serial)
    }
}

/// Agent 配对时上报的设备描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub device_id: DeviceId,

    /// 硬件标识
    pub hardware_id: String,

    /// ADB 序列号，不填时使用硬件标识
    #[serde(default)]
    pub serial: Option<String>,

    /// 是否支持按账号隔离的应用容器
    #[serde(default)]
    pub supports_containers: bool,
}

/// 设备占用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "job_id", rename_all = "snake_case")]
pub enum Allocation {
    Free,
    Held(JobId),
}

impl Allocation {
    pub fn holder(&self) -> Option<JobId> {
        match self {
            Allocation::Free => None,
            Allocation::Held(job_id) => Some(*job_id),
        }
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Allocation::Free => write!(f, "free"),
            Allocation::Held(job_id) => write!(f, "held-by-job:{}", job_id),
        }
    }
}

/// 设备快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub hardware_id: String,
    pub agent_id: AgentId,
    pub endpoint: DeviceEndpoint,
    pub supports_containers: bool,
    pub allocation: Allocation,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub acquisitions: u64,
    pub releases: u64,
}

#[cfg(test)]
impl Device {
    /// 空闲在线、支持多开的设备
    pub fn idle(id: &str) -> Self {
        Device {
            id: id.to_string(),
            hardware_id: format!("hw-{}", id),
            agent_id: "agent-1".to_string(),
            endpoint: DeviceEndpoint {
                host: "127.0.0.1".to_string(),
                port: 7912,
                serial: id.to_string(),
            },
            supports_containers: true,
            allocation: Allocation::Free,
            online: true,
            last_seen: Utc::now(),
            registered_at: Utc::now(),
            acquisitions: 0,
            releases: 0,
        }
    }
}

/// 申请设备被拒绝的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireRejection {
    NotFound,
    Offline,
    Busy,
}

impl AcquireRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquireRejection::NotFound => "not_found",
            AcquireRejection::Offline => "offline",
            AcquireRejection::Busy => "busy",
        }
    }
}

impl fmt::Display for AcquireRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireRejection::NotFound => write!(f, "设备不存在"),
            AcquireRejection::Offline => write!(f, "设备离线"),
            AcquireRejection::Busy => write!(f, "设备忙碌"),
        }
    }
}

/// 可用设备过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceFilter {
    pub supports_containers: Option<bool>,
    pub agent_id: Option<AgentId>,
}

impl DeviceFilter {
    pub fn matches(&self, device: &Device) -> bool {
        self.supports_containers
            .is_none_or(|wanted| device.supports_containers == wanted)
            && self
                .agent_id
                .as_ref()
                .is_none_or(|agent_id| &device.agent_id == agent_id)
    }
}

/// 设备数量统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounts {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub free: usize,
    pub held: usize,
}
