//! 设备条目实现
//!
//! 表示池中的单个设备及其占用状态

use chrono::{DateTime, Utc};

use crate::farm::pool::types::{Allocation, Device, DeviceEndpoint, DeviceSpec};
use crate::farm::{AgentId, DeviceId, JobId};

/// 设备条目
pub struct DeviceEntry {
    pub id: DeviceId,
    pub hardware_id: String,

    /// 所属 Agent
    pub agent_id: AgentId,

    pub endpoint: DeviceEndpoint,
    pub supports_containers: bool,

    /// 当前占用状态，只能通过设备池的 acquire / release 修改
    pub allocation: Allocation,

    /// 最后一次随心跳上报的时间
    pub last_seen: DateTime<Utc>,

    /// 注册时间
    pub registered_at: DateTime<Utc>,

    pub acquisitions: u64,
    pub releases: u64,
}

impl DeviceEntry {
    /// 创建新的设备条目
    pub fn new(spec: DeviceSpec, agent_id: AgentId, host: &str, port: u16) -> Self {
        let now = Utc::now();
        let serial = spec.serial.unwrap_or_else(|| spec.hardware_id.clone());
        Self {
            id: spec.device_id,
            hardware_id: spec.hardware_id,
            agent_id,
            endpoint: DeviceEndpoint {
                host: host.to_string(),
                port,
                serial,
            },
            supports_containers: spec.supports_containers,
            allocation: Allocation::Free,
            last_seen: now,
            registered_at: now,
            acquisitions: 0,
            releases: 0,
        }
    }

    /// 重新配对时刷新端点与能力，保留占用状态
    pub fn refresh(&mut self, spec: DeviceSpec, agent_id: AgentId, host: &str, port: u16) {
        self.endpoint = DeviceEndpoint {
            host: host.to_string(),
            port,
            serial: spec.serial.unwrap_or_else(|| spec.hardware_id.clone()),
        };
        self.hardware_id = spec.hardware_id;
        self.supports_containers = spec.supports_containers;
        self.agent_id = agent_id;
        self.touch();
    }

    /// 更新最后在线时间
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn is_free(&self) -> bool {
        self.allocation == Allocation::Free
    }

    /// 标记为被任务占用
    pub fn hold(&mut self, job_id: JobId) {
        self.allocation = Allocation::Held(job_id);
        self.acquisitions += 1;
    }

    /// 释放占用，返回是否发生了 held → free 的变化
    pub fn free(&mut self) -> bool {
        if self.is_free() {
            return false;
        }
        self.allocation = Allocation::Free;
        self.releases += 1;
        true
    }

    /// 获取设备快照
    pub fn to_device(&self, online: bool) -> Device {
        Device {
            id: self.id.clone(),
            hardware_id: self.hardware_id.clone(),
            agent_id: self.agent_id.clone(),
            endpoint: self.endpoint.clone(),
            supports_containers: self.supports_containers,
            allocation: self.allocation,
            online,
            last_seen: self.last_seen,
            registered_at: self.registered_at,
            acquisitions: self.acquisitions,
            releases: self.releases,
        }
    }
}
