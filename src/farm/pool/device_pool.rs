//! 设备池实现
//!
//! 设备注册表与独占使用状态的唯一权威来源

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::device_entry::DeviceEntry;
use super::types::{AcquireRejection, Device, DeviceFilter, DeviceSpec, PoolCounts};
use crate::error::AppError;
use crate::farm::heartbeat::AgentHeartbeatTracker;
use crate::farm::{DeviceId, JobId, is_valid_id};

/// 设备池
pub struct DevicePool {
    /// 设备映射表
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,

    /// 心跳跟踪器，离线设备不参与分配
    heartbeat: Arc<AgentHeartbeatTracker>,
}

impl DevicePool {
    /// 创建新的设备池
    pub fn new(heartbeat: Arc<AgentHeartbeatTracker>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            heartbeat,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<DeviceId, DeviceEntry>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<DeviceId, DeviceEntry>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册设备，已存在时刷新端点与能力（不影响占用状态）
    ///
    /// 返回 true 表示新建了设备。
    pub fn register_device(
        &self,
        spec: DeviceSpec,
        agent_id: &str,
        host: &str,
        port: u16,
    ) -> Result<bool, AppError> {
        if !is_valid_id(&spec.device_id) {
            return Err(AppError::InvalidInput(format!("设备 ID 非法: {}", spec.device_id)));
        }

        let mut devices = self.write();
        let device_id = spec.device_id.clone();

        if let Some(entry) = devices.get_mut(&device_id) {
            entry.refresh(spec, agent_id.to_string(), host, port);
            debug!(device_id = %device_id, agent_id, "设备信息已刷新");
            return Ok(false);
        }

        let entry = DeviceEntry::new(spec, agent_id.to_string(), host, port);
        info!(
            device_id = %device_id,
            agent_id,
            endpoint = %entry.endpoint,
            containers = entry.supports_containers,
            "设备已注册"
        );
        devices.insert(device_id, entry);
        Ok(true)
    }

    /// 原子地检查并占用设备
    ///
    /// 只有设备存在、在线且空闲时才会成功；成功后返回的租约在离开作用域时释放设备。
    pub fn try_acquire(
        self: &Arc<Self>,
        device_id: &str,
        job_id: JobId,
    ) -> Result<DeviceLease, AcquireRejection> {
        let mut devices = self.write();

        let entry = devices
            .get_mut(device_id)
            .ok_or(AcquireRejection::NotFound)?;

        let online = self.heartbeat.is_online(device_id);
        if !online {
            return Err(AcquireRejection::Offline);
        }

        if !entry.is_free() {
            return Err(AcquireRejection::Busy);
        }

        entry.hold(job_id);
        debug!(device_id, job_id = %job_id, "设备已被占用");

        Ok(DeviceLease {
            pool: Arc::clone(self),
            device: entry.to_device(online),
            job_id,
        })
    }

    /// 无条件释放设备，重复释放是空操作
    ///
    /// 返回 true 表示发生了 held → free 的变化。
    pub fn release(&self, device_id: &str) -> bool {
        let mut devices = self.write();
        let released = devices
            .get_mut(device_id)
            .is_some_and(|entry| entry.free());

        if released {
            debug!(device_id, "设备已释放");
        }
        released
    }

    /// 提交任务前的快速检查：设备存在且在线（不检查占用）
    pub fn check_admissible(&self, device_id: &str) -> Result<(), AcquireRejection> {
        let devices = self.read();
        if !devices.contains_key(device_id) {
            return Err(AcquireRejection::NotFound);
        }
        if !self.heartbeat.is_online(device_id) {
            return Err(AcquireRejection::Offline);
        }
        Ok(())
    }

    /// 随心跳更新设备的最后在线时间
    pub fn mark_seen(&self, device_ids: &[DeviceId]) {
        let mut devices = self.write();
        for device_id in device_ids {
            if let Some(entry) = devices.get_mut(device_id) {
                entry.touch();
            }
        }
    }

    /// 设备离线，返回当前占用它的任务
    pub fn mark_offline(&self, device_id: &str) -> Option<JobId> {
        let devices = self.read();
        let holder = devices.get(device_id)?.allocation.holder();
        match holder {
            Some(job_id) => warn!(device_id, job_id = %job_id, "占用中的设备离线"),
            None => info!(device_id, "空闲设备离线，暂停分配"),
        }
        holder
    }

    /// 当前占用设备的任务
    pub fn holder(&self, device_id: &str) -> Option<JobId> {
        self.read().get(device_id)?.allocation.holder()
    }

    /// 获取设备详细信息
    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.read()
            .get(device_id)
            .map(|entry| entry.to_device(self.heartbeat.is_online(device_id)))
    }

    /// 获取所有设备详细信息
    pub fn list_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .read()
            .values()
            .map(|entry| entry.to_device(self.heartbeat.is_online(&entry.id)))
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// 在线且空闲的设备快照，仅用于容量展示，分配必须走 try_acquire
    pub fn list_available(&self, filter: &DeviceFilter) -> Vec<Device> {
        self.list_devices()
            .into_iter()
            .filter(|device| device.online && device.allocation.holder().is_none())
            .filter(|device| filter.matches(device))
            .collect()
    }

    /// 设备数量统计
    pub fn counts(&self) -> PoolCounts {
        let devices = self.read();
        let mut counts = PoolCounts {
            total: devices.len(),
            ..Default::default()
        };

        for entry in devices.values() {
            if self.heartbeat.is_online(&entry.id) {
                counts.online += 1;
            } else {
                counts.offline += 1;
            }
            if entry.is_free() {
                counts.free += 1;
            } else {
                counts.held += 1;
            }
        }

        counts
    }
}

/// 设备租约
///
/// 设备在租约被丢弃时释放，任务的任何退出路径都只经过这一处。
pub struct DeviceLease {
    pool: Arc<DevicePool>,
    device: Device,
    job_id: JobId,
}

impl DeviceLease {
    /// 占用时的设备快照
    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        // 设备可能已被强制释放并由其他任务占用
        if self.pool.holder(&self.device.id) != Some(self.job_id) {
            warn!(device_id = %self.device.id, job_id = %self.job_id, "租约结束时设备已不再由该任务占用");
            return;
        }

        if self.pool.release(&self.device.id) {
            debug!(device_id = %self.device.id, job_id = %self.job_id, "租约结束，设备已释放");
        }
    }
}
