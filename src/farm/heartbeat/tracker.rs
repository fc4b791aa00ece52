//! Agent 心跳跟踪
//!
//! 记录远程 Agent 的心跳时间，按 TTL 推导其名下设备的在线状态。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::farm::config::HeartbeatConfig;
use crate::farm::{AgentId, DeviceId, is_valid_id};

/// 单个 Agent 的心跳记录
struct AgentRecord {
    host: Option<String>,
    port: Option<u16>,
    devices: BTreeSet<DeviceId>,
    last_heartbeat: Instant,
    last_heartbeat_at: DateTime<Utc>,
    /// 已被扫描标记为离线（每次离线只上报一次）
    offline: bool,
}

#[derive(Default)]
struct TrackerState {
    agents: HashMap<AgentId, AgentRecord>,
    owners: HashMap<DeviceId, AgentId>,
}

/// Agent 信息快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub devices: Vec<DeviceId>,
    pub last_heartbeat: DateTime<Utc>,
    pub online: bool,
}

/// 心跳处理结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub accepted: bool,
    /// 因本次心跳重新上线的设备
    pub recovered: Vec<DeviceId>,
}

impl HeartbeatAck {
    fn rejected() -> Self {
        Self::default()
    }
}

/// 扫描发现的离线设备
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineDevice {
    pub device_id: DeviceId,
    pub agent_id: AgentId,
}

/// Agent 心跳跟踪器
pub struct AgentHeartbeatTracker {
    ttl: Duration,
    state: RwLock<TrackerState>,
}

impl AgentHeartbeatTracker {
    /// 创建新的心跳跟踪器
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(TrackerState::default()),
        }
    }

    pub fn from_config(config: &HeartbeatConfig) -> Self {
        Self::new(config.ttl())
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Agent 配对，记录其地址并视为一次心跳
    pub fn register_agent(
        &self,
        agent_id: &str,
        host: &str,
        port: u16,
        device_ids: &[DeviceId],
    ) -> HeartbeatAck {
        let ack = self.record_heartbeat(agent_id, device_ids);
        if ack.accepted {
            let mut state = self.write();
            if let Some(record) = state.agents.get_mut(agent_id) {
                record.host = Some(host.to_string());
                record.port = Some(port);
            }
            info!(agent_id, host, port, devices = device_ids.len(), "Agent 已配对");
        }
        ack
    }

    /// 记录心跳，更新 Agent 及其设备的最后在线时间
    ///
    /// 非法输入会被忽略并记录警告，不会返回错误。
    pub fn record_heartbeat(&self, agent_id: &str, device_ids: &[DeviceId]) -> HeartbeatAck {
        if !is_valid_id(agent_id) {
            warn!(agent_id, "忽略非法的心跳: Agent ID 非法");
            return HeartbeatAck::rejected();
        }

        if let Some(bad) = device_ids.iter().find(|id| !is_valid_id(id)) {
            warn!(agent_id, device_id = %bad, "忽略非法的心跳: 设备 ID 非法");
            return HeartbeatAck::rejected();
        }

        let now = Instant::now();
        let mut state = self.write();
        let state = &mut *state;

        // 设备可能从其它 Agent 迁移过来
        for device_id in device_ids {
            if let Some(previous) = state.owners.insert(device_id.clone(), agent_id.to_string()) {
                if previous != agent_id {
                    debug!(device_id = %device_id, from = %previous, to = agent_id, "设备归属 Agent 变更");
                    if let Some(record) = state.agents.get_mut(&previous) {
                        record.devices.remove(device_id);
                    }
                }
            }
        }

        let record = state
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                debug!(agent_id, "首次收到 Agent 心跳");
                AgentRecord {
                    host: None,
                    port: None,
                    devices: BTreeSet::new(),
                    last_heartbeat: now,
                    last_heartbeat_at: Utc::now(),
                    offline: false,
                }
            });

        let mut recovered = Vec::new();
        if record.offline {
            info!(agent_id, "Agent 恢复在线");
            recovered.extend(device_ids.iter().cloned());
        }

        record.devices.extend(device_ids.iter().cloned());
        record.last_heartbeat = now;
        record.last_heartbeat_at = Utc::now();
        record.offline = false;

        HeartbeatAck {
            accepted: true,
            recovered,
        }
    }

    /// 设备所属 Agent 的最后心跳是否仍在 TTL 内
    pub fn is_online(&self, device_id: &str) -> bool {
        let state = self.read();
        state
            .owners
            .get(device_id)
            .and_then(|agent_id| state.agents.get(agent_id))
            .is_some_and(|record| record.last_heartbeat.elapsed() <= self.ttl)
    }

    /// 扫描超时的 Agent，返回本轮新变为离线的设备
    pub fn sweep(&self) -> Vec<OfflineDevice> {
        let mut state = self.write();
        let mut offline = Vec::new();

        for (agent_id, record) in state.agents.iter_mut() {
            if record.offline || record.last_heartbeat.elapsed() <= self.ttl {
                continue;
            }

            record.offline = true;
            warn!(
                agent_id = %agent_id,
                devices = record.devices.len(),
                "Agent 心跳超时，标记为离线"
            );

            offline.extend(record.devices.iter().map(|device_id| OfflineDevice {
                device_id: device_id.clone(),
                agent_id: agent_id.clone(),
            }));
        }

        offline
    }

    /// 所有 Agent 的快照
    pub fn agents(&self) -> Vec<AgentInfo> {
        let state = self.read();
        let mut agents: Vec<AgentInfo> = state
            .agents
            .iter()
            .map(|(agent_id, record)| AgentInfo {
                agent_id: agent_id.clone(),
                host: record.host.clone(),
                port: record.port,
                devices: record.devices.iter().cloned().collect(),
                last_heartbeat: record.last_heartbeat_at,
                online: record.last_heartbeat.elapsed() <= self.ttl,
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<DeviceId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_online_within_ttl() {
        let tracker = AgentHeartbeatTracker::new(Duration::from_secs(10));
        let ack = tracker.record_heartbeat("agent-1", &ids(&["D1", "D2"]));

        assert!(ack.accepted);
        assert!(tracker.is_online("D1"));
        assert!(tracker.is_online("D2"));
        assert!(!tracker.is_online("D3"));
    }

    #[test]
    fn test_malformed_heartbeat_ignored() {
        let tracker = AgentHeartbeatTracker::new(Duration::from_secs(10));

        assert!(!tracker.record_heartbeat("", &ids(&["D1"])).accepted);
        assert!(!tracker.record_heartbeat("agent-1", &ids(&["bad id"])).accepted);
        assert!(!tracker.is_online("D1"));
        assert!(tracker.agents().is_empty());
    }

    #[test]
    fn test_offline_after_ttl() {
        let tracker = AgentHeartbeatTracker::new(Duration::from_millis(30));
        tracker.record_heartbeat("agent-1", &ids(&["D1"]));

        std::thread::sleep(Duration::from_millis(60));

        assert!(!tracker.is_online("D1"));
        assert!(!tracker.agents()[0].online);
    }

    #[test]
    fn test_sweep_reports_each_offline_episode_once() {
        let tracker = AgentHeartbeatTracker::new(Duration::from_millis(30));
        tracker.record_heartbeat("agent-1", &ids(&["D1", "D2"]));
        tracker.record_heartbeat("agent-2", &ids(&["D3"]));

        assert!(tracker.sweep().is_empty());

        std::thread::sleep(Duration::from_millis(60));
        tracker.record_heartbeat("agent-2", &ids(&["D3"]));

        let offline = tracker.sweep();
        assert_eq!(offline.len(), 2);
        assert!(offline.iter().all(|d| d.agent_id == "agent-1"));
        assert!(tracker.sweep().is_empty());

        // 重新上报后恢复在线，并在下一次超时时再次上报
        let ack = tracker.record_heartbeat("agent-1", &ids(&["D1", "D2"]));
        assert_eq!(ack.recovered, ids(&["D1", "D2"]));
        assert!(tracker.is_online("D1"));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(tracker.sweep().len(), 3);
    }

    #[test]
    fn test_device_moves_between_agents() {
        let tracker = AgentHeartbeatTracker::new(Duration::from_millis(200));
        tracker.record_heartbeat("agent-1", &ids(&["D1"]));
        tracker.record_heartbeat("agent-2", &ids(&["D1"]));

        let agents = tracker.agents();
        assert!(agents[0].devices.is_empty());
        assert_eq!(agents[1].devices, ids(&["D1"]));

        // agent-1 超时不应影响已迁移的设备
        std::thread::sleep(Duration::from_millis(120));
        tracker.record_heartbeat("agent-2", &ids(&["D1"]));
        std::thread::sleep(Duration::from_millis(120));
        assert!(tracker.is_online("D1"));
    }

    #[test]
    fn test_register_agent_records_endpoint() {
        let tracker = AgentHeartbeatTracker::new(Duration::from_secs(10));
        let ack = tracker.register_agent("agent-1", "10.0.0.5", 7912, &ids(&["D1"]));

        assert!(ack.accepted);
        let agents = tracker.agents();
        assert_eq!(agents[0].host.as_deref(), Some("10.0.0.5"));
        assert_eq!(agents[0].port, Some(7912));
        assert!(agents[0].online);
    }
}
