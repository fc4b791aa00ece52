//! Agent 心跳模块

mod tracker;

pub use tracker::{AgentHeartbeatTracker, AgentInfo, HeartbeatAck};
