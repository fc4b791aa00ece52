//! 设备农场编排模块
//!
//! 接收自动化任务、独占绑定设备、按阶段驱动任务执行，并实时广播状态变化。

pub mod api;
pub mod broadcast;
pub mod config;
pub mod container;
pub mod driver;
pub mod executor;
pub mod heartbeat;
pub mod pipeline;
pub mod pool;
pub mod template;

use regex::Regex;
use std::sync::LazyLock;

/// 设备 ID
pub type DeviceId = String;

/// 账号 ID
pub type AccountId = String;

/// 远程 Agent ID
pub type AgentId = String;

/// 任务 ID
pub type JobId = uuid::Uuid;

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:@-]{0,127}$").expect("ID 正则表达式非法")
});

/// 检查设备 / Agent / 账号标识是否合法
pub fn is_valid_id(id: &str) -> bool {
    ID_PATTERN.is_match(id)
}

pub use config::FarmConfig;
pub use driver::create_driver;
pub use executor::ConcurrentJobExecutor;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("D1"));
        assert!(is_valid_id("emulator-5554"));
        assert!(is_valid_id("192.168.1.20:5555"));
        assert!(is_valid_id("user@example.com"));
    }

    #[test]
    fn test_invalid_ids() {
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("-leading-dash"));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id(&"x".repeat(129)));
    }
}
