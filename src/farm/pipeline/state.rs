use serde::{Deserialize, Serialize};
use std::fmt;

/// 任务状态
///
/// 声明顺序即推进顺序，状态只能向后推进。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Initializing,
    ContainerSwitching,
    Executing,
    Completed,
    Failed,
    Stopped,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Initializing => "initializing",
            JobState::ContainerSwitching => "container_switching",
            JobState::Executing => "executing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Stopped)
    }

    /// 进入该状态时的进度；失败与停止保留之前的进度
    pub fn progress(&self) -> Option<u8> {
        match self {
            JobState::Pending => Some(0),
            JobState::Initializing => Some(10),
            JobState::ContainerSwitching => Some(30),
            JobState::Executing => Some(50),
            JobState::Completed => Some(100),
            JobState::Failed | JobState::Stopped => None,
        }
    }

    /// 是否允许从当前状态转到 `next`
    pub fn can_advance_to(&self, next: JobState) -> bool {
        !self.is_terminal() && self.rank() < next.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Initializing => 1,
            JobState::ContainerSwitching => 2,
            JobState::Executing => 3,
            JobState::Completed | JobState::Failed | JobState::Stopped => 4,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// 申请设备被拒绝
    DeviceUnavailable,
    /// 设备初始化超时或失败
    InitTimeout,
    /// 所有账号的容器切换均失败
    AllSwitchesFailed,
    /// 失败账号数超过配置的上限
    TooManyAccountFailures,
    /// 执行过程中设备离线
    DeviceLost,
    /// 任务内部异常
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::DeviceUnavailable => "device_unavailable",
            FailureReason::InitTimeout => "init_timeout",
            FailureReason::AllSwitchesFailed => "all_switches_failed",
            FailureReason::TooManyAccountFailures => "too_many_account_failures",
            FailureReason::DeviceLost => "device_lost",
            FailureReason::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        assert!(JobState::Pending.can_advance_to(JobState::Initializing));
        assert!(JobState::Initializing.can_advance_to(JobState::Executing));
        assert!(JobState::Pending.can_advance_to(JobState::Stopped));
        assert!(!JobState::Executing.can_advance_to(JobState::ContainerSwitching));
        assert!(!JobState::Executing.can_advance_to(JobState::Executing));
        assert!(!JobState::Completed.can_advance_to(JobState::Failed));
        assert!(!JobState::Failed.can_advance_to(JobState::Stopped));
    }

    #[test]
    fn test_progress_values() {
        assert_eq!(JobState::Pending.progress(), Some(0));
        assert_eq!(JobState::ContainerSwitching.progress(), Some(30));
        assert_eq!(JobState::Completed.progress(), Some(100));
        assert_eq!(JobState::Stopped.progress(), None);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&JobState::ContainerSwitching).unwrap(),
            "\"container_switching\""
        );
        assert_eq!(
            serde_json::to_string(&FailureReason::AllSwitchesFailed).unwrap(),
            "\"all_switches_failed\""
        );
    }
}
