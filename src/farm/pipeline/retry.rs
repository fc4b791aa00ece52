//! 带错误分类的重试

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// 重试策略：固定间隔，最多 `max_attempts` 次尝试（含首次）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// 执行结果及实际尝试次数
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl<T, E> Attempted<T, E> {
    /// 除首次外的重试次数
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// 执行操作；`is_retryable` 返回 false 的错误立即结束
    pub async fn run<F, Fut, T, E, C>(&self, mut operation: F, is_retryable: C) -> Attempted<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        C: Fn(&E) -> bool,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = operation().await;

            let retry = match &result {
                Ok(_) => {
                    if attempts > 1 {
                        debug!(attempts, "重试后成功");
                    }
                    false
                }
                Err(e) => {
                    let retry = attempts < self.max_attempts && is_retryable(e);
                    warn!(attempts, retry, "操作失败: {}", e);
                    retry
                }
            };

            if !retry {
                return Attempted { result, attempts };
            }

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
    }
}
