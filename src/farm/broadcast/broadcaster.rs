//! 发布 / 订阅广播
//!
//! 每个订阅者拥有独立的有界缓冲，缓冲满时丢弃最旧的消息并把订阅者标记为有损，
//! 发布方永远不会因订阅者过慢而阻塞。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// 订阅者状态快照
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    pub id: u64,
    pub lossy: bool,
    pub dropped: u64,
    pub subscribed_at: DateTime<Utc>,
}

struct SubscriberState {
    lossy: bool,
    dropped: u64,
    subscribed_at: DateTime<Utc>,
}

type Registry = Arc<Mutex<HashMap<u64, SubscriberState>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<u64, SubscriberState>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 广播器
pub struct Broadcaster<T> {
    sender: broadcast::Sender<T>,
    registry: Registry,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// `buffer` 为每个订阅者的缓冲大小
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            sender,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// 发布事件，返回收到事件的订阅者数量
    pub fn publish(&self, event: T) -> usize {
        // 没有订阅者时发送失败，属于正常情况
        self.sender.send(event).unwrap_or(0)
    }

    /// 注册新的订阅者
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry).insert(
            id,
            SubscriberState {
                lossy: false,
                dropped: 0,
                subscribed_at: Utc::now(),
            },
        );
        debug!(subscriber = id, "新的状态订阅者");

        Subscription {
            id,
            receiver: self.sender.subscribe(),
            registry: Arc::clone(&self.registry),
        }
    }

    /// 移除订阅者，等价于丢弃订阅
    pub fn unsubscribe(&self, subscription: Subscription<T>) {
        drop(subscription);
    }

    /// 当前订阅者
    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let mut subscribers: Vec<SubscriberInfo> = lock(&self.registry)
            .iter()
            .map(|(id, state)| SubscriberInfo {
                id: *id,
                lossy: state.lossy,
                dropped: state.dropped,
                subscribed_at: state.subscribed_at,
            })
            .collect();
        subscribers.sort_by_key(|s| s.id);
        subscribers
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).len()
    }
}

/// 订阅句柄，丢弃即取消订阅
pub struct Subscription<T> {
    id: u64,
    receiver: broadcast::Receiver<T>,
    registry: Registry,
}

impl<T: Clone> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn mark_lossy(&self, skipped: u64) {
        if let Some(state) = lock(&self.registry).get_mut(&self.id) {
            state.lossy = true;
            state.dropped += skipped;
        }
        warn!(subscriber = self.id, skipped, "订阅者处理过慢，已丢弃最旧的事件");
    }

    /// 等待下一个事件，广播器关闭后返回 None
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.mark_lossy(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞地取出一个事件
    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<T> {
        use tokio::sync::broadcast::error::TryRecvError;

        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.mark_lossy(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// 是否曾经丢失过事件
    pub fn is_lossy(&self) -> bool {
        lock(&self.registry)
            .get(&self.id)
            .is_some_and(|state| state.lossy)
    }

    pub fn dropped(&self) -> u64 {
        lock(&self.registry)
            .get(&self.id)
            .map_or(0, |state| state.dropped)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.id);
        debug!(subscriber = self.id, "状态订阅者已移除");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let broadcaster = Broadcaster::new(8);
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        assert_eq!(broadcaster.publish(1u32), 2);
        assert_eq!(first.recv().await, Some(1));
        assert_eq!(second.recv().await, Some(1));
        assert_eq!(broadcaster.subscriber_count(), 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = Broadcaster::new(4);
        assert_eq!(broadcaster.publish("lonely"), 0);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_and_is_lossy() {
        let broadcaster = Broadcaster::new(4);
        let mut slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();

        for i in 0..10u32 {
            broadcaster.publish(i);
            // 快速订阅者及时消费，不会丢失
            assert_eq!(fast.try_recv(), Some(i));
        }

        // 慢订阅者只能看到最新的 4 条
        let mut received = Vec::new();
        while let Some(event) = slow.try_recv() {
            received.push(event);
        }

        assert_eq!(received, vec![6, 7, 8, 9]);
        assert!(slow.is_lossy());
        assert_eq!(slow.dropped(), 6);
        assert!(!fast.is_lossy());

        let infos = broadcaster.subscribers();
        assert!(infos.iter().any(|s| s.id == slow.id() && s.lossy && s.dropped == 6));
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let broadcaster = Broadcaster::new(4);
        let subscription = broadcaster.subscribe();
        broadcaster.unsubscribe(subscription);
        assert_eq!(broadcaster.subscriber_count(), 0);

        let mut pending = broadcaster.subscribe();
        drop(broadcaster);
        let closed = tokio::time::timeout(Duration::from_secs(1), pending.recv()).await;
        assert_eq!(closed.unwrap(), None::<u32>);
    }
}
