//! 状态广播模块

mod broadcaster;
mod events;

pub use broadcaster::{SubscriberInfo, Subscription};
pub use events::{FarmSnapshot, StatusEvent};

use broadcaster::Broadcaster;

/// 农场状态广播器
pub type StatusBroadcaster = Broadcaster<StatusEvent>;
