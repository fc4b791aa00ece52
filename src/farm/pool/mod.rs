//! 设备池模块
//!
//! 管理已注册设备及其独占占用状态

mod device_entry;
mod device_pool;
mod types;

pub use device_pool::DevicePool;
pub use types::{AcquireRejection, Device, DeviceFilter, DeviceSpec};
