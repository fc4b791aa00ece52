//! 账号容器切换模块

mod coordinator;

pub use coordinator::{ContainerBinding, ContainerSwitchCoordinator};
