mod farm_config;

pub use farm_config::{
    ConfigError, ContainerConfig, DriverConfig, DriverKind, ExecutorConfig, FarmConfig,
    HeartbeatConfig, LoggingConfig,
};
