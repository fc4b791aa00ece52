//! 对外接口模块

mod http;
mod socket_server;

pub use http::ApiServer;
pub use socket_server::StatusSocketServer;
