//! 状态推送 Socket.IO 服务器
//!
//! 把广播器上的每个事件按事件名推送给所有客户端，并提供任务控制事件。

use axum::Router;
use serde::Deserialize;
use serde_json::{Value, json};
use socketioxide::{
    SocketIo,
    extract::{Data, SocketRef},
    layer::SocketIoLayer,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::farm::JobId;
use crate::farm::broadcast::{StatusEvent, Subscription};
use crate::farm::executor::ConcurrentJobExecutor;
use crate::farm::pipeline::JobRequest;

/// 状态推送服务器
pub struct StatusSocketServer {
    io: Arc<SocketIo>,
    layer: SocketIoLayer,
    port: u16,
    executor: Arc<ConcurrentJobExecutor>,
}

#[derive(Deserialize)]
struct JobRef {
    job_id: JobId,
}

impl StatusSocketServer {
    /// 创建新的状态推送服务器
    pub fn new(port: u16, executor: Arc<ConcurrentJobExecutor>) -> Self {
        let (layer, io) = SocketIo::new_layer();
        let io = Arc::new(io);

        info!("创建状态推送 Socket.IO 服务器，端口: {}", port);

        let handler_executor = Arc::clone(&executor);
        io.ns("/", move |socket: SocketRef| async move {
            debug!("新客户端连接到状态推送: {}", socket.id);
            register_handlers(socket, Arc::clone(&handler_executor));
        });

        Self {
            io,
            layer,
            port,
            executor,
        }
    }

    /// 订阅广播器，把事件转发给所有客户端
    pub fn spawn_forwarder(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let io = Arc::clone(&self.io);
        let broadcaster = Arc::clone(self.executor.broadcaster());
        let subscription = broadcaster.subscribe();

        tokio::spawn(async move {
            let subscription = forward(&io, subscription, shutdown).await;
            debug!(
                subscriber = subscription.id(),
                lossy = subscription.is_lossy(),
                dropped = subscription.dropped(),
                "状态转发已停止"
            );
            broadcaster.unsubscribe(subscription);
        })
    }

    /// 启动服务器
    pub async fn run(self, bind: &str, shutdown: CancellationToken) {
        let addr = format!("{}:{}", bind, self.port);

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new().layer(cors).layer(self.layer);

        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("无法绑定到 {}: {}", addr, e);
                return;
            }
        };

        info!("状态推送 Socket.IO 服务器正在监听 {}", addr);

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            error!("状态推送 Socket.IO 服务器错误: {:?}", e);
        }
    }
}

/// 转发事件直到关闭，交还订阅
async fn forward(
    io: &SocketIo,
    mut subscription: Subscription<StatusEvent>,
    shutdown: CancellationToken,
) -> Subscription<StatusEvent> {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = subscription.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if let Err(e) = io.emit(event.name(), &event).await {
            warn!("推送 {} 事件失败: {:?}", event.name(), e);
        }
    }
    subscription
}

fn failure(message: impl std::fmt::Display) -> Value {
    json!({ "success": false, "error": message.to_string() })
}

fn register_handlers(socket: SocketRef, executor: Arc<ConcurrentJobExecutor>) {
    // job/submit
    {
        let executor = Arc::clone(&executor);
        socket.on("job/submit", move |s: SocketRef, data: Data<Value>| {
            let executor = Arc::clone(&executor);
            async move {
                debug!("收到 job/submit 请求: {:?}", data.0);

                let response = match serde_json::from_value::<JobRequest>(data.0) {
                    Ok(request) => match executor.submit(request) {
                        Ok(job_id) => json!({ "success": true, "job_id": job_id }),
                        Err(rejection) => json!({
                            "success": false,
                            "code": rejection.code(),
                            "error": rejection.to_string()
                        }),
                    },
                    Err(e) => failure(format!("请求格式非法: {}", e)),
                };

                let _ = s.emit("job/submit/response", &response);
            }
        });
    }

    // job/stop
    {
        let executor = Arc::clone(&executor);
        socket.on("job/stop", move |s: SocketRef, data: Data<Value>| {
            let executor = Arc::clone(&executor);
            async move {
                let response = match serde_json::from_value::<JobRef>(data.0) {
                    Ok(JobRef { job_id }) => {
                        json!({ "success": true, "job_id": job_id, "stopped": executor.stop(job_id) })
                    }
                    Err(e) => failure(format!("缺少 job_id 参数: {}", e)),
                };

                let _ = s.emit("job/stop/response", &response);
            }
        });
    }

    // job/status
    {
        let executor = Arc::clone(&executor);
        socket.on("job/status", move |s: SocketRef, data: Data<Value>| {
            let executor = Arc::clone(&executor);
            async move {
                let response = match serde_json::from_value::<JobRef>(data.0) {
                    Ok(JobRef { job_id }) => match executor.status(job_id).await {
                        Some(job) => json!({ "success": true, "job": job }),
                        None => failure(format!("任务不存在: {}", job_id)),
                    },
                    Err(e) => failure(format!("缺少 job_id 参数: {}", e)),
                };

                let _ = s.emit("job/status/response", &response);
            }
        });
    }

    // farm/snapshot
    {
        let executor = Arc::clone(&executor);
        socket.on("farm/snapshot", move |s: SocketRef| {
            let executor = Arc::clone(&executor);
            async move {
                let _ = s.emit(
                    "farm/snapshot/response",
                    &json!({ "success": true, "snapshot": executor.snapshot() }),
                );
            }
        });
    }
}
