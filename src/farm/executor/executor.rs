//! 并发任务执行器
//!
//! 负责准入控制、为每个任务启动一条流水线，并持有在线任务表。
//! 在线任务表是“设备是否已有任务在跑”的唯一依据，只由执行器修改。

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::history::{JobHistory, JsonlHistory, MemoryHistory};
use crate::error::AppError;
use crate::farm::broadcast::{FarmSnapshot, StatusBroadcaster, StatusEvent};
use crate::farm::config::{ExecutorConfig, FarmConfig};
use crate::farm::container::ContainerSwitchCoordinator;
use crate::farm::driver::AutomationDriver;
use crate::farm::heartbeat::{AgentHeartbeatTracker, AgentInfo, HeartbeatAck};
use crate::farm::pipeline::{
    FailureReason, Job, JobControl, JobError, JobExecutionPipeline, JobRequest, JobState,
    PipelineContext, PipelineSettings,
};
use crate::farm::pool::{AcquireRejection, DevicePool, DeviceSpec};
use crate::farm::template::{ConfigTemplates, TemplateError, TemplateExpander};
use crate::farm::{AgentId, DeviceId, JobId, is_valid_id};

/// 提交被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitRejection {
    InvalidRequest(String),
    TemplateNotFound(String),
    DeviceNotFound,
    DeviceUnavailable,
    DeviceBusy,
    ConcurrencyLimit,
}

impl SubmitRejection {
    pub fn code(&self) -> &'static str {
        match self {
            SubmitRejection::InvalidRequest(_) => "invalid_request",
            SubmitRejection::TemplateNotFound(_) => "template_not_found",
            SubmitRejection::DeviceNotFound => "device_not_found",
            SubmitRejection::DeviceUnavailable => "device_unavailable",
            SubmitRejection::DeviceBusy => "device_busy",
            SubmitRejection::ConcurrencyLimit => "concurrency_limit",
        }
    }
}

impl fmt::Display for SubmitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitRejection::InvalidRequest(reason) => write!(f, "请求非法: {}", reason),
            SubmitRejection::TemplateNotFound(name) => write!(f, "模板不存在: {}", name),
            SubmitRejection::DeviceNotFound => write!(f, "设备不存在"),
            SubmitRejection::DeviceUnavailable => write!(f, "设备离线"),
            SubmitRejection::DeviceBusy => write!(f, "设备已有任务在执行"),
            SubmitRejection::ConcurrencyLimit => write!(f, "已达到最大并发任务数"),
        }
    }
}

impl From<AcquireRejection> for SubmitRejection {
    fn from(rejection: AcquireRejection) -> Self {
        match rejection {
            AcquireRejection::NotFound => SubmitRejection::DeviceNotFound,
            AcquireRejection::Offline => SubmitRejection::DeviceUnavailable,
            AcquireRejection::Busy => SubmitRejection::DeviceBusy,
        }
    }
}

/// Agent 配对请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

/// 任务列表
#[derive(Debug, Clone, Serialize)]
pub struct JobListing {
    pub active: Vec<Job>,
    pub recent_history: Vec<Job>,
}

/// 执行器依赖
pub struct ExecutorDeps {
    pub heartbeat: Arc<AgentHeartbeatTracker>,
    pub pool: Arc<DevicePool>,
    pub driver: Arc<dyn AutomationDriver>,
    pub coordinator: Arc<ContainerSwitchCoordinator>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub templates: Arc<dyn TemplateExpander>,
    pub history: Arc<dyn JobHistory>,
}

struct LiveJob {
    device_id: DeviceId,
    control: JobControl,
    snapshot: watch::Receiver<Job>,
    /// 进入历史后置为 true
    retired: watch::Sender<bool>,
}

#[derive(Default)]
struct LiveTable {
    jobs: HashMap<JobId, LiveJob>,
    by_device: HashMap<DeviceId, JobId>,
    /// 写入历史失败的终态任务，仍可按 ID 查询
    unarchived: VecDeque<Job>,
}

/// 并发任务执行器
pub struct ConcurrentJobExecutor {
    ctx: Arc<PipelineContext>,
    heartbeat: Arc<AgentHeartbeatTracker>,
    templates: Arc<dyn TemplateExpander>,
    history: Arc<dyn JobHistory>,
    live: Mutex<LiveTable>,
    max_concurrent_jobs: usize,
    history_limit: usize,
}

impl ConcurrentJobExecutor {
    pub fn new(deps: ExecutorDeps, config: &ExecutorConfig) -> Arc<Self> {
        let ctx = PipelineContext {
            pool: deps.pool,
            driver: deps.driver,
            coordinator: deps.coordinator,
            broadcaster: deps.broadcaster,
            settings: PipelineSettings::from(config),
        };

        Arc::new(Self {
            ctx: Arc::new(ctx),
            heartbeat: deps.heartbeat,
            templates: deps.templates,
            history: deps.history,
            live: Mutex::new(LiveTable::default()),
            max_concurrent_jobs: config.max_concurrent_jobs,
            history_limit: config.history_limit,
        })
    }

    /// 按配置组装全部组件
    pub fn from_config(
        config: &FarmConfig,
        driver: Arc<dyn AutomationDriver>,
    ) -> Result<Arc<Self>, AppError> {
        let heartbeat = Arc::new(AgentHeartbeatTracker::from_config(&config.heartbeat));
        let templates = ConfigTemplates::new(config.templates.clone());
        info!(templates = ?templates.names(), "已加载任务模板");

        let history: Arc<dyn JobHistory> = match &config.history.path {
            Some(path) => Arc::new(JsonlHistory::open(path, config.executor.history_limit)?),
            None => Arc::new(MemoryHistory::new(config.executor.history_limit)),
        };

        let deps = ExecutorDeps {
            pool: Arc::new(DevicePool::new(Arc::clone(&heartbeat))),
            heartbeat,
            driver,
            coordinator: Arc::new(ContainerSwitchCoordinator::from_config(&config.container)),
            broadcaster: Arc::new(StatusBroadcaster::new(config.broadcast.subscriber_buffer)),
            templates: Arc::new(templates),
            history,
        };

        Ok(Self::new(deps, &config.executor))
    }

    fn table(&self) -> MutexGuard<'_, LiveTable> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pool(&self) -> &Arc<DevicePool> {
        &self.ctx.pool
    }

    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        &self.ctx.broadcaster
    }

    pub fn coordinator(&self) -> &Arc<ContainerSwitchCoordinator> {
        &self.ctx.coordinator
    }

    /// 提交任务，立即返回
    pub fn submit(self: &Arc<Self>, request: JobRequest) -> Result<JobId, SubmitRejection> {
        validate_request(&request)?;

        let plans = self
            .templates
            .expand(&request.template, &request.account_ids)
            .map_err(|e| match e {
                TemplateError::NotFound(name) => SubmitRejection::TemplateNotFound(name),
                TemplateError::Invalid(reason) => SubmitRejection::InvalidRequest(reason),
            })?;

        self.ctx.pool.check_admissible(&request.device_id)?;

        let job_id = Uuid::new_v4();
        let device_id = request.device_id.clone();
        let control = JobControl::new();
        let pending = Job::new(job_id, request);
        let (pipeline, snapshot) = JobExecutionPipeline::new(
            pending.clone(),
            plans,
            Arc::clone(&self.ctx),
            control.clone(),
        );

        {
            let mut table = self.table();
            if table.by_device.contains_key(&device_id) {
                return Err(SubmitRejection::DeviceBusy);
            }
            if table.jobs.len() >= self.max_concurrent_jobs {
                return Err(SubmitRejection::ConcurrencyLimit);
            }

            table.by_device.insert(device_id.clone(), job_id);
            table.jobs.insert(
                job_id,
                LiveJob {
                    device_id: device_id.clone(),
                    control,
                    snapshot,
                    retired: watch::Sender::new(false),
                },
            );
        }

        info!(job_id = %job_id, device_id = %device_id, "任务已受理");
        self.ctx.broadcaster.publish(StatusEvent::job_status(&pending));

        let span = info_span!("job", job_id = %job_id, device_id = %device_id);
        let handle = tokio::spawn(pipeline.run().instrument(span));

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let job = match handle.await {
                Ok(job) => Some(job),
                Err(e) => {
                    error!(job_id = %job_id, "任务流水线异常退出: {}", e);
                    executor.internal_failure(job_id, e.to_string())
                }
            };
            if let Some(job) = job {
                executor.retire(job);
            }
        });

        Ok(job_id)
    }

    /// 流水线异常退出时，以最后一次快照为基础记为内部失败
    fn internal_failure(&self, job_id: JobId, message: String) -> Option<Job> {
        let mut job = self
            .table()
            .jobs
            .get(&job_id)
            .map(|live| live.snapshot.borrow().clone())?;

        if !job.is_terminal() {
            job.errors.push(JobError {
                stage: job.state,
                account_id: None,
                message: format!("任务内部异常: {}", message),
                at: chrono::Utc::now(),
            });
            job.failure = Some(FailureReason::Internal);
            job.state = JobState::Failed;
            job.completed_at = Some(chrono::Utc::now());
        }

        Some(job)
    }

    /// 任务进入终态：写入历史，移出在线任务表，再发出终态事件
    ///
    /// 先写历史再移出，任务在任意时刻都能按 ID 查到；终态事件发出时设备已经可以再次提交。
    fn retire(&self, job: Job) {
        let archived = match self.history.append(job.clone()) {
            Ok(()) => true,
            Err(e) => {
                error!(job_id = %job.id, "写入任务历史失败，保留在内存中: {}", e);
                false
            }
        };

        let live = {
            let mut table = self.table();
            let Some(live) = table.jobs.remove(&job.id) else {
                warn!(job_id = %job.id, "退役的任务不在在线任务表中");
                return;
            };

            if table.by_device.get(&live.device_id) == Some(&job.id) {
                table.by_device.remove(&live.device_id);
            }

            if !archived {
                table.unarchived.push_back(job.clone());
                while table.unarchived.len() > self.history_limit.max(1) {
                    table.unarchived.pop_front();
                }
            }
            live
        };

        live.retired.send_replace(true);
        self.ctx.broadcaster.publish(StatusEvent::job_status(&job));
        info!(
            job_id = %job.id,
            device_id = %job.device_id,
            state = %job.state,
            reason = job.failure.map(|r| r.as_str()),
            "任务已归档"
        );
    }

    /// 请求停止任务；任务不存在或已结束时返回 false
    pub fn stop(&self, job_id: JobId) -> bool {
        let table = self.table();
        let Some(live) = table.jobs.get(&job_id) else {
            return false;
        };

        if live.snapshot.borrow().is_terminal() {
            return false;
        }

        live.control.stop.cancel();
        info!(job_id = %job_id, "已请求停止任务");
        true
    }

    /// 在线任务或未能写入历史的任务
    fn lookup_local(&self, job_id: JobId) -> Option<Job> {
        let table = self.table();
        if let Some(live) = table.jobs.get(&job_id) {
            return Some(live.snapshot.borrow().clone());
        }
        table.unarchived.iter().rev().find(|job| job.id == job_id).cloned()
    }

    /// 任务快照：在线任务返回最新状态，否则查历史
    pub async fn status(&self, job_id: JobId) -> Option<Job> {
        match self.lookup_local(job_id) {
            Some(job) => Some(job),
            None => self.history.get(job_id).await,
        }
    }

    /// 在线任务与最近的历史任务
    ///
    /// 已到终态、正在归档的任务只出现在历史中。
    pub fn list(&self) -> JobListing {
        let mut recent_history = self.history.recent(self.history_limit);
        let (mut active, unarchived) = {
            let table = self.table();
            let active: Vec<Job> = table
                .jobs
                .values()
                .map(|live| live.snapshot.borrow().clone())
                .filter(|job| !job.is_terminal())
                .collect();
            (active, table.unarchived.iter().cloned().collect::<Vec<Job>>())
        };
        active.sort_by_key(|job| job.created_at);

        if !unarchived.is_empty() {
            recent_history.extend(unarchived);
            recent_history.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
            recent_history.truncate(self.history_limit);
        }

        JobListing {
            active,
            recent_history,
        }
    }

    /// 等待任务归档，返回最终快照
    pub async fn wait(&self, job_id: JobId) -> Option<Job> {
        let retired = self
            .table()
            .jobs
            .get(&job_id)
            .map(|live| live.retired.subscribe());

        if let Some(mut retired) = retired {
            // 发送端只会在置为 true 之后才被丢弃
            let _ = retired.wait_for(|done| *done).await;
        }

        self.status(job_id).await
    }

    /// 在线任务数
    pub fn active_count(&self) -> usize {
        self.table().jobs.len()
    }

    /// 汇总快照
    pub fn snapshot(&self) -> FarmSnapshot {
        let counts = self.ctx.pool.counts();
        FarmSnapshot {
            active_count: self.active_count(),
            online_devices: counts.online,
            offline_devices: counts.offline,
            free_devices: counts.free,
            held_devices: counts.held,
            total_devices: counts.total,
            subscribers: self.ctx.broadcaster.subscriber_count(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Agent 配对：登记其设备并视为一次心跳
    pub fn register_agent(&self, registration: AgentRegistration) -> Result<HeartbeatAck, AppError> {
        if !is_valid_id(&registration.agent_id) {
            return Err(AppError::InvalidInput(format!(
                "Agent ID 非法: {}",
                registration.agent_id
            )));
        }

        let mut device_ids = Vec::with_capacity(registration.devices.len());
        for spec in registration.devices {
            device_ids.push(spec.device_id.clone());
            self.ctx.pool.register_device(
                spec,
                &registration.agent_id,
                &registration.host,
                registration.port,
            )?;
        }

        let ack = self.heartbeat.register_agent(
            &registration.agent_id,
            &registration.host,
            registration.port,
            &device_ids,
        );
        self.after_heartbeat(&registration.agent_id, &device_ids, &ack);
        Ok(ack)
    }

    /// 记录 Agent 心跳
    pub fn record_heartbeat(&self, agent_id: &str, device_ids: &[DeviceId]) -> HeartbeatAck {
        let ack = self.heartbeat.record_heartbeat(agent_id, device_ids);
        self.after_heartbeat(agent_id, device_ids, &ack);
        ack
    }

    fn after_heartbeat(&self, agent_id: &str, device_ids: &[DeviceId], ack: &HeartbeatAck) {
        if !ack.accepted {
            return;
        }

        self.ctx.pool.mark_seen(device_ids);
        for device_id in &ack.recovered {
            info!(device_id = %device_id, agent_id, "设备恢复在线");
            self.ctx
                .broadcaster
                .publish(StatusEvent::device_online(device_id, agent_id));
        }
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        self.heartbeat.agents()
    }

    /// 执行一轮离线扫描，返回新离线的设备数
    ///
    /// 被占用的离线设备会通知其任务中止。
    pub fn sweep_offline(&self) -> usize {
        let offline = self.heartbeat.sweep();

        for device in &offline {
            self.ctx.broadcaster.publish(StatusEvent::device_offline(
                &device.device_id,
                &device.agent_id,
            ));

            let Some(job_id) = self.ctx.pool.mark_offline(&device.device_id) else {
                continue;
            };

            if let Some(live) = self.table().jobs.get(&job_id) {
                warn!(job_id = %job_id, device_id = %device.device_id, "设备离线，中止任务");
                live.control.lost.cancel();
            }
        }

        offline.len()
    }

    /// 启动后台离线扫描
    pub fn spawn_liveness_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!(?interval, "离线扫描已启动");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        executor.sweep_offline();
                    }
                }
            }

            info!("离线扫描已停止");
        })
    }

    /// 启动周期性的汇总快照广播
    pub fn spawn_snapshot_publisher(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = executor.snapshot();
                        executor.ctx.broadcaster.publish(StatusEvent::Snapshot(snapshot));
                    }
                }
            }
        })
    }

    /// 停止所有在线任务并等待它们归档
    pub async fn shutdown(&self) {
        let job_ids: Vec<JobId> = self.table().jobs.keys().copied().collect();
        if job_ids.is_empty() {
            return;
        }

        info!(jobs = job_ids.len(), "正在停止所有在线任务");
        for job_id in &job_ids {
            self.stop(*job_id);
        }

        futures::future::join_all(job_ids.iter().map(|job_id| self.wait(*job_id))).await;
        self.history.flush().await;
        info!("所有任务已归档");
    }
}

fn validate_request(request: &JobRequest) -> Result<(), SubmitRejection> {
    if !is_valid_id(&request.device_id) {
        return Err(SubmitRejection::InvalidRequest(format!(
            "设备 ID 非法: {:?}",
            request.device_id
        )));
    }

    if request.account_ids.is_empty() {
        return Err(SubmitRejection::InvalidRequest("账号列表为空".to_string()));
    }

    if let Some(bad) = request.account_ids.iter().find(|id| !is_valid_id(id)) {
        return Err(SubmitRejection::InvalidRequest(format!("账号 ID 非法: {:?}", bad)));
    }

    if request.template.trim().is_empty() {
        return Err(SubmitRejection::InvalidRequest("未指定模板".to_string()));
    }

    Ok(())
}
