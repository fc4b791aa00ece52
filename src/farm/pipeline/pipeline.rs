//! 单个任务的执行流水线
//!
//! 设备初始化 → 容器切换（按设备能力） → 逐账号执行动作 → 完成 / 失败 / 停止。
//! 设备由租约持有，流水线的任何退出路径都在租约离开作用域时释放设备。

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::job::{AccountResult, Job, JobControl, JobError};
use super::state::{FailureReason, JobState};
use crate::farm::broadcast::{StatusBroadcaster, StatusEvent};
use crate::farm::config::ExecutorConfig;
use crate::farm::container::ContainerSwitchCoordinator;
use crate::farm::driver::{AutomationDriver, DriverSession};
use crate::farm::pool::{Device, DevicePool};
use crate::farm::template::AccountPlan;

/// 流水线参数
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub init_timeout: Duration,
    pub action_timeout: Duration,
    pub max_failed_accounts: Option<usize>,
}

impl From<&ExecutorConfig> for PipelineSettings {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            init_timeout: Duration::from_secs(config.init_timeout_secs),
            action_timeout: Duration::from_secs(config.action_timeout_secs),
            max_failed_accounts: config.max_failed_accounts,
        }
    }
}

/// 所有流水线共享的依赖
pub struct PipelineContext {
    pub pool: Arc<DevicePool>,
    pub driver: Arc<dyn AutomationDriver>,
    pub coordinator: Arc<ContainerSwitchCoordinator>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub settings: PipelineSettings,
}

/// 阶段结束方式
enum StageExit {
    Completed,
    Stopped,
    Failed(FailureReason, String),
}

/// 任务执行流水线
pub struct JobExecutionPipeline {
    job: Job,
    plans: Vec<AccountPlan>,
    ctx: Arc<PipelineContext>,
    control: JobControl,
    publisher: watch::Sender<Job>,
}

impl JobExecutionPipeline {
    /// 创建流水线，返回的接收端用于读取任务快照
    pub fn new(
        job: Job,
        plans: Vec<AccountPlan>,
        ctx: Arc<PipelineContext>,
        control: JobControl,
    ) -> (Self, watch::Receiver<Job>) {
        let (publisher, receiver) = watch::channel(job.clone());
        (
            Self {
                job,
                plans,
                ctx,
                control,
                publisher,
            },
            receiver,
        )
    }

    /// 运行到终态并返回最终快照
    pub async fn run(mut self) -> Job {
        if self.control.stop.is_cancelled() {
            info!("任务在开始前被停止");
            self.transition(JobState::Stopped);
            return self.job;
        }

        self.transition(JobState::Initializing);

        let lease = match self.ctx.pool.try_acquire(&self.job.device_id, self.job.id) {
            Ok(lease) => lease,
            Err(rejection) => {
                self.fail(
                    FailureReason::DeviceUnavailable,
                    format!("无法占用设备: {}", rejection),
                );
                return self.job;
            }
        };

        let device = lease.device().clone();
        let lost = self.control.lost.clone();

        let exit = tokio::select! {
            biased;
            _ = lost.cancelled() => {
                StageExit::Failed(FailureReason::DeviceLost, "设备离线，任务中止".to_string())
            }
            exit = self.stages(&device) => exit,
        };

        // 先释放设备，再上报终态
        drop(lease);

        match exit {
            StageExit::Completed => {
                info!(accounts = self.job.results.len(), failed = self.job.failed_accounts(), "任务完成");
                self.transition(JobState::Completed);
            }
            StageExit::Stopped => {
                info!("任务已停止");
                self.transition(JobState::Stopped);
            }
            StageExit::Failed(reason, message) => self.fail(reason, message),
        }

        self.job
    }

    async fn stages(&mut self, device: &Device) -> StageExit {
        let init_timeout = self.ctx.settings.init_timeout;
        let session = match tokio::time::timeout(init_timeout, self.ctx.driver.connect(device)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                return StageExit::Failed(FailureReason::InitTimeout, format!("设备初始化失败: {}", e));
            }
            Err(_) => {
                return StageExit::Failed(
                    FailureReason::InitTimeout,
                    format!("设备初始化超时（{:?}）", init_timeout),
                );
            }
        };
        debug!(driver = self.ctx.driver.name(), "设备初始化完成");

        if self.control.stop.is_cancelled() {
            return StageExit::Stopped;
        }

        let use_containers = device.supports_containers;
        self.transition(if use_containers {
            JobState::ContainerSwitching
        } else {
            JobState::Executing
        });

        let plans = std::mem::take(&mut self.plans);
        let total = plans.len();
        let mut switched_any = false;

        for (index, plan) in plans.iter().enumerate() {
            if self.control.stop.is_cancelled() {
                info!(done = index, total, "在账号之间收到停止请求");
                return StageExit::Stopped;
            }

            let mut container_id = None;
            if use_containers {
                match self
                    .ctx
                    .coordinator
                    .switch(session.as_ref(), &device.id, &plan.account_id)
                    .await
                {
                    Ok(outcome) => {
                        self.add_retries(JobState::ContainerSwitching, outcome.retries);
                        container_id = Some(outcome.binding.container_id);
                        if !switched_any {
                            switched_any = true;
                            self.transition(JobState::Executing);
                        }
                    }
                    Err(e) => {
                        self.add_retries(JobState::ContainerSwitching, e.retries);
                        self.record_error(
                            JobState::ContainerSwitching,
                            Some(&plan.account_id),
                            e.to_string(),
                        );
                        self.job.results.push(AccountResult {
                            account_id: plan.account_id.clone(),
                            success: false,
                            message: format!("容器切换失败: {}", e.source),
                            container_id: None,
                            actions_run: 0,
                            actions_failed: 0,
                        });
                        self.account_done(index + 1, total);
                        // 还没有账号切换成功时，交给全部失败的判定
                        if switched_any {
                            if let Some(exit) = self.check_failure_budget() {
                                return exit;
                            }
                        }
                        continue;
                    }
                }
            }

            let result = self.run_account(session.as_ref(), plan, container_id).await;
            self.job.results.push(result);
            self.account_done(index + 1, total);

            if let Some(exit) = self.check_failure_budget() {
                return exit;
            }
        }

        if use_containers && total > 0 && !switched_any {
            return StageExit::Failed(
                FailureReason::AllSwitchesFailed,
                "所有账号的容器切换均失败".to_string(),
            );
        }

        StageExit::Completed
    }

    /// 执行单个账号的动作列表，单个动作失败不影响后续动作
    async fn run_account(
        &mut self,
        session: &dyn DriverSession,
        plan: &AccountPlan,
        container_id: Option<String>,
    ) -> AccountResult {
        let action_timeout = self.ctx.settings.action_timeout;
        let mut failed = 0;

        for action in &plan.actions {
            let outcome =
                tokio::time::timeout(action_timeout, session.run_action(action, &plan.account_id)).await;

            let error = match outcome {
                Ok(Ok(result)) if result.success => None,
                Ok(Ok(result)) => Some(format!("动作 {} 失败: {}", action.kind, result.message)),
                Ok(Err(e)) => Some(format!("动作 {} 出错: {}", action.kind, e)),
                Err(_) => Some(format!("动作 {} 超时（{:?}）", action.kind, action_timeout)),
            };

            if let Some(message) = error {
                failed += 1;
                warn!(account_id = %plan.account_id, "{}", message);
                self.record_error(JobState::Executing, Some(&plan.account_id), message);
            }
        }

        let total = plan.actions.len();
        AccountResult {
            account_id: plan.account_id.clone(),
            success: failed == 0,
            message: if failed == 0 {
                format!("完成 {} 个动作", total)
            } else {
                format!("{} / {} 个动作失败", failed, total)
            },
            container_id,
            actions_run: total,
            actions_failed: failed,
        }
    }

    /// 失败账号数超过上限时提前结束
    fn check_failure_budget(&self) -> Option<StageExit> {
        let max = self.ctx.settings.max_failed_accounts?;
        let failed = self.job.failed_accounts();
        (failed > max).then(|| {
            StageExit::Failed(
                FailureReason::TooManyAccountFailures,
                format!("失败账号数 {} 超过上限 {}", failed, max),
            )
        })
    }

    fn account_done(&mut self, done: usize, total: usize) {
        if self.job.state == JobState::Executing && total > 0 {
            self.job.progress = (50 + 49 * done / total) as u8;
        }
        self.publish();
    }

    fn add_retries(&mut self, stage: JobState, retries: u32) {
        if retries > 0 {
            *self.job.retries.entry(stage).or_insert(0) += retries;
        }
    }

    fn record_error(&mut self, stage: JobState, account_id: Option<&String>, message: String) {
        self.job.errors.push(JobError {
            stage,
            account_id: account_id.cloned(),
            message,
            at: Utc::now(),
        });
    }

    fn fail(&mut self, reason: FailureReason, message: String) {
        warn!(%reason, "任务失败: {}", message);
        let stage = self.job.state;
        self.record_error(stage, None, message);
        self.job.failure = Some(reason);
        self.transition(JobState::Failed);
    }

    /// 推进状态；不允许回退
    fn transition(&mut self, next: JobState) {
        if !self.job.state.can_advance_to(next) {
            warn!(from = %self.job.state, to = %next, "忽略非法的状态转换");
            return;
        }

        debug!(from = %self.job.state, to = %next, "任务状态变化");
        self.job.state = next;
        if let Some(progress) = next.progress() {
            self.job.progress = progress;
        }

        let now = Utc::now();
        if next == JobState::Initializing {
            self.job.started_at = Some(now);
        }
        if next.is_terminal() {
            self.job.completed_at = Some(now);
        }

        self.publish();
    }

    fn publish(&self) {
        self.publisher.send_replace(self.job.clone());
        // 终态事件由执行器在任务归档后发出
        if !self.job.is_terminal() {
            self.ctx.broadcaster.publish(StatusEvent::job_status(&self.job));
        }
    }
}
