use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::executor::ExecutorDeps;
use super::history::{JobHistory, MemoryHistory};
use super::*;
use crate::farm::broadcast::{StatusBroadcaster, StatusEvent};
use crate::farm::config::ExecutorConfig;
use crate::farm::container::ContainerSwitchCoordinator;
use crate::farm::driver::{
    Action, AutomationDriver, DriverError, DriverSession, ScriptedDriver,
};
use crate::farm::heartbeat::AgentHeartbeatTracker;
use crate::farm::pipeline::{FailureReason, Job, JobRequest, JobState};
use crate::farm::pool::{Device, DevicePool, DeviceSpec};
use crate::farm::template::{ConfigTemplates, TemplateDefinition};
use crate::farm::{DeviceId, JobId};

const WAIT: Duration = Duration::from_secs(5);

struct Farm {
    executor: Arc<ConcurrentJobExecutor>,
}

struct FarmBuilder {
    driver: Arc<dyn AutomationDriver>,
    config: ExecutorConfig,
    ttl: Duration,
    devices: Vec<(String, bool)>,
    history: Option<Arc<dyn JobHistory>>,
}

impl FarmBuilder {
    fn new(driver: Arc<dyn AutomationDriver>) -> Self {
        Self {
            driver,
            config: ExecutorConfig {
                init_timeout_secs: 2,
                action_timeout_secs: 2,
                ..Default::default()
            },
            ttl: Duration::from_secs(30),
            devices: Vec::new(),
            history: None,
        }
    }

    fn scripted(driver: &ScriptedDriver) -> Self {
        Self::new(Arc::new(driver.clone()))
    }

    fn device(mut self, id: &str, containers: bool) -> Self {
        self.devices.push((id.to_string(), containers));
        self
    }

    fn max_jobs(mut self, max: usize) -> Self {
        self.config.max_concurrent_jobs = max;
        self
    }

    fn max_failed_accounts(mut self, max: usize) -> Self {
        self.config.max_failed_accounts = Some(max);
        self
    }

    fn init_timeout_secs(mut self, secs: u64) -> Self {
        self.config.init_timeout_secs = secs;
        self
    }

    fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn history(mut self, history: Arc<dyn JobHistory>) -> Self {
        self.history = Some(history);
        self
    }

    fn build(self) -> Farm {
        let heartbeat = Arc::new(AgentHeartbeatTracker::new(self.ttl));
        let deps = ExecutorDeps {
            pool: Arc::new(DevicePool::new(Arc::clone(&heartbeat))),
            heartbeat,
            driver: self.driver,
            coordinator: Arc::new(ContainerSwitchCoordinator::new(
                Duration::from_millis(200),
                Duration::from_millis(5),
            )),
            broadcaster: Arc::new(StatusBroadcaster::new(1024)),
            templates: Arc::new(ConfigTemplates::new(vec![TemplateDefinition {
                name: "daily".to_string(),
                description: String::new(),
                actions: vec![
                    Action::new("launch", json!({ "package": "com.example.app" })),
                    Action::new("like", json!({ "count": 3, "as": "{account}" })),
                ],
            }])),
            history: self
                .history
                .unwrap_or_else(|| Arc::new(MemoryHistory::new(self.config.history_limit))),
        };

        let executor = ConcurrentJobExecutor::new(deps, &self.config);
        executor
            .register_agent(AgentRegistration {
                agent_id: "agent-1".to_string(),
                host: "127.0.0.1".to_string(),
                port: 7912,
                devices: self
                    .devices
                    .iter()
                    .map(|(id, containers)| DeviceSpec {
                        device_id: id.clone(),
                        hardware_id: format!("hw-{}", id),
                        serial: None,
                        supports_containers: *containers,
                    })
                    .collect(),
            })
            .unwrap();

        Farm { executor }
    }
}

fn request(device: &str, accounts: &[&str]) -> JobRequest {
    JobRequest {
        device_id: device.to_string(),
        account_ids: accounts.iter().map(|a| a.to_string()).collect(),
        template: "daily".to_string(),
    }
}

impl Farm {
    async fn finish(&self, job_id: JobId) -> Job {
        timeout(WAIT, self.executor.wait(job_id))
            .await
            .expect("任务未在预期时间内结束")
            .expect("任务不在历史中")
    }

    fn assert_free(&self, device: &str) {
        let device = self.executor.pool().get(device).unwrap();
        assert!(device.allocation.holder().is_none());
        assert_eq!(device.acquisitions, device.releases);
    }
}

/// 收集某个任务的状态序列直到终态
async fn collect_states(
    subscription: &mut crate::farm::broadcast::Subscription<StatusEvent>,
    job_id: JobId,
) -> Vec<JobState> {
    let mut states: Vec<JobState> = Vec::new();
    loop {
        let event = timeout(WAIT, subscription.recv()).await.unwrap().unwrap();
        if let StatusEvent::JobStatus(status) = event {
            if status.job_id != job_id {
                continue;
            }
            if states.last() != Some(&status.state) {
                states.push(status.state);
            }
            if status.state.is_terminal() {
                return states;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_same_device_single_winner() {
    let driver = ScriptedDriver::new().with_action_delay(Duration::from_millis(100));
    let farm = FarmBuilder::scripted(&driver).device("D1", false).build();

    let submissions = (0..16).map(|_| {
        let executor = Arc::clone(&farm.executor);
        tokio::spawn(async move { executor.submit(request("D1", &["A1"])) })
    });
    let results: Vec<_> = futures::future::join_all(submissions)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let admitted: Vec<JobId> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(admitted.len(), 1);
    assert!(
        results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| *r == Err(SubmitRejection::DeviceBusy))
    );

    let job = farm.finish(admitted[0]).await;
    assert_eq!(job.state, JobState::Completed);
    farm.assert_free("D1");
}

#[tokio::test]
async fn test_busy_then_resubmit_after_completion() {
    let driver = ScriptedDriver::new().with_action_delay(Duration::from_millis(10));
    let farm = FarmBuilder::scripted(&driver).device("D1", false).build();

    let first = farm.executor.submit(request("D1", &["A1", "A2"])).unwrap();
    assert_eq!(
        farm.executor.submit(request("D1", &["A3"])),
        Err(SubmitRejection::DeviceBusy)
    );

    let job = farm.finish(first).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.results.len(), 2);
    assert!(job.results.iter().all(|r| r.success));
    assert!(job.started_at.is_some() && job.completed_at.is_some());

    let second = farm.executor.submit(request("D1", &["A3"])).unwrap();
    assert_eq!(farm.finish(second).await.state, JobState::Completed);

    let device = farm.executor.pool().get("D1").unwrap();
    assert_eq!(device.acquisitions, 2);
    assert_eq!(device.releases, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resubmit_right_after_terminal_event() {
    let driver = ScriptedDriver::new();
    let farm = FarmBuilder::scripted(&driver).device("D1", false).build();
    let mut subscription = farm.executor.broadcaster().subscribe();

    let mut job_id = farm.executor.submit(request("D1", &["A1"])).unwrap();
    for _ in 0..50 {
        let states = collect_states(&mut subscription, job_id).await;
        assert_eq!(states.last(), Some(&JobState::Completed));

        // 收到终态事件时任务已经归档，设备可以立即再次提交
        assert_eq!(farm.executor.active_count(), 0);
        assert_eq!(farm.executor.status(job_id).await.unwrap().state, JobState::Completed);
        job_id = farm.executor.submit(request("D1", &["A1"])).unwrap();
    }

    assert_eq!(farm.finish(job_id).await.state, JobState::Completed);
    farm.assert_free("D1");
}

/// 永远写入失败的历史
struct BrokenHistory;

#[async_trait]
impl JobHistory for BrokenHistory {
    fn append(&self, _job: Job) -> Result<(), crate::error::AppError> {
        Err(crate::error::AppError::IoError(std::io::Error::other("磁盘已满")))
    }

    fn recent(&self, _n: usize) -> Vec<Job> {
        Vec::new()
    }

    async fn get(&self, _id: JobId) -> Option<Job> {
        None
    }
}

#[tokio::test]
async fn test_job_reachable_when_history_append_fails() {
    let driver = ScriptedDriver::new();
    let farm = FarmBuilder::scripted(&driver)
        .device("D1", false)
        .history(Arc::new(BrokenHistory))
        .build();

    let job_id = farm.executor.submit(request("D1", &["A1"])).unwrap();
    let job = farm.finish(job_id).await;
    assert_eq!(job.state, JobState::Completed);

    assert_eq!(farm.executor.status(job_id).await.unwrap().state, JobState::Completed);
    let listing = farm.executor.list();
    assert!(listing.active.is_empty());
    assert_eq!(listing.recent_history.len(), 1);
    assert_eq!(listing.recent_history[0].id, job_id);

    // 设备已释放，可以再次提交
    farm.assert_free("D1");
    assert!(farm.executor.submit(request("D1", &["A2"])).is_ok());
}

#[tokio::test]
async fn test_state_sequence_is_monotonic() {
    let driver = ScriptedDriver::new();
    let farm = FarmBuilder::scripted(&driver)
        .device("D1", true)
        .device("D2", false)
        .build();
    let mut subscription = farm.executor.broadcaster().subscribe();

    let with_containers = farm.executor.submit(request("D1", &["A1", "A2"])).unwrap();
    let states = collect_states(&mut subscription, with_containers).await;
    assert_eq!(
        states,
        vec![
            JobState::Pending,
            JobState::Initializing,
            JobState::ContainerSwitching,
            JobState::Executing,
            JobState::Completed,
        ]
    );

    let plain = farm.executor.submit(request("D2", &["A1"])).unwrap();
    let states = collect_states(&mut subscription, plain).await;
    assert_eq!(
        states,
        vec![
            JobState::Pending,
            JobState::Initializing,
            JobState::Executing,
            JobState::Completed,
        ]
    );
    assert!(states.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_partial_switch_failure_continues() {
    let driver = ScriptedDriver::new().with_broken_switch("A1");
    let farm = FarmBuilder::scripted(&driver).device("D1", true).build();
    let mut subscription = farm.executor.broadcaster().subscribe();

    let job_id = farm.executor.submit(request("D1", &["A1", "A2", "A3"])).unwrap();
    let states = collect_states(&mut subscription, job_id).await;
    assert!(states.contains(&JobState::Executing));

    let job = farm.finish(job_id).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.results.len(), 3);
    assert!(!job.results[0].success);
    assert!(job.results[1].success && job.results[2].success);
    assert_eq!(job.results[2].container_id.as_deref(), Some("ctr-A3"));
    assert!(
        job.errors
            .iter()
            .any(|e| e.account_id.as_deref() == Some("A1") && e.stage == JobState::ContainerSwitching)
    );

    // 切换失败的账号不执行动作
    assert!(!driver.kinds_for("A1").contains(&"launch".to_string()));
    assert!(driver.kinds_for("A2").contains(&"like".to_string()));
    assert_eq!(farm.executor.coordinator().binding("D1").unwrap().account_id, "A3");
    farm.assert_free("D1");
}

#[tokio::test]
async fn test_all_switches_failed() {
    let driver = ScriptedDriver::new()
        .with_broken_switch("A1")
        .with_flaky_switch("A2", 5);
    let farm = FarmBuilder::scripted(&driver).device("D1", true).build();
    let mut subscription = farm.executor.broadcaster().subscribe();

    let job_id = farm.executor.submit(request("D1", &["A1", "A2"])).unwrap();
    let states = collect_states(&mut subscription, job_id).await;
    assert!(!states.contains(&JobState::Executing));

    let job = farm.finish(job_id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureReason::AllSwitchesFailed));
    assert_eq!(job.progress, 30);
    assert_eq!(job.retries.get(&JobState::ContainerSwitching), Some(&1));
    farm.assert_free("D1");
}

#[tokio::test]
async fn test_concurrency_bound() {
    let driver = ScriptedDriver::new().with_action_delay(Duration::from_millis(50));
    let mut builder = FarmBuilder::scripted(&driver).max_jobs(3);
    for i in 0..5 {
        builder = builder.device(&format!("D{}", i), false);
    }
    let farm = builder.build();

    let results: Vec<_> = (0..5)
        .map(|i| farm.executor.submit(request(&format!("D{}", i), &["A1"])))
        .collect();

    let admitted: Vec<JobId> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    let limited = results
        .iter()
        .filter(|r| **r == Err(SubmitRejection::ConcurrencyLimit))
        .count();
    assert_eq!(admitted.len(), 3);
    assert_eq!(limited, 2);
    assert_eq!(farm.executor.snapshot().active_count, 3);

    for job_id in admitted {
        assert_eq!(farm.finish(job_id).await.state, JobState::Completed);
    }
    assert_eq!(farm.executor.active_count(), 0);
}

#[tokio::test]
async fn test_liveness_expiry_fails_holding_job() {
    let driver = ScriptedDriver::new().with_action_delay(Duration::from_millis(100));
    let farm = FarmBuilder::scripted(&driver)
        .device("D1", false)
        .device("D2", false)
        .ttl(Duration::from_millis(300))
        .build();
    let mut subscription = farm.executor.broadcaster().subscribe();

    let job_id = farm
        .executor
        .submit(request("D1", &["A1", "A2", "A3", "A4", "A5", "A6"]))
        .unwrap();

    let shutdown = CancellationToken::new();
    let sweeper = farm
        .executor
        .spawn_liveness_sweeper(Duration::from_millis(50), shutdown.clone());

    let job = farm.finish(job_id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureReason::DeviceLost));
    assert!(!farm.executor.pool().get("D1").unwrap().online);
    farm.assert_free("D1");

    let mut offline_events = 0;
    while let Some(event) = subscription.try_recv() {
        if matches!(event, StatusEvent::DeviceOffline(_)) {
            offline_events += 1;
        }
    }
    assert_eq!(offline_events, 2);

    // 离线设备不再受理新任务
    assert_eq!(
        farm.executor.submit(request("D2", &["A1"])),
        Err(SubmitRejection::DeviceUnavailable)
    );

    // 心跳恢复后重新可用
    let ids: Vec<DeviceId> = vec!["D1".to_string(), "D2".to_string()];
    let ack = farm.executor.record_heartbeat("agent-1", &ids);
    assert_eq!(ack.recovered.len(), 2);
    assert!(farm.executor.submit(request("D2", &["A1"])).is_ok());

    shutdown.cancel();
    sweeper.await.unwrap();
}

#[tokio::test]
async fn test_stop_between_accounts() {
    let driver = ScriptedDriver::new().with_action_delay(Duration::from_millis(30));
    let farm = FarmBuilder::scripted(&driver).device("D1", false).build();

    let job_id = farm
        .executor
        .submit(request("D1", &["A1", "A2", "A3", "A4", "A5"]))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(farm.executor.stop(job_id));

    let job = farm.finish(job_id).await;
    assert_eq!(job.state, JobState::Stopped);
    assert!(!job.results.is_empty() && job.results.len() < 5);
    // 已开始的账号执行完整
    assert!(job.results.iter().all(|r| r.actions_run == 2));
    assert!(!farm.executor.stop(job_id));
    farm.assert_free("D1");
}

#[tokio::test]
async fn test_stop_unknown_job() {
    let farm = FarmBuilder::scripted(&ScriptedDriver::new()).build();
    assert!(!farm.executor.stop(uuid::Uuid::new_v4()));
    assert!(farm.executor.status(uuid::Uuid::new_v4()).await.is_none());
}

#[tokio::test]
async fn test_init_timeout() {
    let driver = ScriptedDriver::new().with_connect_delay(Duration::from_secs(3));
    let farm = FarmBuilder::scripted(&driver)
        .device("D1", false)
        .init_timeout_secs(1)
        .build();

    let job = farm.finish(farm.executor.submit(request("D1", &["A1"])).unwrap()).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureReason::InitTimeout));
    assert_eq!(job.progress, 10);
    farm.assert_free("D1");
}

#[tokio::test]
async fn test_connect_error_fails_init() {
    let driver = ScriptedDriver::new().with_connect_error(DriverError::Connection("refused".into()));
    let farm = FarmBuilder::scripted(&driver).device("D1", false).build();

    let job = farm.finish(farm.executor.submit(request("D1", &["A1"])).unwrap()).await;
    assert_eq!(job.failure, Some(FailureReason::InitTimeout));
    assert!(job.errors[0].message.contains("refused"));
}

#[tokio::test]
async fn test_failed_actions_recorded_per_account() {
    let driver = ScriptedDriver::new().with_failing_action("A1", "like");
    let farm = FarmBuilder::scripted(&driver).device("D1", false).build();

    let job = farm
        .finish(farm.executor.submit(request("D1", &["A1", "A2"])).unwrap())
        .await;

    assert_eq!(job.state, JobState::Completed);
    assert!(!job.results[0].success);
    assert_eq!(job.results[0].actions_failed, 1);
    assert!(job.results[1].success);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].stage, JobState::Executing);
}

#[tokio::test]
async fn test_failed_account_threshold() {
    let driver = ScriptedDriver::new().with_failing_action("A1", "launch");
    let farm = FarmBuilder::scripted(&driver)
        .device("D1", false)
        .max_failed_accounts(0)
        .build();

    let job = farm
        .finish(farm.executor.submit(request("D1", &["A1", "A2"])).unwrap())
        .await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureReason::TooManyAccountFailures));
    assert_eq!(job.results.len(), 1);
    assert!(driver.kinds_for("A2").is_empty());
}

#[tokio::test]
async fn test_all_switches_failed_reported_under_threshold() {
    let driver = ScriptedDriver::new()
        .with_broken_switch("A1")
        .with_broken_switch("A2")
        .with_broken_switch("A3");
    let farm = FarmBuilder::scripted(&driver)
        .device("D1", true)
        .max_failed_accounts(0)
        .build();

    let job = farm
        .finish(farm.executor.submit(request("D1", &["A1", "A2", "A3"])).unwrap())
        .await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureReason::AllSwitchesFailed));
    assert_eq!(job.results.len(), 3);
}

#[tokio::test]
async fn test_threshold_counts_switch_failures_after_first_success() {
    let driver = ScriptedDriver::new()
        .with_broken_switch("A1")
        .with_broken_switch("A3");
    let farm = FarmBuilder::scripted(&driver)
        .device("D1", true)
        .max_failed_accounts(1)
        .build();

    let job = farm
        .finish(farm.executor.submit(request("D1", &["A1", "A2", "A3", "A4"])).unwrap())
        .await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureReason::TooManyAccountFailures));
    assert_eq!(job.results.len(), 3);
    assert!(driver.kinds_for("A4").is_empty());
}

#[tokio::test]
async fn test_admission_rejections() {
    let farm = FarmBuilder::scripted(&ScriptedDriver::new())
        .device("D1", false)
        .build();

    assert_eq!(
        farm.executor.submit(request("missing", &["A1"])),
        Err(SubmitRejection::DeviceNotFound)
    );
    assert!(matches!(
        farm.executor.submit(request("D1", &[])),
        Err(SubmitRejection::InvalidRequest(_))
    ));
    assert!(matches!(
        farm.executor.submit(request("", &["A1"])),
        Err(SubmitRejection::InvalidRequest(_))
    ));

    let mut unknown = request("D1", &["A1"]);
    unknown.template = "weekly".to_string();
    assert_eq!(
        farm.executor.submit(unknown),
        Err(SubmitRejection::TemplateNotFound("weekly".to_string()))
    );

    assert_eq!(farm.executor.active_count(), 0);
}

#[tokio::test]
async fn test_status_and_listing() {
    let driver = ScriptedDriver::new().with_action_delay(Duration::from_millis(30));
    let farm = FarmBuilder::scripted(&driver)
        .device("D1", false)
        .device("D2", false)
        .build();

    let quick = farm.executor.submit(request("D1", &["A1"])).unwrap();
    farm.finish(quick).await;

    let slow = farm.executor.submit(request("D2", &["A1", "A2", "A3"])).unwrap();
    let listing = farm.executor.list();
    assert_eq!(listing.active.len(), 1);
    assert_eq!(listing.active[0].id, slow);
    assert_eq!(listing.recent_history.len(), 1);
    assert_eq!(listing.recent_history[0].id, quick);

    assert!(!farm.executor.status(slow).await.unwrap().is_terminal());
    assert_eq!(farm.executor.status(quick).await.unwrap().state, JobState::Completed);

    farm.executor.shutdown().await;
    assert_eq!(farm.executor.status(slow).await.unwrap().state, JobState::Stopped);
    assert_eq!(farm.executor.active_count(), 0);
}

/// 连接时直接 panic 的驱动
struct PanickingDriver;

#[async_trait]
impl AutomationDriver for PanickingDriver {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn connect(&self, _device: &Device) -> Result<Arc<dyn DriverSession>, DriverError> {
        panic!("driver exploded");
    }
}

#[tokio::test]
async fn test_pipeline_panic_is_isolated() {
    let farm = FarmBuilder::new(Arc::new(PanickingDriver))
        .device("D1", false)
        .build();

    let job = farm.finish(farm.executor.submit(request("D1", &["A1"])).unwrap()).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureReason::Internal));
    farm.assert_free("D1");

    // 执行器仍可继续受理任务
    assert!(farm.executor.submit(request("D1", &["A1"])).is_ok());
}
