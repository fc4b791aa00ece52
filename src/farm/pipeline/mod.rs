//! 任务执行流水线模块

mod job;
#[allow(clippy::module_inception)]
mod pipeline;
mod retry;
mod state;

pub use job::{Job, JobControl, JobError, JobRequest};
pub use pipeline::{JobExecutionPipeline, PipelineContext, PipelineSettings};
pub use retry::RetryPolicy;
pub use state::{FailureReason, JobState};
