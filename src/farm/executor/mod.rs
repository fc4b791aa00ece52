//! 并发任务执行模块

#[allow(clippy::module_inception)]
mod executor;
mod history;
#[cfg(test)]
mod tests;

pub use executor::{AgentRegistration, ConcurrentJobExecutor, JobListing, SubmitRejection};
