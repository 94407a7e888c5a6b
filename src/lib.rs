pub mod config;
pub mod error;
pub mod log;
pub mod params;
pub mod plan;

// Scheduling engine
pub mod core;
pub mod orchestration;

pub use crate::core::{CleanupPolicy, JobState, Schedule, ScheduleBuilder, ScheduleDef};
pub use error::{Error, Result};
pub use orchestration::{
    job_fn, Executor, ExecutorConfig, JobContext, ResultAggregate, ResultRecord, RunStatus,
};
