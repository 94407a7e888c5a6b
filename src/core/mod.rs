//! Core domain models: job definitions, the job DAG and finalized schedules.

pub mod dag;
pub mod job;
pub mod schedule;

pub use dag::{EdgeKind, JobDAG};
pub use job::{CleanupPolicy, Job, JobState, ScheduleDef};
pub use schedule::{Schedule, ScheduleBuilder, ScheduleWarning, WarningKind};
