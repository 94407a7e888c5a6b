//! Job definitions and execution states.
//!
//! A [`ScheduleDef`] is the mutable, serializable description of one job as
//! an author writes it. Committing it to a
//! [`ScheduleBuilder`](crate::core::ScheduleBuilder) validates the fields and
//! turns it into an immutable [`Job`] with typed durations and a registered
//! body.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_TIMEOUT_SECS, DEFAULT_TIMEWAIT_SECS};
use crate::error::{Error, Result};
use crate::orchestration::JobBody;

/// What to do with a job's provisioned resources after it terminally fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Tear down everything the job provisioned.
    #[default]
    Clear,
    /// Leave resources in place.
    Keep,
}

impl std::fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupPolicy::Clear => write!(f, "clear"),
            CleanupPolicy::Keep => write!(f, "keep"),
        }
    }
}

impl std::str::FromStr for CleanupPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "clear" => Ok(CleanupPolicy::Clear),
            "keep" => Ok(CleanupPolicy::Keep),
            other => Err(Error::config(format!("unknown cleanup policy {:?}", other))),
        }
    }
}

/// Execution state of a job within one run.
///
/// `Pending -> Running -> {Success | Failed}`, or `Pending -> Skipped` when an
/// upstream job did not succeed. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Skipped)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Skipped)
                | (JobState::Running, JobState::Success)
                | (JobState::Running, JobState::Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Success => write!(f, "success"),
            JobState::Failed => write!(f, "failed"),
            JobState::Skipped => write!(f, "skipped"),
        }
    }
}

/// Mutable definition of one job, as produced by `new_schedule()`.
///
/// Integer fields are signed so that invalid (negative) author input can be
/// reported instead of wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDef {
    pub job: String,
    #[serde(default)]
    pub automation_phase: String,
    #[serde(default)]
    pub human_description: String,
    /// Per-attempt timeout in seconds.
    pub timeout: i64,
    /// Wait between attempts in seconds.
    pub timewait: i64,
    pub retries: i64,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    #[serde(default)]
    pub keep_resources_on_failure: bool,
    #[serde(default)]
    pub dependency: Vec<String>,
    #[serde(default)]
    pub on_success: Vec<String>,
    /// Failures of optional jobs do not fail the run.
    #[serde(default)]
    pub optional: bool,
}

impl ScheduleDef {
    pub fn new(job: &str) -> Self {
        Self {
            job: job.to_string(),
            automation_phase: String::new(),
            human_description: String::new(),
            timeout: DEFAULT_TIMEOUT_SECS as i64,
            timewait: DEFAULT_TIMEWAIT_SECS as i64,
            retries: 0,
            cleanup: CleanupPolicy::Clear,
            keep_resources_on_failure: false,
            dependency: Vec::new(),
            on_success: Vec::new(),
            optional: false,
        }
    }

    /// Check the fields that can be judged without the rest of the schedule.
    pub fn validate_fields(&self) -> Result<()> {
        if self.timeout <= 0 {
            return Err(Error::config(format!(
                "job {}: timeout must be positive, got {}",
                self.job, self.timeout
            )));
        }
        if self.timewait < 0 {
            return Err(Error::config(format!(
                "job {}: timewait must not be negative, got {}",
                self.job, self.timewait
            )));
        }
        if self.retries < 0 || self.retries > u32::MAX as i64 {
            return Err(Error::config(format!(
                "job {}: retries out of range, got {}",
                self.job, self.retries
            )));
        }
        if self.dependency.iter().chain(&self.on_success).any(|n| n == &self.job) {
            return Err(Error::config(format!(
                "job {} references itself",
                self.job
            )));
        }
        Ok(())
    }
}

/// A committed job: immutable policy plus its body.
#[derive(Clone)]
pub struct Job {
    pub name: String,
    pub automation_phase: String,
    pub description: String,
    pub timeout: Duration,
    pub timewait: Duration,
    pub retries: u32,
    pub cleanup: CleanupPolicy,
    pub keep_resources_on_failure: bool,
    pub dependencies: Vec<String>,
    pub on_success: Vec<String>,
    pub optional: bool,
    pub body: JobBody,
}

impl Job {
    /// Build a job from a definition whose fields already passed
    /// [`ScheduleDef::validate_fields`].
    pub(crate) fn from_def(def: ScheduleDef, body: JobBody) -> Self {
        Self {
            name: def.job,
            automation_phase: def.automation_phase,
            description: def.human_description,
            timeout: Duration::from_secs(def.timeout as u64),
            timewait: Duration::from_secs(def.timewait as u64),
            retries: def.retries as u32,
            cleanup: def.cleanup,
            keep_resources_on_failure: def.keep_resources_on_failure,
            dependencies: def.dependency,
            on_success: def.on_success,
            optional: def.optional,
            body,
        }
    }

    /// The definition this job was committed from.
    pub fn definition(&self) -> ScheduleDef {
        ScheduleDef {
            job: self.name.clone(),
            automation_phase: self.automation_phase.clone(),
            human_description: self.description.clone(),
            timeout: self.timeout.as_secs() as i64,
            timewait: self.timewait.as_secs() as i64,
            retries: self.retries as i64,
            cleanup: self.cleanup,
            keep_resources_on_failure: self.keep_resources_on_failure,
            dependency: self.dependencies.clone(),
            on_success: self.on_success.clone(),
            optional: self.optional,
        }
    }

    /// Maximum number of attempts this job will make.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

impl Serialize for Job {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.definition().serialize(serializer)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("phase", &self.automation_phase)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("dependencies", &self.dependencies)
            .field("on_success", &self.on_success)
            .finish()
    }
}
