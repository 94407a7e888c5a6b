//! Per-job result records and the final run report.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::job::{Job, JobState};
use crate::error::{Error, Result};
use crate::orchestration::cleanup::CleanupReport;

/// Unique identifier for one executor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    /// The run was cancelled before every job could run.
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub name: String,
    pub state: JobState,
    pub phase: String,
    pub description: String,
    pub optional: bool,
    pub attempts: u32,
    /// Body output, when the job succeeded.
    pub output: Option<Value>,
    /// Last error, when the job failed or was skipped.
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub cleanup: Option<CleanupReport>,
}

impl ResultRecord {
    fn base(job: &Job, state: JobState) -> Self {
        Self {
            name: job.name.clone(),
            state,
            phase: job.automation_phase.clone(),
            description: job.description.clone(),
            optional: job.optional,
            attempts: 0,
            output: None,
            error: None,
            started_at: None,
            finished_at: Utc::now(),
            cleanup: None,
        }
    }

    pub fn success(job: &Job, attempts: u32, output: Value, started_at: DateTime<Utc>) -> Self {
        Self {
            attempts,
            output: Some(output),
            started_at: Some(started_at),
            ..Self::base(job, JobState::Success)
        }
    }

    pub fn failed(
        job: &Job,
        attempts: u32,
        error: String,
        started_at: DateTime<Utc>,
        cleanup: Option<CleanupReport>,
    ) -> Self {
        Self {
            attempts,
            error: Some(error),
            started_at: Some(started_at),
            cleanup,
            ..Self::base(job, JobState::Failed)
        }
    }

    pub fn skipped(job: &Job, reason: String) -> Self {
        Self {
            error: Some(reason),
            ..Self::base(job, JobState::Skipped)
        }
    }
}

/// Final report of a run: one record per job in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultAggregate {
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: Vec<ResultRecord>,
}

impl ResultAggregate {
    pub fn get_results(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn record(&self, name: &str) -> Option<&ResultRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn state_of(&self, name: &str) -> Option<JobState> {
        self.record(name).map(|r| r.state)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn failed_jobs(&self) -> Vec<&str> {
        self.names_in(JobState::Failed)
    }

    pub fn skipped_jobs(&self) -> Vec<&str> {
        self.names_in(JobState::Skipped)
    }

    fn names_in(&self, state: JobState) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.state == state)
            .map(|r| r.name.as_str())
            .collect()
    }
}

/// Collects records as jobs reach terminal states.
///
/// Records arrive in completion order but are slotted by declaration order.
/// A slot is written once and never changed afterwards.
#[derive(Debug)]
pub struct ResultAggregator {
    run_id: RunId,
    started_at: DateTime<Utc>,
    positions: HashMap<String, usize>,
    slots: Vec<Option<ResultRecord>>,
    cancelled: bool,
}

impl ResultAggregator {
    /// Create an aggregator for jobs declared in the order of `names`.
    pub fn new<'a>(run_id: RunId, names: impl IntoIterator<Item = &'a str>) -> Self {
        let positions: HashMap<String, usize> = names
            .into_iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i))
            .collect();
        let slots = vec![None; positions.len()];
        Self {
            run_id,
            started_at: Utc::now(),
            positions,
            slots,
            cancelled: false,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Insert a terminal record.
    ///
    /// # Errors
    /// Fails for a non-terminal state, an unknown job, or a job that already
    /// has a record.
    pub fn insert(&mut self, record: ResultRecord) -> Result<()> {
        if !record.state.is_terminal() {
            return Err(Error::InvalidTransition {
                job: record.name,
                from: "record".into(),
                to: record.state.to_string(),
            });
        }
        let position = *self
            .positions
            .get(&record.name)
            .ok_or_else(|| Error::config(format!("no job named {}", record.name)))?;
        let slot = &mut self.slots[position];
        if let Some(existing) = slot {
            return Err(Error::InvalidTransition {
                job: record.name,
                from: existing.state.to_string(),
                to: record.state.to_string(),
            });
        }
        *slot = Some(record);
        Ok(())
    }

    /// Mark the run as cut short by cancellation.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn recorded(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Close the run and produce the aggregate.
    ///
    /// A cancelled run is reported as cancelled. Otherwise the run failed if
    /// any non-optional job ended `failed`.
    pub fn finalize_jobs(self) -> ResultAggregate {
        let records: Vec<ResultRecord> = self.slots.into_iter().flatten().collect();
        let status = if self.cancelled {
            RunStatus::Cancelled
        } else if records
            .iter()
            .any(|r| r.state == JobState::Failed && !r.optional)
        {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        ResultAggregate {
            run_id: self.run_id,
            status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            records,
        }
    }
}
