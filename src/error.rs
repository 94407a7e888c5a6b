use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    /// Invalid schedule: cycle, dangling reference, bad field. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Parameter error: {0}")]
    Parameter(String),

    /// A single attempt of a job body failed.
    #[error("Job body failed: {0}")]
    Body(String),

    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Retry budget exhausted.
    #[error("Job {job} failed after {attempts} attempt(s): {error}")]
    JobFailed {
        job: String,
        attempts: u32,
        error: String,
    },

    #[error("Parallel member {member} failed: {error}")]
    ParallelMember { member: String, error: String },

    /// `failures` holds `(member label, error)` for every failed member.
    #[error("{failed} of {total} parallel member(s) failed: {}", member_failures(.failures))]
    ParallelGroup {
        failed: usize,
        total: usize,
        failures: Vec<(String, String)>,
    },

    #[error("Cleanup of job {job} failed: {error}")]
    Cleanup { job: String, error: String },

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid state transition for {job}: {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: String,
        to: String,
    },
}

impl Error {
    /// Whether an attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Configuration(_)
                | Error::Parameter(_)
                | Error::Cancelled
                | Error::InvalidTransition { .. }
        )
    }

    pub fn body(msg: impl Into<String>) -> Self {
        Error::Body(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}

fn member_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(member, error)| format!("{}: {}", member, error))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
