//! Post-failure cleanup of job resources.
//!
//! The enforcer runs once per job, only after the job's retry budget is
//! exhausted. Its own failures are reported and logged, but they never
//! replace the job failure that triggered cleanup.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::core::job::{CleanupPolicy, Job};
use crate::error::Error;
use crate::orchestration::resources::{Provisioner, ResourceLedger, ResourceRef, Teardown};
use crate::{slog, slog_error, slog_warn};

/// Why cleanup did or did not tear anything down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupDecision {
    /// `keep_resources_on_failure` was set.
    Suppressed,
    /// The cleanup policy was `keep`.
    Kept,
    /// The `clear` policy was applied.
    Cleared,
}

/// Report of cleanup performed for one failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub job: String,
    pub decision: CleanupDecision,
    /// Resources that were destroyed.
    pub removed: Vec<ResourceRef>,
    /// Resources that were already gone.
    pub absent: Vec<ResourceRef>,
    /// Resources that could not be destroyed, with the error.
    pub failed: Vec<(ResourceRef, String)>,
    /// Resources left in place because cleanup was suppressed or kept.
    pub retained: Vec<ResourceRef>,
}

impl CleanupReport {
    fn new(job: &str, decision: CleanupDecision) -> Self {
        Self {
            job: job.to_string(),
            decision,
            removed: Vec::new(),
            absent: Vec::new(),
            failed: Vec::new(),
            retained: Vec::new(),
        }
    }

    pub fn total_processed(&self) -> usize {
        self.removed.len() + self.absent.len() + self.failed.len()
    }

    /// Whether every teardown succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Applies the failure and cleanup policy of a terminally failed job.
#[derive(Clone)]
pub struct CleanupEnforcer {
    provisioner: Arc<dyn Provisioner>,
}

impl CleanupEnforcer {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self { provisioner }
    }

    /// Decide and apply cleanup for `job`.
    ///
    /// Teardown runs in reverse provisioning order. Resources already
    /// released in the ledger are not touched again, so calling this twice
    /// for the same ledger destroys nothing the second time. Each destroy is
    /// bounded by the job's timeout.
    pub async fn enforce(&self, job: &Job, ledger: &Mutex<ResourceLedger>) -> CleanupReport {
        let outstanding = ledger
            .lock()
            .map(|l| l.outstanding())
            .unwrap_or_else(|poisoned| poisoned.into_inner().outstanding());

        if job.keep_resources_on_failure {
            slog!(
                "job {}: keeping {} resource(s) for inspection",
                job.name,
                outstanding.len()
            );
            let mut report = CleanupReport::new(&job.name, CleanupDecision::Suppressed);
            report.retained = outstanding;
            return report;
        }

        if job.cleanup == CleanupPolicy::Keep {
            let mut report = CleanupReport::new(&job.name, CleanupDecision::Kept);
            report.retained = outstanding;
            return report;
        }

        let mut report = CleanupReport::new(&job.name, CleanupDecision::Cleared);
        for resource in outstanding {
            let outcome = tokio::time::timeout(job.timeout, self.provisioner.destroy(&resource))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Resource(format!("teardown timed out after {:?}", job.timeout)))
                });
            match outcome {
                Ok(teardown) => {
                    if let Ok(mut l) = ledger.lock() {
                        l.mark_released(&resource);
                    }
                    match teardown {
                        Teardown::Removed => report.removed.push(resource),
                        Teardown::AlreadyAbsent => report.absent.push(resource),
                    }
                }
                Err(e) => {
                    let failure = Error::Cleanup {
                        job: job.name.clone(),
                        error: format!("{}: {}", resource, e),
                    };
                    slog_error!("{}", failure);
                    report.failed.push((resource, failure.to_string()));
                }
            }
        }

        if report.is_success() {
            slog!(
                "job {}: cleanup removed {} resource(s), {} already absent",
                job.name,
                report.removed.len(),
                report.absent.len()
            );
        } else {
            slog_warn!(
                "job {}: cleanup left {} resource(s) behind",
                job.name,
                report.failed.len()
            );
        }
        report
    }
}
