//! Executor: the control loop that drives a [`Schedule`] to completion.
//!
//! One loop owns every job state. It dispatches ready jobs up to the
//! concurrency bound, waits for any running job to finish, skips jobs whose
//! upstream did not succeed, and repeats until nothing is left to run. Each
//! dispatched job runs its attempts in its own task.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DEFAULT_MAX_CONCURRENT_JOBS, DEFAULT_MAX_PARALLEL_MEMBERS};
use crate::core::job::{Job, JobState};
use crate::core::schedule::Schedule;
use crate::error::{Error, Result};
use crate::orchestration::cleanup::{CleanupDecision, CleanupEnforcer};
use crate::orchestration::context::ContextSeed;
use crate::orchestration::resources::{
    MemoryResources, NoopProvisioner, Provisioner, ResourceLookup,
};
use crate::orchestration::results::{
    ResultAggregate, ResultAggregator, ResultRecord, RunId, RunStatus,
};
use crate::{slog, slog_debug, slog_error, slog_warn};

/// Concurrency bounds for one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Independent top-level jobs running at once.
    pub max_concurrent_jobs: usize,
    /// Workers per parallel group.
    pub max_parallel_members: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            max_parallel_members: DEFAULT_MAX_PARALLEL_MEMBERS,
        }
    }
}

impl From<&Config> for ExecutorConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs,
            max_parallel_members: config.max_parallel_members,
        }
    }
}

/// Lifecycle notifications emitted while a run progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    JobStarted {
        job: String,
    },
    /// An attempt failed and another one will follow after `retry_in`.
    AttemptFailed {
        job: String,
        attempt: u32,
        error: String,
        retry_in: Duration,
    },
    JobSucceeded {
        job: String,
        attempts: u32,
    },
    JobFailed {
        job: String,
        attempts: u32,
        error: String,
    },
    JobSkipped {
        job: String,
        reason: String,
    },
    CleanupFinished {
        job: String,
        decision: CleanupDecision,
        failures: usize,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
    },
}

/// Optional event channel shared by the loop and every job task.
#[derive(Clone, Default)]
struct EventSink(Option<mpsc::Sender<ExecutorEvent>>);

impl EventSink {
    /// Never waits for the receiver. Events that do not fit in the channel
    /// are dropped, as are events sent after the receiver went away.
    fn emit(&self, event: ExecutorEvent) {
        if let Some(tx) = &self.0 {
            if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
                slog_debug!("event channel full, dropped {:?}", event);
            }
        }
    }
}

/// Runs schedules.
///
/// # Example
///
/// ```ignore
/// let executor = Executor::new(ExecutorConfig::default())
///     .with_resources(Arc::new(store))
///     .with_provisioner(Arc::new(cloud));
/// let result = executor.run(&schedule).await?;
/// assert!(result.is_success());
/// ```
pub struct Executor {
    config: ExecutorConfig,
    resources: Arc<dyn ResourceLookup>,
    cleanup: CleanupEnforcer,
    events: EventSink,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config: ExecutorConfig {
                max_concurrent_jobs: config.max_concurrent_jobs.max(1),
                max_parallel_members: config.max_parallel_members.max(1),
            },
            resources: Arc::new(MemoryResources::new()),
            cleanup: CleanupEnforcer::new(Arc::new(NoopProvisioner)),
            events: EventSink::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceLookup>) -> Self {
        self.resources = resources;
        self
    }

    /// Use `provisioner` for post-failure cleanup.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.cleanup = CleanupEnforcer::new(provisioner);
        self
    }

    /// Send [`ExecutorEvent`]s to `tx`. The executor never blocks on the
    /// channel: when it is full, further events are dropped until the
    /// receiver catches up.
    pub fn with_events(mut self, tx: mpsc::Sender<ExecutorEvent>) -> Self {
        self.events = EventSink(Some(tx));
        self
    }

    /// Token that cancels every run of this executor, current and future.
    /// Dispatch stops, running attempts fail with [`Error::Cancelled`],
    /// pending jobs are skipped and the run reports [`RunStatus::Cancelled`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A token scoped to a single run. Cancelling it stops only the run it
    /// is passed to; cancelling the executor token cancels it too.
    pub fn run_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn config(&self) -> ExecutorConfig {
        self.config
    }

    /// Run every job of `schedule` to a terminal state.
    ///
    /// Job failures do not make this return an error; they are reported in
    /// the aggregate. An error here means the executor itself broke an
    /// invariant.
    pub async fn run(&self, schedule: &Schedule) -> Result<ResultAggregate> {
        self.run_with(schedule, self.run_token()).await
    }

    /// Like [`Executor::run`], stopped early when `cancel` fires.
    pub async fn run_with(
        &self,
        schedule: &Schedule,
        cancel: CancellationToken,
    ) -> Result<ResultAggregate> {
        let run_id = RunId::new();
        let dag = schedule.dag();
        let mut states: HashMap<String, JobState> = schedule
            .jobs()
            .iter()
            .map(|j| (j.name.clone(), JobState::Pending))
            .collect();
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut aggregator = ResultAggregator::new(run_id, schedule.names());
        let mut running: JoinSet<ResultRecord> = JoinSet::new();
        let mut running_jobs: HashMap<tokio::task::Id, String> = HashMap::new();

        slog!(
            "run {}: starting {} job(s), max {} concurrent",
            run_id.short(),
            schedule.len(),
            self.config.max_concurrent_jobs
        );

        loop {
            // Skipping can unblock further skips, so repeat until stable.
            loop {
                let blocked: Vec<(String, String)> = dag
                    .blocked_jobs(&states)
                    .into_iter()
                    .map(|(job, upstream)| (job.to_string(), upstream.to_string()))
                    .collect();
                if blocked.is_empty() {
                    break;
                }
                for (name, upstream) in blocked {
                    let upstream_state = states.get(&upstream).copied().unwrap_or_default();
                    let reason = format!("upstream job {} ended {}", upstream, upstream_state);
                    self.skip(schedule, &mut states, &mut aggregator, &name, reason)?;
                }
            }

            if cancel.is_cancelled() {
                let pending: Vec<String> = pending_jobs(schedule, &states);
                if !pending.is_empty() {
                    aggregator.mark_cancelled();
                }
                for name in pending {
                    self.skip(
                        schedule,
                        &mut states,
                        &mut aggregator,
                        &name,
                        "run cancelled".into(),
                    )?;
                }
            } else {
                let capacity = self.config.max_concurrent_jobs.saturating_sub(running.len());
                let ready: Vec<String> = dag
                    .ready_jobs(&states)
                    .into_iter()
                    .take(capacity)
                    .map(String::from)
                    .collect();

                for name in ready {
                    let job = schedule
                        .job(&name)
                        .ok_or_else(|| Error::config(format!("no job named {}", name)))?
                        .clone();
                    transition(&mut states, &name, JobState::Running)?;

                    let upstream: HashMap<String, Value> = dag
                        .ancestors(&name)
                        .into_iter()
                        .filter_map(|a| outputs.get(a).map(|v| (a.to_string(), v.clone())))
                        .collect();
                    let seed = ContextSeed::new(&name)
                        .phase(&job.automation_phase)
                        .params(schedule.params())
                        .upstream(upstream)
                        .resources(Arc::clone(&self.resources))
                        .max_parallel_members(self.config.max_parallel_members);

                    slog!("run {}: dispatching job {}", run_id.short(), name);
                    self.events.emit(ExecutorEvent::JobStarted { job: name.clone() });

                    let runner = JobRunner {
                        job,
                        seed,
                        cleanup: self.cleanup.clone(),
                        events: self.events.clone(),
                        cancel: cancel.clone(),
                    };
                    let handle = running.spawn(runner.run());
                    running_jobs.insert(handle.id(), name);
                }
            }

            if running.is_empty() {
                break;
            }

            let record = match running.join_next_with_id().await {
                Some(Ok((id, record))) => {
                    running_jobs.remove(&id);
                    record
                }
                Some(Err(e)) => {
                    let name = running_jobs
                        .remove(&e.id())
                        .ok_or_else(|| Error::TaskJoin(e.to_string()))?;
                    slog_error!("run {}: job task {} aborted: {}", run_id.short(), name, e);
                    let job = schedule
                        .job(&name)
                        .ok_or_else(|| Error::config(format!("no job named {}", name)))?;
                    ResultRecord::failed(
                        job,
                        0,
                        Error::TaskJoin(e.to_string()).to_string(),
                        Utc::now(),
                        None,
                    )
                }
                None => break,
            };

            if record.state == JobState::Failed && cancel.is_cancelled() {
                aggregator.mark_cancelled();
            }
            transition(&mut states, &record.name, record.state)?;
            if let (JobState::Success, Some(output)) = (record.state, &record.output) {
                outputs.insert(record.name.clone(), output.clone());
            }
            aggregator.insert(record)?;
        }

        // Only reachable with a malformed graph; recorded rather than lost.
        for name in pending_jobs(schedule, &states) {
            self.skip(
                schedule,
                &mut states,
                &mut aggregator,
                &name,
                "never became ready".into(),
            )?;
        }

        let aggregate = aggregator.finalize_jobs();
        slog!(
            "run {}: finished {} ({} failed, {} skipped)",
            run_id.short(),
            aggregate.status,
            aggregate.failed_jobs().len(),
            aggregate.skipped_jobs().len()
        );
        self.events.emit(ExecutorEvent::RunFinished {
            run_id,
            status: aggregate.status,
        });
        Ok(aggregate)
    }

    fn skip(
        &self,
        schedule: &Schedule,
        states: &mut HashMap<String, JobState>,
        aggregator: &mut ResultAggregator,
        name: &str,
        reason: String,
    ) -> Result<()> {
        let job = schedule
            .job(name)
            .ok_or_else(|| Error::config(format!("no job named {}", name)))?;
        transition(states, name, JobState::Skipped)?;
        slog_warn!("job {} skipped: {}", name, reason);
        aggregator.insert(ResultRecord::skipped(job, reason.clone()))?;
        self.events.emit(ExecutorEvent::JobSkipped {
            job: name.to_string(),
            reason,
        });
        Ok(())
    }
}

fn pending_jobs(schedule: &Schedule, states: &HashMap<String, JobState>) -> Vec<String> {
    schedule
        .jobs()
        .iter()
        .filter(|j| states.get(&j.name) == Some(&JobState::Pending))
        .map(|j| j.name.clone())
        .collect()
}

/// Apply a state change, refusing any the state machine does not allow.
fn transition(states: &mut HashMap<String, JobState>, job: &str, next: JobState) -> Result<()> {
    let current = states
        .get_mut(job)
        .ok_or_else(|| Error::config(format!("no job named {}", job)))?;
    if !current.can_transition_to(next) {
        return Err(Error::InvalidTransition {
            job: job.to_string(),
            from: current.to_string(),
            to: next.to_string(),
        });
    }
    slog_debug!("job {}: {} -> {}", job, current, next);
    *current = next;
    Ok(())
}

/// Drives the attempts of one job inside its own task.
struct JobRunner {
    job: Job,
    seed: ContextSeed,
    cleanup: CleanupEnforcer,
    events: EventSink,
    cancel: CancellationToken,
}

impl JobRunner {
    async fn run(self) -> ResultRecord {
        let started_at = Utc::now();
        let max_attempts = self.job.max_attempts();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            slog_debug!(
                "job {}: attempt {}/{}",
                self.job.name,
                attempts,
                max_attempts
            );

            let error = match self.attempt(attempts).await {
                Ok(output) => {
                    slog!(
                        "job {}: succeeded after {} attempt(s)",
                        self.job.name,
                        attempts
                    );
                    self.events.emit(ExecutorEvent::JobSucceeded {
                        job: self.job.name.clone(),
                        attempts,
                    });
                    return ResultRecord::success(&self.job, attempts, output, started_at);
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempts >= max_attempts {
                return self.fail(attempts, error, started_at).await;
            }

            slog_warn!(
                "job {}: attempt {} failed, retrying in {:?}: {}",
                self.job.name,
                attempts,
                self.job.timewait,
                error
            );
            self.events.emit(ExecutorEvent::AttemptFailed {
                job: self.job.name.clone(),
                attempt: attempts,
                error: error.to_string(),
                retry_in: self.job.timewait,
            });

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return self.fail(attempts, Error::Cancelled, started_at).await;
                }
                _ = tokio::time::sleep(self.job.timewait) => {}
            }
        }
    }

    /// Run the body once under the job timeout, including the implicit join
    /// of a parallel group the body left open.
    async fn attempt(&self, attempt: u32) -> Result<Value> {
        let ctx = self.seed.attempt(attempt);
        let handle = ctx.clone();
        let body = self.job.body.call(ctx);

        let work = async {
            let output = AssertUnwindSafe(body)
                .catch_unwind()
                .await
                .map_err(|panic| {
                    Error::body(format!("job body panicked: {}", panic_message(&*panic)))
                })??;
            handle.settle().await?;
            Ok::<Value, Error>(output)
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            timed = tokio::time::timeout(self.job.timeout, work) => {
                timed.unwrap_or_else(|_| Err(Error::Timeout(self.job.timeout)))
            }
        };

        if result.is_err() {
            // Abandon members still running in this attempt's group.
            handle.reset_sequential();
        }
        result
    }

    /// Record a terminal failure. Cleanup runs here and nowhere else.
    async fn fail(
        &self,
        attempts: u32,
        error: Error,
        started_at: chrono::DateTime<Utc>,
    ) -> ResultRecord {
        let failure = Error::JobFailed {
            job: self.job.name.clone(),
            attempts,
            error: error.to_string(),
        };
        slog_error!("{}", failure);

        let ledger = self.seed.ledger();
        let report = self.cleanup.enforce(&self.job, &ledger).await;
        self.events.emit(ExecutorEvent::CleanupFinished {
            job: self.job.name.clone(),
            decision: report.decision,
            failures: report.failed.len(),
        });
        self.events.emit(ExecutorEvent::JobFailed {
            job: self.job.name.clone(),
            attempts,
            error: error.to_string(),
        });

        ResultRecord::failed(
            &self.job,
            attempts,
            error.to_string(),
            started_at,
            Some(report),
        )
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
