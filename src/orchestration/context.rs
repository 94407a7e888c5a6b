//! Per-attempt execution context handed to job bodies.
//!
//! Every attempt gets a fresh [`JobContext`] that starts in sequential mode.
//! The sequential/parallel mode lives in the context, never in global state,
//! so one job toggling it cannot affect another job, a later attempt, or a
//! later run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::config::DEFAULT_MAX_PARALLEL_MEMBERS;
use crate::error::Result;
use crate::orchestration::parallel::{GroupReport, ParallelGroup};
use crate::orchestration::resources::{
    MemoryResources, ResourceLedger, ResourceLookup, ResourceQuery, ResourceRef,
};
use crate::params::Params;
use crate::slog_debug;

pub type BodyFuture = BoxFuture<'static, Result<Value>>;

/// The work a job performs, registered by name when the schedule is built.
#[derive(Clone)]
pub struct JobBody(Arc<dyn Fn(JobContext) -> BodyFuture + Send + Sync>);

impl JobBody {
    pub fn call(&self, ctx: JobContext) -> BodyFuture {
        (self.0)(ctx)
    }
}

impl std::fmt::Debug for JobBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JobBody(..)")
    }
}

/// Wrap an async closure as a [`JobBody`].
///
/// ```ignore
/// let body = job_fn(|ctx| async move {
///     ctx.record_resource(ResourceRef::new("ssh_key_pair", "prod-ssh-key"));
///     Ok(json!({"key_name": "prod-ssh-key"}))
/// });
/// ```
pub fn job_fn<F, Fut>(f: F) -> JobBody
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    JobBody(Arc::new(move |ctx| f(ctx).boxed()))
}

/// A body that does nothing and succeeds with `null`.
pub fn noop_body() -> JobBody {
    job_fn(|_| async { Ok(Value::Null) })
}

/// How sub-operations dispatched through [`JobContext::dispatch`] run.
pub enum ExecutionMode {
    Sequential,
    Parallel(ParallelGroup),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    Sequential,
    Parallel,
}

/// What happened to a dispatched sub-operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Ran inline to completion (sequential mode).
    Done(Value),
    /// Queued in the current parallel group.
    Spawned,
}

/// Everything about a job that stays the same across its attempts.
#[derive(Clone)]
pub struct ContextSeed {
    job: String,
    phase: String,
    params: Arc<Params>,
    upstream: Arc<HashMap<String, Value>>,
    resources: Arc<dyn ResourceLookup>,
    ledger: Arc<Mutex<ResourceLedger>>,
    max_parallel_members: usize,
}

impl ContextSeed {
    pub fn new(job: &str) -> Self {
        Self {
            job: job.to_string(),
            phase: String::new(),
            params: Arc::new(Params::empty()),
            upstream: Arc::new(HashMap::new()),
            resources: Arc::new(MemoryResources::new()),
            ledger: Arc::new(Mutex::new(ResourceLedger::new())),
            max_parallel_members: DEFAULT_MAX_PARALLEL_MEMBERS,
        }
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.phase = phase.to_string();
        self
    }

    pub fn params(mut self, params: Arc<Params>) -> Self {
        self.params = params;
        self
    }

    pub fn upstream(mut self, outputs: HashMap<String, Value>) -> Self {
        self.upstream = Arc::new(outputs);
        self
    }

    pub fn resources(mut self, resources: Arc<dyn ResourceLookup>) -> Self {
        self.resources = resources;
        self
    }

    pub fn max_parallel_members(mut self, max: usize) -> Self {
        self.max_parallel_members = max.max(1);
        self
    }

    /// The ledger shared by every attempt built from this seed.
    pub fn ledger(&self) -> Arc<Mutex<ResourceLedger>> {
        Arc::clone(&self.ledger)
    }

    /// Build the context for attempt number `attempt` (1-based).
    pub fn attempt(&self, attempt: u32) -> JobContext {
        JobContext {
            seed: Arc::new(self.clone()),
            attempt,
            mode: Arc::new(Mutex::new(ExecutionMode::Sequential)),
        }
    }
}

/// Handle given to a job body for one attempt.
///
/// Cloning is cheap; clones share the same mode and ledger.
#[derive(Clone)]
pub struct JobContext {
    seed: Arc<ContextSeed>,
    attempt: u32,
    mode: Arc<Mutex<ExecutionMode>>,
}

impl JobContext {
    pub fn job_name(&self) -> &str {
        &self.seed.job
    }

    pub fn phase(&self) -> &str {
        &self.seed.phase
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn params(&self) -> &Params {
        &self.seed.params
    }

    /// Output of an upstream job. Only jobs that already succeeded are
    /// visible.
    pub fn output_of(&self, job: &str) -> Option<&Value> {
        self.seed.upstream.get(job)
    }

    /// Outputs of every succeeded upstream job, in no particular order.
    pub fn upstream_outputs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.seed.upstream.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub async fn lookup(&self, query: &ResourceQuery) -> Result<Value> {
        self.seed.resources.lookup(query).await
    }

    /// Register a resource this job provisioned, so cleanup can find it.
    pub fn record_resource(&self, resource: ResourceRef) {
        slog_debug!("job {}: provisioned {}", self.seed.job, resource);
        lock(&self.seed.ledger).record(resource);
    }

    pub fn provisioned(&self) -> Vec<ResourceRef> {
        lock(&self.seed.ledger).all()
    }

    pub fn mode(&self) -> ModeKind {
        match &*lock(&self.mode) {
            ExecutionMode::Sequential => ModeKind::Sequential,
            ExecutionMode::Parallel(_) => ModeKind::Parallel,
        }
    }

    /// Enter parallel mode. Already being in parallel mode is a no-op, so
    /// the current group keeps its members.
    pub fn set_parallel(&self) {
        let mut mode = lock(&self.mode);
        if matches!(&*mode, ExecutionMode::Sequential) {
            slog_debug!("job {}: entering parallel mode", self.seed.job);
            *mode = ExecutionMode::Parallel(ParallelGroup::new(
                &self.seed.job,
                self.seed.max_parallel_members,
            ));
        }
    }

    /// Run a sub-operation: inline in sequential mode, as a group member in
    /// parallel mode.
    pub async fn dispatch<F>(&self, label: impl Into<String>, member: F) -> Result<Dispatch>
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let label: String = label.into();
        {
            let mut mode = lock(&self.mode);
            if let ExecutionMode::Parallel(group) = &mut *mode {
                group.spawn(label, member);
                return Ok(Dispatch::Spawned);
            }
        }
        slog_debug!("job {}: running {} inline", self.seed.job, label);
        Ok(Dispatch::Done(member.await?))
    }

    /// Leave parallel mode, blocking until every member is terminal.
    ///
    /// Returns member outputs in dispatch order, or an error if any member
    /// failed. In sequential mode this returns an empty list.
    pub async fn unset_parallel(&self) -> Result<Vec<Value>> {
        match self.join_outcomes().await {
            Some(report) => report.into_result(),
            None => Ok(Vec::new()),
        }
    }

    /// Like [`unset_parallel`](Self::unset_parallel) but returns every
    /// member outcome. `None` when not in parallel mode.
    pub async fn join_outcomes(&self) -> Option<GroupReport> {
        let taken = std::mem::replace(&mut *lock(&self.mode), ExecutionMode::Sequential);
        match taken {
            ExecutionMode::Parallel(group) => {
                slog_debug!(
                    "job {}: joining {} parallel member(s)",
                    self.seed.job,
                    group.len()
                );
                Some(group.join().await)
            }
            ExecutionMode::Sequential => None,
        }
    }

    /// Force sequential mode, aborting members of any open group without
    /// waiting for them.
    pub fn reset_sequential(&self) {
        let taken = std::mem::replace(&mut *lock(&self.mode), ExecutionMode::Sequential);
        if let ExecutionMode::Parallel(group) = taken {
            group.abort();
        }
    }

    /// Join a group the body left open. Called by the executor after the
    /// body returns.
    pub(crate) async fn settle(&self) -> Result<()> {
        self.unset_parallel().await.map(|_| ())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
