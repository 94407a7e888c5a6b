//! Execution layer: the executor control loop and everything a running job
//! touches, from its context and parallel groups to cleanup and results.

mod cleanup;
mod context;
mod executor;
mod parallel;
mod resources;
mod results;

pub use cleanup::{CleanupDecision, CleanupEnforcer, CleanupReport};
pub use context::{
    job_fn, noop_body, BodyFuture, ContextSeed, Dispatch, ExecutionMode, JobBody, JobContext,
    ModeKind,
};
pub use executor::{Executor, ExecutorConfig, ExecutorEvent};
pub use parallel::{GroupReport, MemberOutcome, ParallelGroup};
pub use resources::{
    MemoryResources, NoopProvisioner, Provisioner, ResourceLedger, ResourceLookup,
    ResourceQuery, ResourceRef, Teardown,
};
pub use results::{ResultAggregate, ResultAggregator, ResultRecord, RunId, RunStatus};
