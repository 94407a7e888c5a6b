//! Retry budget, timeout and cleanup policy tests.
//!
//! These tests verify attempt bounds, retry timing and that cleanup runs at
//! most once per job, only after the retry budget is exhausted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use stacksched::core::ScheduleBuilder;
use stacksched::orchestration::{
    job_fn, CleanupDecision, Executor, ExecutorConfig, ExecutorEvent, ResourceRef,
};
use stacksched::{CleanupPolicy, Error, JobState, ScheduleDef};

use crate::fixtures::{def, drain_events, flaky_body, ok_body, CallCounter, FakeCloud};

fn vm() -> ResourceRef {
    ResourceRef::new("server", "prod-vm-0")
}

fn schedule_with(def: ScheduleDef, body: stacksched::orchestration::JobBody) -> stacksched::Schedule {
    let mut builder = ScheduleBuilder::new();
    builder.add_schedule(def, body).unwrap();
    builder.get_schedules().unwrap()
}

/// Test: attempts never exceed retries + 1
/// Given jobs with retry budgets 0..=3 whose bodies always fail
/// When each runs
/// Then exactly R+1 attempts are made
#[tokio::test(start_paused = true)]
async fn test_attempts_exactly_budget_when_all_fail() {
    for retries in 0..=3i64 {
        let counter = CallCounter::new();
        let builder = ScheduleBuilder::new();
        let mut d = def(&builder, "bastion", &[], &[]);
        d.retries = retries;
        let schedule = schedule_with(d, flaky_body(counter.clone(), u32::MAX, None));

        let result = Executor::new(ExecutorConfig::default())
            .run(&schedule)
            .await
            .unwrap();

        let record = result.record("bastion").unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts as i64, retries + 1);
        assert_eq!(counter.count() as i64, retries + 1);
    }
}

/// Test: a job stops retrying as soon as an attempt succeeds
#[tokio::test(start_paused = true)]
async fn test_attempts_stop_at_first_success() {
    let counter = CallCounter::new();
    let builder = ScheduleBuilder::new();
    let mut d = def(&builder, "pem", &[], &[]);
    d.retries = 5;
    let schedule = schedule_with(d, flaky_body(counter.clone(), 2, None));

    let result = Executor::new(ExecutorConfig::default())
        .run(&schedule)
        .await
        .unwrap();

    let record = result.record("pem").unwrap();
    assert_eq!(record.state, JobState::Success);
    assert_eq!(record.attempts, 3);
    assert_eq!(counter.count(), 3);
    assert_eq!(record.output, Some(json!({"attempt": 3})));
}

/// Test: Scenario C - retry after the inter-retry wait
/// Given retries=1, timeout=1800s, timewait=120s
/// When attempt 1 fails and attempt 2 succeeds
/// Then the job succeeds with 2 attempts at least 120s apart
#[tokio::test(start_paused = true)]
async fn test_retry_waits_timewait_between_attempts() {
    let started: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let body = {
        let started = Arc::clone(&started);
        job_fn(move |ctx| {
            let started = Arc::clone(&started);
            async move {
                started.lock().unwrap().push(Instant::now());
                if ctx.attempt() == 1 {
                    Err(Error::body("cloud API throttled"))
                } else {
                    Ok(json!("configured"))
                }
            }
        })
    };
    let builder = ScheduleBuilder::new();
    let mut d = builder.new_schedule("configure");
    d.retries = 1;
    d.timeout = 1800;
    d.timewait = 120;
    let schedule = schedule_with(d, body);

    let (tx, mut rx) = mpsc::channel(32);
    let result = Executor::new(ExecutorConfig::default())
        .with_events(tx)
        .run(&schedule)
        .await
        .unwrap();

    let record = result.record("configure").unwrap();
    assert_eq!(record.state, JobState::Success);
    assert_eq!(record.attempts, 2);

    let started = started.lock().unwrap();
    assert_eq!(started.len(), 2);
    assert!(started[1] - started[0] >= Duration::from_secs(120));

    let events = drain_events(&mut rx);
    assert!(events.contains(&ExecutorEvent::AttemptFailed {
        job: "configure".into(),
        attempt: 1,
        error: "Job body failed: cloud API throttled".into(),
        retry_in: Duration::from_secs(120),
    }));
    // Intermediate failures never trigger cleanup.
    assert!(!events
        .iter()
        .any(|e| matches!(e, ExecutorEvent::CleanupFinished { .. })));
}

/// Test: cleanup runs once regardless of the number of attempts
#[tokio::test(start_paused = true)]
async fn test_cleanup_runs_once_after_retries() {
    let cloud = FakeCloud::new(&[vm()]);
    let builder = ScheduleBuilder::new();
    let mut d = def(&builder, "create", &[], &[]);
    d.retries = 3;
    let schedule = schedule_with(d, flaky_body(CallCounter::new(), u32::MAX, Some(vm())));

    let (tx, mut rx) = mpsc::channel(64);
    let result = Executor::new(ExecutorConfig::default())
        .with_provisioner(cloud.clone())
        .with_events(tx)
        .run(&schedule)
        .await
        .unwrap();

    let record = result.record("create").unwrap();
    assert_eq!(record.attempts, 4);
    assert_eq!(cloud.destroy_calls(), vec![vm()]);
    assert!(!cloud.is_live(&vm()));

    let report = record.cleanup.as_ref().unwrap();
    assert_eq!(report.decision, CleanupDecision::Cleared);
    assert_eq!(report.removed, vec![vm()]);

    let cleanups = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ExecutorEvent::CleanupFinished { .. }))
        .count();
    assert_eq!(cleanups, 1);
}

/// Test: keep_resources_on_failure suppresses cleanup entirely
#[tokio::test]
async fn test_keep_resources_on_failure_suppresses_cleanup() {
    let cloud = FakeCloud::new(&[vm()]);
    let builder = ScheduleBuilder::new();
    let mut d = def(&builder, "create", &[], &[]);
    d.keep_resources_on_failure = true;
    let schedule = schedule_with(d, flaky_body(CallCounter::new(), u32::MAX, Some(vm())));

    let result = Executor::new(ExecutorConfig::default())
        .with_provisioner(cloud.clone())
        .run(&schedule)
        .await
        .unwrap();

    let record = result.record("create").unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert!(cloud.destroy_calls().is_empty());
    assert!(cloud.is_live(&vm()));
    let report = record.cleanup.as_ref().unwrap();
    assert_eq!(report.decision, CleanupDecision::Suppressed);
    assert_eq!(report.retained, vec![vm()]);
}

/// Test: the keep policy leaves resources in place
#[tokio::test]
async fn test_keep_policy_retains_resources() {
    let cloud = FakeCloud::new(&[vm()]);
    let builder = ScheduleBuilder::new();
    let mut d = def(&builder, "create", &[], &[]);
    d.cleanup = CleanupPolicy::Keep;
    let schedule = schedule_with(d, flaky_body(CallCounter::new(), u32::MAX, Some(vm())));

    let result = Executor::new(ExecutorConfig::default())
        .with_provisioner(cloud.clone())
        .run(&schedule)
        .await
        .unwrap();

    let report = result.record("create").unwrap().cleanup.clone().unwrap();
    assert_eq!(report.decision, CleanupDecision::Kept);
    assert!(cloud.destroy_calls().is_empty());
}

/// Test: success and skip never trigger cleanup
#[tokio::test]
async fn test_no_cleanup_on_success_or_skip() {
    let cloud = FakeCloud::new(&[vm()]);
    let mut builder = ScheduleBuilder::new();
    builder
        .add_schedule(
            def(&builder, "create", &[], &[]),
            flaky_body(CallCounter::new(), 0, Some(vm())),
        )
        .unwrap();
    builder
        .add_schedule(
            def(&builder, "broken", &[], &[]),
            job_fn(|_| async { Err(Error::body("no capacity")) }),
        )
        .unwrap();
    builder
        .add_schedule(def(&builder, "after", &["broken"], &[]), ok_body("after"))
        .unwrap();
    let schedule = builder.get_schedules().unwrap();

    let result = Executor::new(ExecutorConfig::default())
        .with_provisioner(cloud.clone())
        .run(&schedule)
        .await
        .unwrap();

    assert_eq!(result.state_of("create"), Some(JobState::Success));
    assert!(result.record("create").unwrap().cleanup.is_none());
    assert_eq!(result.state_of("after"), Some(JobState::Skipped));
    assert!(result.record("after").unwrap().cleanup.is_none());
    // "broken" recorded nothing, so its cleanup touches no resource.
    assert!(cloud.destroy_calls().is_empty());
    assert!(cloud.is_live(&vm()));
}

/// Test: a cleanup failure never masks the job failure
#[tokio::test]
async fn test_cleanup_failure_does_not_mask_job_error() {
    let cloud = FakeCloud::new(&[vm()]);
    cloud.break_resource(vm());
    let mut builder = ScheduleBuilder::new();
    builder
        .add_schedule(
            def(&builder, "create", &[], &[]),
            job_fn(|ctx| async move {
                ctx.record_resource(vm());
                Err(Error::body("ansible playbook failed"))
            }),
        )
        .unwrap();
    builder
        .add_schedule(def(&builder, "sibling", &[], &[]), ok_body("sibling"))
        .unwrap();
    let schedule = builder.get_schedules().unwrap();

    let result = Executor::new(ExecutorConfig::default())
        .with_provisioner(cloud.clone())
        .run(&schedule)
        .await
        .unwrap();

    let record = result.record("create").unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(
        record.error.as_deref(),
        Some("Job body failed: ansible playbook failed")
    );
    let report = record.cleanup.as_ref().unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failed[0].0, vm());
    assert_eq!(result.state_of("sibling"), Some(JobState::Success));
}

/// Test: timed-out attempts count against the budget
#[tokio::test(start_paused = true)]
async fn test_every_attempt_times_out() {
    let counter = CallCounter::new();
    let body = {
        let counter = counter.clone();
        job_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.hit();
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
        })
    };
    let builder = ScheduleBuilder::new();
    let mut d = def(&builder, "bastion", &[], &[]);
    d.timeout = 30;
    d.retries = 2;
    let schedule = schedule_with(d, body);

    let begin = Instant::now();
    let result = Executor::new(ExecutorConfig::default())
        .run(&schedule)
        .await
        .unwrap();

    let record = result.record("bastion").unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(counter.count(), 3);
    assert_eq!(record.error.as_deref(), Some("Attempt timed out after 30s"));
    // Three timeouts plus two one-second waits, never the full hour.
    assert!(begin.elapsed() < Duration::from_secs(3600));
}

/// Test: runs can be driven from synchronous code
#[test]
fn test_run_from_blocking_context() {
    let builder = ScheduleBuilder::new();
    let schedule = schedule_with(def(&builder, "sshkey", &[], &[]), ok_body("sshkey"));

    let result = tokio_test::block_on(Executor::new(ExecutorConfig::default()).run(&schedule))
        .unwrap();
    assert!(result.is_success());
}
