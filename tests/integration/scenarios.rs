//! End-to-end scheduling scenarios.
//!
//! These tests verify readiness, skip propagation and the shape of the final
//! aggregate for whole schedules.

use serde_json::json;

use stacksched::core::{ScheduleBuilder, ScheduleDef, WarningKind};
use stacksched::orchestration::{
    job_fn, CleanupDecision, Executor, ExecutorConfig, ResourceRef, RunStatus,
};
use stacksched::{Error, JobState};

use crate::fixtures::{
    def, failing_body, ok_body, provisioning_chain, CallCounter, FakeCloud, StartLog,
};

/// Test: Scenario A - bastion exhausts its retries
/// Given the provisioning chain with a bastion job that always fails
/// When the schedule runs
/// Then create and cleanup are skipped and the run fails
#[tokio::test(start_paused = true)]
async fn test_bastion_failure_skips_create_and_cleanup() {
    let counter = CallCounter::new();
    let attempts = counter.clone();
    let bastion = job_fn(move |ctx| {
        let attempts = attempts.clone();
        async move {
            attempts.hit();
            ctx.record_resource(ResourceRef::new("server", "prod-bastion"));
            Err(Error::body("ssh connection refused"))
        }
    });
    let schedule = provisioning_chain(bastion, 2);

    let cloud = FakeCloud::new(&[ResourceRef::new("server", "prod-bastion")]);
    let result = Executor::new(ExecutorConfig::default())
        .with_provisioner(cloud.clone())
        .run(&schedule)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    for job in ["sshkey", "pem", "keyfile"] {
        assert_eq!(result.state_of(job), Some(JobState::Success), "{}", job);
    }
    assert_eq!(result.state_of("bastion"), Some(JobState::Failed));
    assert_eq!(result.state_of("create"), Some(JobState::Skipped));
    assert_eq!(result.state_of("cleanup"), Some(JobState::Skipped));
    assert_eq!(result.skipped_jobs(), vec!["create", "cleanup"]);

    let bastion = result.record("bastion").unwrap();
    assert_eq!(bastion.attempts, 3);
    assert_eq!(counter.count(), 3);
    assert_eq!(bastion.phase, "infrastructure");
    assert_eq!(bastion.description, "Provision bastion");
    assert_eq!(
        bastion.error.as_deref(),
        Some("Job body failed: ssh connection refused")
    );
    let cleanup = bastion.cleanup.as_ref().unwrap();
    assert_eq!(cleanup.decision, CleanupDecision::Cleared);
    assert_eq!(cloud.destroy_calls().len(), 1);

    // Skipped jobs never ran and carry the reason.
    let create = result.record("create").unwrap();
    assert_eq!(create.attempts, 0);
    assert!(create.error.as_deref().unwrap().contains("bastion"));
}

/// Test: the provisioning chain succeeds end to end
#[tokio::test]
async fn test_provisioning_chain_success_in_declaration_order() {
    let schedule = provisioning_chain(ok_body("bastion"), 0);

    let result = Executor::new(ExecutorConfig::default())
        .run(&schedule)
        .await
        .unwrap();

    assert!(result.is_success());
    let names: Vec<&str> = result.get_results().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["sshkey", "pem", "keyfile", "bastion", "create", "cleanup"]
    );
    assert!(result
        .get_results()
        .iter()
        .all(|r| r.state == JobState::Success && r.attempts == 1));
    assert_eq!(result.record("create").unwrap().output, Some(json!({"job": "create"})));
}

/// Test: the chain's mixed declarations are flagged, not rejected
#[test]
fn test_provisioning_chain_warns_about_bastion() {
    let schedule = provisioning_chain(ok_body("bastion"), 0);
    let warnings = schedule.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].job, "create");
    assert_eq!(warnings[0].related, "bastion");
    assert_eq!(warnings[0].kind, WarningKind::OnSuccessUndeclared);
}

/// Test: no job starts before all of its upstream jobs succeeded
/// Given a diamond with on-success and dependency edges mixed
/// When the schedule runs with plenty of concurrency
/// Then every job starts after all of its upstream jobs
#[tokio::test]
async fn test_no_job_starts_before_upstream_success() {
    let log = StartLog::new();
    let mut builder = ScheduleBuilder::new();
    let jobs: [(&str, &[&str], &[&str]); 5] = [
        ("root", &[], &["left", "right"]),
        ("left", &[], &[]),
        ("right", &[], &[]),
        ("join", &["left", "right"], &[]),
        ("tail", &["join", "root"], &[]),
    ];
    for (name, deps, next) in jobs {
        builder
            .add_schedule(def(&builder, name, deps, next), log.body())
            .unwrap();
    }
    let schedule = builder.get_schedules().unwrap();

    let config = ExecutorConfig {
        max_concurrent_jobs: 8,
        ..ExecutorConfig::default()
    };
    let result = Executor::new(config).run(&schedule).await.unwrap();
    assert!(result.is_success());

    for job in schedule.names() {
        let started = log.position(job).unwrap();
        for upstream in schedule.dag().upstream(job) {
            assert!(
                log.position(upstream).unwrap() < started,
                "{} started before {}",
                job,
                upstream
            );
        }
    }
}

/// Test: a failure only affects its own descendants
#[tokio::test]
async fn test_independent_branch_continues() {
    let mut builder = ScheduleBuilder::new();
    builder
        .add_schedule(def(&builder, "db", &[], &[]), failing_body("quota exceeded"))
        .unwrap();
    builder
        .add_schedule(def(&builder, "db_config", &["db"], &[]), ok_body("db_config"))
        .unwrap();
    builder
        .add_schedule(def(&builder, "dns", &[], &[]), ok_body("dns"))
        .unwrap();
    builder
        .add_schedule(def(&builder, "dns_check", &["dns"], &[]), ok_body("dns_check"))
        .unwrap();
    let schedule = builder.get_schedules().unwrap();

    let result = Executor::new(ExecutorConfig::default())
        .run(&schedule)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failed_jobs(), vec!["db"]);
    assert_eq!(result.skipped_jobs(), vec!["db_config"]);
    assert_eq!(result.state_of("dns_check"), Some(JobState::Success));
}

/// Test: an optional cleanup job failing does not fail the run
#[tokio::test]
async fn test_optional_job_failure_recorded_only() {
    let mut builder = ScheduleBuilder::new();
    builder
        .add_schedule(def(&builder, "create", &[], &["cleanup"]), ok_body("create"))
        .unwrap();
    let mut cleanup = def(&builder, "cleanup", &[], &[]);
    cleanup.optional = true;
    builder
        .add_schedule(cleanup, failing_body("temporary key already gone"))
        .unwrap();
    let schedule = builder.get_schedules().unwrap();

    let result = Executor::new(ExecutorConfig::default())
        .run(&schedule)
        .await
        .unwrap();

    assert!(result.is_success());
    let record = result.record("cleanup").unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert!(record.optional);
}

/// Test: configuration errors abort before any job runs
#[test]
fn test_cycle_aborts_before_execution() {
    let counter = CallCounter::new();
    let mut builder = ScheduleBuilder::new();
    for (name, deps) in [("a", &["c"][..]), ("b", &["a"][..]), ("c", &["b"][..])] {
        let counter = counter.clone();
        let body = job_fn(move |_| {
            counter.hit();
            async { Ok(serde_json::Value::Null) }
        });
        builder.add_schedule(def(&builder, name, deps, &[]), body).unwrap();
    }

    let err = builder.get_schedules().unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(!err.is_retryable());
    assert_eq!(counter.count(), 0);
}

/// Test: round-trip of committed definitions
/// Given definitions with every field set
/// When committed and read back
/// Then the same jobs come back in the same order with identical fields
#[test]
fn test_schedule_round_trip() {
    let mut builder = ScheduleBuilder::new();
    let mut defs: Vec<ScheduleDef> = Vec::new();

    let mut sshkey = def(&builder, "sshkey", &[], &["pem"]);
    sshkey.automation_phase = "keys".into();
    sshkey.human_description = "Create SSH key pair".into();
    sshkey.timeout = 300;
    defs.push(sshkey);

    let mut pem = def(&builder, "pem", &["sshkey"], &[]);
    pem.retries = 3;
    pem.timewait = 30;
    pem.cleanup = stacksched::CleanupPolicy::Keep;
    defs.push(pem);

    let mut create = def(&builder, "create", &["pem"], &[]);
    create.keep_resources_on_failure = true;
    create.optional = true;
    defs.push(create);

    for d in defs.clone() {
        builder.add_schedule(d, ok_body("x")).unwrap();
    }
    let schedule = builder.get_schedules().unwrap();

    assert_eq!(schedule.definitions(), defs);

    let json = serde_json::to_string(&schedule).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let parsed: Vec<ScheduleDef> = serde_json::from_value(value["jobs"].clone()).unwrap();
    assert_eq!(parsed, defs);

    // Rebuilding from the read-back definitions yields the same schedule.
    let mut again = ScheduleBuilder::new();
    for d in parsed {
        again.add_schedule(d, ok_body("x")).unwrap();
    }
    assert_eq!(again.get_schedules().unwrap().definitions(), defs);
}

/// Test: the aggregate serializes in declaration order
#[tokio::test]
async fn test_aggregate_json_is_ordered() {
    let schedule = provisioning_chain(failing_body("down"), 0);
    let result = Executor::new(ExecutorConfig::default())
        .run(&schedule)
        .await
        .unwrap();

    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["status"], "failed");
    let states: Vec<&str> = value["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["state"].as_str().unwrap())
        .collect();
    assert_eq!(
        states,
        vec!["success", "success", "success", "failed", "skipped", "skipped"]
    );
}
