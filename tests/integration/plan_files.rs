//! Schedule file tests.
//!
//! These tests load TOML plans from disk and run their shell-command jobs.

use stacksched::config::Config;
use stacksched::orchestration::{Executor, ExecutorConfig};
use stacksched::plan::{self, PlanFile};
use stacksched::{Error, JobState};

use crate::fixtures::PlanDir;

const PROVISIONING_PLAN: &str = r#"
[[params]]
key = "cluster_name"
required = true

[[params]]
key = "vm_count"
type = "int"
default = "2"
tags = ["compute"]

[inputs]
cluster_name = "prod"

[[job]]
name = "sshkey"
phase = "infrastructure"
description = "Create SSH key pair"
command = "echo $STACKSCHED_PARAM_CLUSTER_NAME-ssh-key"
on_success = ["create"]

[[job]]
name = "create"
phase = "infrastructure"
timeout = 60
parallel = ["echo vm-$STACKSCHED_MEMBER", "echo vm-$STACKSCHED_MEMBER"]
command = "echo using $STACKSCHED_OUT_SSHKEY"
on_success = ["configure"]

[[job]]
name = "configure"
phase = "software"
retries = 1
timewait = 0
command = "test $STACKSCHED_PARAM_VM_COUNT = 2"
"#;

/// Test: a plan file loads into a validated schedule
#[test]
fn test_load_plan_file() {
    let dir = PlanDir::with(PROVISIONING_PLAN);
    let schedule = plan::load(&dir.path, &Config::default()).unwrap();

    assert_eq!(schedule.names(), vec!["sshkey", "create", "configure"]);
    assert_eq!(schedule.params().get_str("cluster_name"), Some("prod"));
    assert_eq!(schedule.params().get_int("vm_count"), Some(2));
    assert_eq!(schedule.params().tagged("compute").len(), 1);

    let defs = schedule.definitions();
    assert_eq!(defs[0].human_description, "Create SSH key pair");
    assert_eq!(defs[1].timeout, 60);
    assert_eq!(defs[2].retries, 1);
    assert_eq!(defs[2].automation_phase, "software");
}

/// Test: running a plan executes its commands in dependency order
#[tokio::test]
async fn test_run_plan_file() {
    let dir = PlanDir::with(PROVISIONING_PLAN);
    let schedule = plan::load(&dir.path, &Config::default()).unwrap();

    let result = Executor::new(ExecutorConfig::default())
        .run(&schedule)
        .await
        .unwrap();

    assert!(result.is_success(), "{:?}", result.failed_jobs());
    let sshkey = result.record("sshkey").unwrap().output.clone().unwrap();
    assert_eq!(sshkey["stdout"], "prod-ssh-key");

    let create = result.record("create").unwrap().output.clone().unwrap();
    assert_eq!(create["stdout"], "using prod-ssh-key");
    assert_eq!(create["members"][0]["stdout"], "vm-0");
    assert_eq!(create["members"][1]["stdout"], "vm-1");
}

/// Test: a failing command fails its job and skips dependents
#[tokio::test]
async fn test_failing_command_skips_dependents() {
    let dir = PlanDir::with(
        r#"
        [[job]]
        name = "bastion"
        command = "echo 'connection refused' >&2; exit 255"
        on_success = ["create"]

        [[job]]
        name = "create"
        command = "echo never"
        "#,
    );
    let schedule = plan::load(&dir.path, &Config::default()).unwrap();

    let result = Executor::new(ExecutorConfig::default())
        .run(&schedule)
        .await
        .unwrap();

    assert!(!result.is_success());
    let bastion = result.record("bastion").unwrap();
    assert_eq!(bastion.state, JobState::Failed);
    assert!(bastion.error.as_deref().unwrap().contains("connection refused"));
    assert_eq!(result.state_of("create"), Some(JobState::Skipped));
}

/// Test: a failing parallel member fails the owning job
#[tokio::test]
async fn test_failing_parallel_command() {
    let dir = PlanDir::with(
        r#"
        [[job]]
        name = "create"
        parallel = ["true", "exit 1", "true"]
        "#,
    );
    let schedule = plan::load(&dir.path, &Config::default()).unwrap();

    let result = Executor::new(ExecutorConfig::default())
        .run(&schedule)
        .await
        .unwrap();

    let record = result.record("create").unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(
        record.error.as_deref(),
        Some("1 of 3 parallel member(s) failed: create[1]: Job body failed: command `exit 1` failed: exit code 1")
    );
}

/// Test: invalid plans are rejected before anything runs
#[test]
fn test_invalid_plans_rejected() {
    let cycle = PlanDir::with(
        r#"
        [[job]]
        name = "a"
        dependency = ["b"]

        [[job]]
        name = "b"
        dependency = ["a"]
        "#,
    );
    let err = plan::load(&cycle.path, &Config::default()).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    let dangling = PlanDir::with(
        r#"
        [[job]]
        name = "create"
        dependency = ["bastion"]
        "#,
    );
    let err = plan::load(&dangling.path, &Config::default()).unwrap_err();
    assert!(err.to_string().contains("bastion"));

    let negative = PlanDir::with(
        r#"
        [[job]]
        name = "create"
        retries = -1
        "#,
    );
    let err = plan::load(&negative.path, &Config::default()).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

/// Test: parameter problems surface as parameter errors
#[test]
fn test_missing_required_param() {
    let plan = PlanFile::parse(
        r#"
        [[params]]
        key = "cluster_name"
        required = true

        [[job]]
        name = "sshkey"
        "#,
    )
    .unwrap();
    let err = plan.into_schedule(&Config::default()).unwrap_err();
    assert!(matches!(err, Error::Parameter(_)));
}

/// Test: a missing file is an IO error
#[test]
fn test_missing_file() {
    let dir = PlanDir::with("");
    let err = plan::load(&dir.temp_dir.path().join("absent.toml"), &Config::default())
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
