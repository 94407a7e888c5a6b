//! Schedule files: TOML plans whose jobs run shell commands.
//!
//! ```toml
//! [[params]]
//! key = "cluster_name"
//! required = true
//!
//! [inputs]
//! cluster_name = "prod"
//!
//! [[job]]
//! name = "sshkey"
//! phase = "infrastructure"
//! command = "ssh-keygen -q -t ed25519 -N '' -f key"
//! on_success = ["create"]
//!
//! [[job]]
//! name = "create"
//! retries = 1
//! parallel = ["./vm.sh 0", "./vm.sh 1", "./vm.sh 2"]
//! ```
//!
//! A job's `command` runs first, then its `parallel` commands fan out as one
//! parallel group. A non-zero exit fails the attempt.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::config::Config;
use crate::core::job::CleanupPolicy;
use crate::core::schedule::{Schedule, ScheduleBuilder};
use crate::core::ScheduleDef;
use crate::error::{Error, Result};
use crate::orchestration::{job_fn, JobBody, JobContext};
use crate::params::{OptionSpec, ParamSchema};
use crate::slog_debug;

/// Prefix of every environment variable handed to commands.
pub const ENV_PREFIX: &str = "STACKSCHED";

/// Parsed schedule file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    #[serde(default)]
    pub params: Vec<OptionSpec>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default, rename = "job")]
    pub jobs: Vec<PlanJob>,
}

/// One `[[job]]` entry. Unset policy fields fall back to the config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanJob {
    pub name: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub description: String,
    pub timeout: Option<i64>,
    pub timewait: Option<i64>,
    pub retries: Option<i64>,
    pub cleanup: Option<CleanupPolicy>,
    pub keep_resources_on_failure: Option<bool>,
    #[serde(default)]
    pub dependency: Vec<String>,
    #[serde(default)]
    pub on_success: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    pub command: Option<String>,
    #[serde(default)]
    pub parallel: Vec<String>,
}

impl PlanFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Build and validate the schedule described by this file.
    pub fn into_schedule(self, config: &Config) -> Result<Schedule> {
        let mut schema = ParamSchema::new();
        for spec in self.params {
            schema.add(spec)?;
        }
        let mut builder = ScheduleBuilder::new()
            .with_config(config.clone())
            .with_params(&schema, &self.inputs)?;

        for job in self.jobs {
            let def = job.definition(&builder);
            builder.add_schedule(def, job.body())?;
        }
        builder.get_schedules()
    }
}

impl PlanJob {
    fn definition(&self, builder: &ScheduleBuilder) -> ScheduleDef {
        let mut def = builder.new_schedule(&self.name);
        def.automation_phase = self.phase.clone();
        def.human_description = self.description.clone();
        if let Some(timeout) = self.timeout {
            def.timeout = timeout;
        }
        if let Some(timewait) = self.timewait {
            def.timewait = timewait;
        }
        if let Some(retries) = self.retries {
            def.retries = retries;
        }
        if let Some(cleanup) = self.cleanup {
            def.cleanup = cleanup;
        }
        if let Some(keep) = self.keep_resources_on_failure {
            def.keep_resources_on_failure = keep;
        }
        def.dependency = self.dependency.clone();
        def.on_success = self.on_success.clone();
        def.optional = self.optional;
        def
    }

    fn body(&self) -> JobBody {
        let command = self.command.clone();
        let parallel = self.parallel.clone();
        job_fn(move |ctx| {
            let command = command.clone();
            let parallel = parallel.clone();
            async move { run_commands(ctx, command, parallel).await }
        })
    }
}

/// Load a schedule file and build its schedule.
pub fn load(path: &Path, config: &Config) -> Result<Schedule> {
    PlanFile::load(path)?.into_schedule(config)
}

async fn run_commands(
    ctx: JobContext,
    command: Option<String>,
    parallel: Vec<String>,
) -> Result<Value> {
    let env = command_env(&ctx);

    let main = match &command {
        Some(cmd) => run_shell(cmd, &env).await?,
        None => Value::Null,
    };

    let mut members = Vec::new();
    if !parallel.is_empty() {
        ctx.set_parallel();
        for (i, cmd) in parallel.into_iter().enumerate() {
            let mut member_env = env.clone();
            member_env.push((format!("{}_MEMBER", ENV_PREFIX), i.to_string()));
            ctx.dispatch(format!("{}[{}]", ctx.job_name(), i), async move {
                run_shell(&cmd, &member_env).await
            })
            .await?;
        }
        members = ctx.unset_parallel().await?;
    }

    let mut output = match main {
        Value::Null => json!({"stdout": null, "exit_code": null}),
        other => other,
    };
    if !members.is_empty() {
        output["members"] = Value::Array(members);
    }
    Ok(output)
}

/// Environment for commands: job identity, resolved parameters and the
/// stdout of succeeded upstream jobs.
fn command_env(ctx: &JobContext) -> Vec<(String, String)> {
    let mut env = vec![
        (format!("{}_JOB", ENV_PREFIX), ctx.job_name().to_string()),
        (format!("{}_PHASE", ENV_PREFIX), ctx.phase().to_string()),
        (format!("{}_ATTEMPT", ENV_PREFIX), ctx.attempt().to_string()),
    ];
    for (key, value) in ctx.params().iter() {
        env.push((
            format!("{}_PARAM_{}", ENV_PREFIX, env_key(key)),
            env_value(value),
        ));
    }
    for (job, output) in ctx.upstream_outputs() {
        if let Some(stdout) = output.get("stdout").and_then(Value::as_str) {
            env.push((
                format!("{}_OUT_{}", ENV_PREFIX, env_key(job)),
                stdout.to_string(),
            ));
        }
    }
    env
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(env_value)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

async fn run_shell(cmd: &str, env: &[(String, String)]) -> Result<Value> {
    slog_debug!("running command: {}", cmd);
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(Error::Io)?;

    let code = output.status.code().unwrap_or(-1);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            format!("exit code {}", code)
        } else {
            stderr.trim().to_string()
        };
        return Err(Error::body(format!("command `{}` failed: {}", cmd, detail)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(json!({
        "stdout": stdout.trim_end(),
        "exit_code": code,
    }))
}
