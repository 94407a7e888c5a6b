//! Schedule construction: `new_schedule()` / `add_schedule()` / `get_schedules()`.
//!
//! Field checks and duplicate names are rejected as each definition is
//! committed. References and cycles are checked once in `get_schedules()`,
//! since a job may name another job that is declared after it.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::config::Config;
use crate::core::dag::{EdgeKind, JobDAG};
use crate::core::job::{Job, ScheduleDef};
use crate::error::{Error, Result};
use crate::orchestration::JobBody;
use crate::params::{ParamSchema, Params};
use crate::{slog, slog_debug, slog_warn};

/// Job names are used in logs, CLI output and environment variables.
static JOB_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap());

/// How a job's dependency list and on-success chains disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// A declared dependency is not an ancestor along any on-success chain
    /// leading to the job.
    DependencyOffChain,
    /// An on-success predecessor is not an ancestor along declared
    /// dependencies.
    OnSuccessUndeclared,
}

/// Non-fatal inconsistency between dependency and on-success declarations.
///
/// Both kinds of edge are enforced either way; the warning only points out
/// that the author said two different things.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleWarning {
    pub job: String,
    pub kind: WarningKind,
    pub related: String,
}

impl std::fmt::Display for ScheduleWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            WarningKind::DependencyOffChain => write!(
                f,
                "job {}: dependency {} is not reached through any on_success chain",
                self.job, self.related
            ),
            WarningKind::OnSuccessUndeclared => write!(
                f,
                "job {}: on_success predecessor {} is not among its dependencies",
                self.job, self.related
            ),
        }
    }
}

/// Accumulates job definitions for one run.
pub struct ScheduleBuilder {
    config: Config,
    params: Arc<Params>,
    jobs: Vec<Job>,
    names: HashSet<String>,
}

impl ScheduleBuilder {
    /// Start an empty schedule with built-in defaults.
    ///
    /// Nothing carries over from any earlier builder or run: execution mode
    /// lives in each attempt's context, so a fresh builder is always a
    /// sequential start.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            params: Arc::new(Params::empty()),
            jobs: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Use `config` to seed the defaults of `new_schedule()`.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Resolve run parameters against `schema`. Every job context of the
    /// resulting schedule sees the resolved values.
    ///
    /// # Errors
    /// Returns a parameter error when inputs do not satisfy the schema.
    pub fn with_params(
        mut self,
        schema: &ParamSchema,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<Self> {
        self.params = Arc::new(schema.resolve(inputs)?);
        Ok(self)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A fresh definition with safe defaults: no edges, `clear` cleanup,
    /// no retries, timeouts taken from the config.
    pub fn new_schedule(&self, job: &str) -> ScheduleDef {
        let mut def = ScheduleDef::new(job);
        def.timeout = self.config.default_timeout_secs as i64;
        def.timewait = self.config.default_timewait_secs as i64;
        def.keep_resources_on_failure = self.config.keep_resources_on_failure;
        def
    }

    /// Commit a definition together with the body that runs it.
    ///
    /// # Errors
    /// Returns a configuration error for an invalid name, a duplicate name,
    /// or an invalid field.
    pub fn add_schedule(&mut self, def: ScheduleDef, body: JobBody) -> Result<()> {
        if !JOB_NAME_RE.is_match(&def.job) {
            return Err(Error::config(format!("invalid job name {:?}", def.job)));
        }
        if self.names.contains(&def.job) {
            return Err(Error::config(format!("duplicate job name {}", def.job)));
        }
        def.validate_fields()?;

        slog_debug!(
            "schedule: committed job {} (retries={}, timeout={}s)",
            def.job,
            def.retries,
            def.timeout
        );
        self.names.insert(def.job.clone());
        self.jobs.push(Job::from_def(def, body));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Finalize the schedule.
    ///
    /// # Errors
    /// Returns a configuration error if a dependency or on-success entry
    /// names an undeclared job, or if the combined graph has a cycle.
    pub fn get_schedules(self) -> Result<Schedule> {
        let mut dag = JobDAG::new();
        for job in &self.jobs {
            dag.add_job(&job.name);
        }
        for job in &self.jobs {
            for dep in &job.dependencies {
                dag.add_edge(dep, &job.name, EdgeKind::Dependency)?;
            }
            for next in &job.on_success {
                dag.add_edge(&job.name, next, EdgeKind::OnSuccess)?;
            }
        }

        if let Some(cycle) = dag.find_cycle() {
            return Err(Error::config(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }

        let warnings = consistency_warnings(&self.jobs, &dag);
        for warning in &warnings {
            slog_warn!("schedule: {}", warning);
        }
        slog!(
            "schedule: finalized {} job(s), {} edge(s)",
            self.jobs.len(),
            dag.edge_count()
        );

        Ok(Schedule {
            jobs: self.jobs,
            dag,
            warnings,
            params: self.params,
        })
    }
}

impl Default for ScheduleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Flag jobs whose dependency list and on-success chains disagree.
fn consistency_warnings(jobs: &[Job], dag: &JobDAG) -> Vec<ScheduleWarning> {
    let mut warnings = Vec::new();
    for job in jobs {
        let chained_from: Vec<&str> = dag
            .upstream(&job.name)
            .into_iter()
            .filter(|p| {
                dag.edge_kind(p, &job.name)
                    .is_some_and(|k| k.is_on_success())
            })
            .collect();

        if !chained_from.is_empty() {
            for dep in &job.dependencies {
                if !dag.reaches_via(dep, &job.name, |k| k.is_on_success()) {
                    warnings.push(ScheduleWarning {
                        job: job.name.clone(),
                        kind: WarningKind::DependencyOffChain,
                        related: dep.clone(),
                    });
                }
            }
        }

        if !job.dependencies.is_empty() {
            for pred in chained_from {
                if !dag.reaches_via(pred, &job.name, |k| k.is_dependency()) {
                    warnings.push(ScheduleWarning {
                        job: job.name.clone(),
                        kind: WarningKind::OnSuccessUndeclared,
                        related: pred.to_string(),
                    });
                }
            }
        }
    }
    warnings
}

/// A finalized, validated, immutable set of jobs.
pub struct Schedule {
    jobs: Vec<Job>,
    dag: JobDAG,
    warnings: Vec<ScheduleWarning>,
    params: Arc<Params>,
}

impl Schedule {
    /// Jobs in declaration order.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    pub fn dag(&self) -> &JobDAG {
        &self.dag
    }

    pub fn warnings(&self) -> &[ScheduleWarning] {
        &self.warnings
    }

    pub fn params(&self) -> Arc<Params> {
        Arc::clone(&self.params)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn topological_order(&self) -> Result<Vec<&str>> {
        self.dag.topological_order()
    }

    /// The committed definitions, in declaration order.
    pub fn definitions(&self) -> Vec<ScheduleDef> {
        self.jobs.iter().map(Job::definition).collect()
    }
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Schedule", 3)?;
        state.serialize_field("jobs", &self.jobs)?;
        state.serialize_field("warnings", &self.warnings)?;
        state.serialize_field("params", &*self.params)?;
        state.end()
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("jobs", &self.names())
            .field("warnings", &self.warnings.len())
            .finish()
    }
}
