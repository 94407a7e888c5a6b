use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use stacksched::config::Config;
use stacksched::orchestration::{Executor, ExecutorConfig, ExecutorEvent};
use stacksched::{plan, slog, Result, Schedule};

/// stacksched - dependency-aware job scheduler for provisioning runs
#[derive(Parser, Debug)]
#[command(name = "stacksched")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    STACKSCHED_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.stacksched/stacksched.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Build a schedule file and report configuration problems
    Validate {
        /// Path to the schedule TOML file
        file: PathBuf,
    },

    /// Print the finalized schedule as JSON
    Plan {
        /// Path to the schedule TOML file
        file: PathBuf,
    },

    /// Execute a schedule file and print the result as JSON
    Run {
        /// Path to the schedule TOML file
        file: PathBuf,

        /// Maximum number of top-level jobs running at once
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Maximum number of parallel group members running at once
        #[arg(long)]
        max_members: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    stacksched::log::init_with_debug(cli.debug);

    let config = Config::load()?;
    match cli.command {
        Command::Validate { file } => run_validate(&file, &config),
        Command::Plan { file } => run_plan(&file, &config),
        Command::Run {
            file,
            max_concurrent,
            max_members,
        } => {
            let mut exec_config = ExecutorConfig::from(&config);
            if let Some(n) = max_concurrent {
                exec_config.max_concurrent_jobs = n;
            }
            if let Some(n) = max_members {
                exec_config.max_parallel_members = n;
            }
            let succeeded = run_schedule(&file, &config, exec_config)?;
            if !succeeded {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Build the schedule and print its warnings.
fn run_validate(file: &Path, config: &Config) -> Result<()> {
    let schedule = plan::load(file, config)?;
    for warning in schedule.warnings() {
        println!("warning: {}", warning);
    }
    println!(
        "{}: {} job(s), {} edge(s), {} warning(s)",
        file.display(),
        schedule.len(),
        schedule.dag().edge_count(),
        schedule.warnings().len()
    );
    Ok(())
}

fn run_plan(file: &Path, config: &Config) -> Result<()> {
    let schedule = plan::load(file, config)?;
    println!("{}", serde_json::to_string_pretty(&plan_json(&schedule)?)?);
    Ok(())
}

/// The schedule plus its execution order and edges.
fn plan_json(schedule: &Schedule) -> Result<serde_json::Value> {
    let edges: Vec<serde_json::Value> = schedule
        .dag()
        .edges()
        .into_iter()
        .map(|(from, to, kind)| serde_json::json!({"from": from, "to": to, "kind": kind}))
        .collect();
    Ok(serde_json::json!({
        "order": schedule.topological_order()?,
        "edges": edges,
        "schedule": schedule,
    }))
}

/// Execute the schedule. Returns whether the run succeeded.
fn run_schedule(file: &Path, config: &Config, exec_config: ExecutorConfig) -> Result<bool> {
    let schedule = plan::load(file, config)?;
    slog!(
        "Run command: file={}, jobs={}, max_concurrent={}",
        file.display(),
        schedule.len(),
        exec_config.max_concurrent_jobs
    );

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let (tx, rx) = mpsc::channel(256);
        let executor = Executor::new(exec_config).with_events(tx);

        let token = executor.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        });
        let progress = tokio::spawn(print_progress(rx));

        let result = executor.run(&schedule).await;
        // Dropping the executor closes the event channel.
        drop(executor);
        let _ = progress.await;
        result
    })?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.is_success())
}

async fn print_progress(mut rx: mpsc::Receiver<ExecutorEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ExecutorEvent::JobStarted { job } => eprintln!("[{}] started", job),
            ExecutorEvent::AttemptFailed {
                job,
                attempt,
                error,
                retry_in,
            } => eprintln!(
                "[{}] attempt {} failed, retrying in {}s: {}",
                job,
                attempt,
                retry_in.as_secs(),
                error
            ),
            ExecutorEvent::JobSucceeded { job, attempts } => {
                eprintln!("[{}] success ({} attempt(s))", job, attempts)
            }
            ExecutorEvent::JobFailed {
                job,
                attempts,
                error,
            } => eprintln!("[{}] failed after {} attempt(s): {}", job, attempts, error),
            ExecutorEvent::JobSkipped { job, reason } => eprintln!("[{}] skipped: {}", job, reason),
            ExecutorEvent::CleanupFinished {
                job,
                decision,
                failures,
            } => eprintln!("[{}] cleanup {:?}, {} failure(s)", job, decision, failures),
            ExecutorEvent::RunFinished { run_id, status } => {
                eprintln!("run {} finished: {}", run_id.short(), status)
            }
        }
    }
}
