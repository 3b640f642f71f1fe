//! cyclewm CLI - cyclic workflow manager.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use cyclewm_batch::BatchConfig;
use cyclewm_core::Cycle;
use cyclewm_execution::{CycleStatus, CycleSummary, EngineConfig, Orchestrator};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cyclewm")]
#[command(about = "Cyclic workflow manager for batch systems", long_about = None)]
struct Cli {
    /// Workflow definition (YAML)
    #[arg(short, long, env = "CYCLEWM_WORKFLOW")]
    workflow: PathBuf,

    /// Workflow state store
    #[arg(short, long, env = "CYCLEWM_STORE")]
    store: PathBuf,

    /// Spool directory for the local batch system
    #[arg(long, env = "CYCLEWM_SPOOL", default_value = ".cyclewm/spool")]
    spool: PathBuf,

    /// Hard limit in seconds on each batch system command
    #[arg(long, env = "CYCLEWM_TIMEOUT", default_value = "60")]
    timeout: u64,

    /// Seconds between real-time admission probes, overriding the definition
    #[arg(long)]
    admission_step: Option<i64>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one pass
    Run,
    /// Run passes until every cycle is done
    Loop {
        /// Seconds between passes
        #[arg(long, default_value = "60")]
        interval: u64,
    },
    /// Halt cycles, cancelling their jobs
    Halt {
        /// Cycles as YYYYMMDDHH[MM]; all known cycles if omitted
        #[arg(long = "cycle")]
        cycles: Vec<Cycle>,
    },
    /// Resume halted cycles
    Resume {
        /// Cycles as YYYYMMDDHH[MM]; all known cycles if omitted
        #[arg(long = "cycle")]
        cycles: Vec<Cycle>,
    },
    /// Show cycle and task status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let timeout = Duration::from_secs(cli.timeout);
    let config = EngineConfig {
        batch: BatchConfig {
            spool_dir: cli.spool.clone(),
            command_timeout: timeout,
            ..BatchConfig::default()
        },
        boundary_timeout: timeout + Duration::from_secs(30),
        admission_step: cli.admission_step,
        ..EngineConfig::default()
    };

    let mut workflow = Orchestrator::open(&cli.workflow, &cli.store, config)
        .await
        .with_context(|| format!("cannot open workflow {}", cli.workflow.display()))?;

    match cli.command {
        Commands::Run => {
            workflow.run_pass(Utc::now()).await?;
            info!("pass complete");
        }
        Commands::Loop { interval } => {
            workflow.run_loop(Duration::from_secs(interval)).await?;
        }
        Commands::Halt { cycles } => {
            workflow.halt(&cycles).await?;
        }
        Commands::Resume { cycles } => {
            workflow.resume(&cycles).await?;
        }
        Commands::Status => {
            print_status(&workflow.status());
        }
    }

    Ok(())
}

fn print_status(cycles: &[CycleSummary]) {
    if cycles.is_empty() {
        println!("No cycles activated yet");
        return;
    }

    for cycle in cycles {
        let status = match cycle.status {
            CycleStatus::Run => "RUN",
            CycleStatus::Halt => "HALT",
        };
        let done = if cycle.done { ", done" } else { "" };
        println!("Cycle {} ({}{})", cycle.cycle, status, done);

        for task in &cycle.tasks {
            let state = match (task.state, task.expired) {
                (_, true) => "EXPIRED".to_string(),
                (Some(state), false) => state.to_string().to_uppercase(),
                (None, false) => "-".to_string(),
            };
            let exit = task
                .exit_status
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            let rate = task
                .tasks_per_hour
                .map_or_else(String::new, |r| format!(" | {:.1}/h", r));
            println!(
                "  {} | {} | job {} | exit {} | tries {} | in flight {}{}",
                task.task,
                state,
                task.job_id.as_deref().unwrap_or("-"),
                exit,
                task.attempts,
                task.in_flight,
                rate,
            );
        }
    }
}
