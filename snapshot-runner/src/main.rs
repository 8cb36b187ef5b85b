//! Snapshot Runner - Main entry point
//!
//! One invocation runs one job and exits 0 on success, 1 on any fatal error.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snapshot_runner::{daemon::shutdown::ShutdownCoordinator, runner, status, utils, Config, Job};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: /etc/snapshot-runner/<JOB>.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a new snapshot
    Run {
        /// Job identifier (letters, digits and '_')
        job: String,

        /// Delete failed snapshots and rotate old ones after the transfer
        #[arg(long)]
        auto_clean: bool,

        /// Complete snapshots and logs to keep
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        retain: Option<u32>,
    },

    /// Apply retention without transferring
    Clean {
        job: String,

        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        retain: Option<u32>,
    },

    /// Show lock holder and snapshots
    Status {
        job: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    fn job_id(&self) -> &str {
        match self {
            Command::Run { job, .. } | Command::Clean { job, .. } | Command::Status { job, .. } => job,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    match execute(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn execute(args: Args) -> Result<()> {
    let job_id = args.command.job_id().to_string();
    snapshot_runner::config::validate_job_id(&job_id)?;

    let config_path = args.config.unwrap_or_else(|| Config::default_path(&job_id));
    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let config = match &args.command {
        Command::Run { auto_clean, retain, .. } => config.with_overrides(*auto_clean, *retain),
        Command::Clean { retain, .. } => config.with_overrides(true, *retain),
        Command::Status { .. } => config,
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let job = Job::from_config(&job_id, &config)?;

    match args.command {
        Command::Run { .. } => {
            tracing::info!(
                "Starting snapshot-runner v{} (job: {})",
                env!("CARGO_PKG_VERSION"),
                job.id
            );
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to start runtime")?;
            runtime.block_on(run(&job))
        }
        Command::Clean { .. } => {
            let report = runner::clean(&job)?;
            tracing::info!(
                deleted = report.deleted_count(),
                failed = report.failed_count(),
                "Cleanup complete"
            );
            Ok(())
        }
        Command::Status { json, .. } => {
            let status = status::collect(&job)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{status}");
            }
            Ok(())
        }
    }
}

async fn run(job: &Job) -> Result<()> {
    // Create shutdown coordinator
    let shutdown = ShutdownCoordinator::new();
    shutdown.listen().context("failed to install signal handlers")?;

    let outcome = runner::run(job, &shutdown.token()).await?;

    tracing::info!(
        job_id = %job.id,
        snapshot = %outcome.snapshot,
        link_dest = outcome.link_source.as_ref().map(|n| n.as_str()).unwrap_or("none"),
        recovered = outcome.recovered.len(),
        retention_deleted = outcome.retention.deleted_count(),
        "Backup complete"
    );
    Ok(())
}
