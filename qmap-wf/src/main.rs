//! qmap-wf - QALAS relaxometry workflow
//!
//! Selects the best QALAS scan per subject/session from quality metadata,
//! drives relaxometry map generation and BIDS conversion, uploads the
//! derivatives and records every commit in the reprocessing ledger.
//!
//! Exit status: 0 on a clean run, 2 when any session failed, 1 on a
//! run-fatal error (lock held, corrupt ledger, unusable configuration).

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use qmap_common::config::{self as common_config, LoggingConfig, WORK_ROOT_ENV_VAR};
use qmap_wf::config::{WorkflowConfig, MODULE_NAME};
use qmap_wf::services::ledger::Ledger;
use qmap_wf::services::{Collaborators, RunCoordinator, RunOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "qmap-wf", version, about = "QALAS relaxometry workflow")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Select and process sessions, committing results to the ledger
    Run(RunArgs),
    /// Show what a run would select without touching the ledger
    Plan(PlanArgs),
    /// Print the ledger status summary
    Ledger(CommonArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Config file (overrides QMAP_CONFIG and the per-user file)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Work root holding the ledger, tracking log and scratch directories
    #[arg(long)]
    work_root: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Maximum work items executed this run
    #[arg(long)]
    batch_size: Option<usize>,

    /// Select only; no ledger writes, no delegation
    #[arg(long)]
    dry_run: bool,

    /// Keep per-item scratch directories
    #[arg(long)]
    keep_work_dirs: bool,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long)]
    batch_size: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Run failed");
            eprintln!("qmap-wf: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Run(args) => {
            let options = Overrides {
                batch_size: args.batch_size,
                dry_run: args.dry_run,
                keep_work_dirs: args.keep_work_dirs,
            };
            run(&args.common, options).await
        }
        Command::Plan(args) => {
            let options = Overrides {
                batch_size: args.batch_size,
                dry_run: true,
                keep_work_dirs: false,
            };
            run(&args.common, options).await
        }
        Command::Ledger(args) => {
            let (config, work_root) = load(&args)?;
            init_tracing(&config.logging)?;
            let path = Ledger::path_in(&work_root);
            match Ledger::read(&path)? {
                Some(doc) => print!("{}", doc.report()),
                None => println!("No ledger at {}", path.display()),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Command-line settings layered over the configuration
struct Overrides {
    batch_size: Option<usize>,
    dry_run: bool,
    keep_work_dirs: bool,
}

async fn run(common: &CommonArgs, overrides: Overrides) -> Result<ExitCode> {
    let (config, work_root) = load(common)?;
    init_tracing(&config.logging)?;

    info!("Starting qmap-wf {}", qmap_wf::version_string());
    info!(work_root = %work_root.display(), "Work root resolved");

    std::fs::create_dir_all(&work_root)
        .with_context(|| format!("Failed to create work root {}", work_root.display()))?;

    let mut options = RunOptions::from_config(&config, work_root);
    options.dry_run = overrides.dry_run;
    options.keep_work_dirs |= overrides.keep_work_dirs;
    if let Some(batch_size) = overrides.batch_size {
        anyhow::ensure!(batch_size >= 1, "--batch-size must be at least 1");
        options.batch_size = batch_size;
    }

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let collaborators = Collaborators::from_config(&config);
    let coordinator = RunCoordinator::new(config, options, collaborators, cancel);
    let summary = coordinator.run().await?;

    println!("{}", summary);
    if summary.has_failures() {
        Ok(ExitCode::from(2))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Resolve and load the configuration, then the work root
fn load(common: &CommonArgs) -> Result<(WorkflowConfig, PathBuf)> {
    let config_path = common_config::resolve_config_path(common.config.as_deref(), MODULE_NAME)?;
    let config = WorkflowConfig::load(config_path.as_deref()).with_context(|| match &config_path {
        Some(p) => format!("Invalid configuration in {}", p.display()),
        None => "Invalid default configuration".to_string(),
    })?;
    let work_root = common_config::resolve_work_root(
        common.work_root.as_deref(),
        WORK_ROOT_ENV_VAR,
        config.work_root.as_deref(),
    );
    Ok((config, work_root))
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    let file_layer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize tracing")?;
    Ok(())
}

/// Cancel the run on Ctrl-C or SIGTERM; the current item is abandoned
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::warn!("Shutdown requested, cancelling run");
        cancel.cancel();
    });
}
