// ABOUTME: CLI entry point for record-replicator
// ABOUTME: Runs configured jobs once, or continuously as a daemon

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use record_replicator::config::ReplicatorConfig;
use record_replicator::daemon::{
    Daemon, DaemonJobRunner, FatalFault, JsonLinesStatusSink, LogStatusSink, StatusSink, Supervisor,
};
use record_replicator::progress::{
    BarProgressLogger, CompositeProgressLogger, ProgressLogger, TracingProgressLogger,
};
use record_replicator::source::RestSource;
use record_replicator::state::CheckpointStore;
use record_replicator::target::PgConnector;
use record_replicator::utils::sanitize_url;
use record_replicator::JobRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "record-replicator")]
#[command(about = "Replicate REST table API records into PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run jobs once, in configuration order, stopping at the first failure
    Run {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: PathBuf,
        /// Run only these jobs (repeatable; default: all)
        #[arg(long = "job")]
        jobs: Vec<String>,
        /// Disable terminal progress bars
        #[arg(long)]
        no_progress: bool,
    },
    /// Run jobs on the configured interval until interrupted
    Daemon {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: PathBuf,
        /// Run only these jobs (repeatable; default: all)
        #[arg(long = "job")]
        jobs: Vec<String>,
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Run {
            config,
            jobs,
            no_progress,
        } => run_jobs(&config, &jobs, no_progress).await,
        Commands::Daemon { config, jobs, once } => run_daemon(&config, jobs, once).await,
    }
}

fn build_runner(
    config: &ReplicatorConfig,
    progress: Arc<dyn ProgressLogger>,
) -> anyhow::Result<JobRunner> {
    let source = RestSource::new(&config.source).context("Failed to create source client")?;
    let connector = PgConnector::new(&config.target.url, &config.target.schema)?;
    tracing::info!(
        "Replicating {} into {}",
        sanitize_url(&config.source.url),
        sanitize_url(&config.target.url)
    );
    Ok(JobRunner::new(
        Arc::new(source),
        Arc::new(connector),
        progress,
    ))
}

async fn run_jobs(path: &Path, names: &[String], no_progress: bool) -> anyhow::Result<()> {
    let config = ReplicatorConfig::load(path)?;

    let mut progress = CompositeProgressLogger::new(vec![Arc::new(TracingProgressLogger)]);
    if !no_progress {
        progress.push(Arc::new(BarProgressLogger::new()));
    }
    let runner = build_runner(&config, Arc::new(progress))?;

    let state_path = &config.daemon.state_path;
    let mut store = CheckpointStore::load_or_default(state_path).await?;

    for def in config.select_jobs(names)? {
        let job = def.resolve(store.get(&def.name))?;
        let metrics = runner
            .run(&job)
            .await
            .with_context(|| format!("Job {} failed", def.name))?;

        store.record(&def.name, &def.fingerprint(), &metrics);
        store.save(state_path).await?;
        print!("{}", metrics.to_properties());
    }

    Ok(())
}

async fn run_daemon(path: &Path, jobs: Vec<String>, once: bool) -> anyhow::Result<()> {
    let config = ReplicatorConfig::load(path)?;

    let sink: Arc<dyn StatusSink> = match &config.daemon.status_path {
        Some(status_path) => Arc::new(JsonLinesStatusSink::open(status_path)?),
        None => Arc::new(LogStatusSink),
    };
    let runner = build_runner(&config, Arc::new(TracingProgressLogger))?;
    let (supervisor, mut faults) = Supervisor::new();
    let daemon = Daemon::new(config, DaemonJobRunner::new(runner, sink, supervisor)).with_jobs(jobs);

    if once {
        let stats = daemon.run_cycle().await?;
        if let Ok(fault) = faults.try_recv() {
            halt(fault);
        }
        if !stats.is_success() {
            bail!("{} of the jobs failed", stats.jobs_failed);
        }
        return Ok(());
    }

    tracing::info!("Starting daemon; press Ctrl+C to stop");

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = ctrl_c_tx.send(());
    });

    tokio::select! {
        result = daemon.run(shutdown_rx) => result?,
        Some(fault) = faults.recv() => halt(fault),
    }
    if let Ok(fault) = faults.try_recv() {
        halt(fault);
    }

    Ok(())
}

/// In-process state is untrusted after a fatal fault; end the process so a
/// service manager can restart it.
fn halt(fault: FatalFault) -> ! {
    tracing::error!(
        "Fatal fault in job {} (run {}): {}; exiting",
        fault.job,
        fault.run_key,
        fault.message
    );
    std::process::exit(70)
}
