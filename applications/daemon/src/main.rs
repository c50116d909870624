/// SoulSpot - music library and download daemon
use anyhow::Context;
use clap::{Parser, Subcommand};
use soulspot_core::{JobPriority, JobStatus};
use soulspot_daemon::{
    commands,
    config::SoulSpotConfig,
    daemon::{self, DaemonBuilder},
    telemetry,
};
use soulspot_storage::logs::{LogLevel, LogQuery};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "soulspot")]
#[command(about = "SoulSpot music library and download daemon", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "SOULSPOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until interrupted
    Run,
    /// Queue a library scan; it runs when the daemon next starts
    EnqueueScan {
        /// Directory to scan
        path: PathBuf,
        /// low, normal, high, urgent or a number
        #[arg(short, long, default_value = "normal")]
        priority: JobPriority,
    },
    /// List jobs, newest first
    Jobs {
        /// pending, running, completed, failed or cancelled
        #[arg(short, long)]
        status: Option<JobStatus>,
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
    /// Cancel a pending job
    Cancel {
        /// Job id
        id: String,
    },
    /// Show the most recent log records, oldest first
    Logs {
        /// Least severe level to show
        #[arg(long)]
        level: Option<LogLevel>,
        /// Only targets starting with this prefix
        #[arg(short, long)]
        target: Option<String>,
        /// Only messages containing this text
        #[arg(short, long)]
        contains: Option<String>,
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
    /// Print job, track and log counts as JSON
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config =
        SoulSpotConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.validate()?;

    // Only the daemon persists its own logs
    let persist_logs = matches!(cli.command, Commands::Run);
    let log_sink = telemetry::init(&config.logging, persist_logs)?;

    match cli.command {
        Commands::Run => {
            run(config, log_sink).await?;
        }
        Commands::EnqueueScan { path, priority } => {
            enqueue_scan(&config, &path, priority).await?;
        }
        Commands::Jobs { status, limit } => {
            list_jobs(&config, status, limit).await?;
        }
        Commands::Cancel { id } => {
            let db = daemon::open_database(&config).await?;
            commands::cancel_job(&db, &id).await?;
            db.close().await;
            println!("Cancelled job {id}");
        }
        Commands::Logs {
            level,
            target,
            contains,
            limit,
        } => {
            let query = LogQuery {
                min_level: level,
                target_prefix: target,
                contains,
                since: None,
                limit,
            };
            show_logs(&config, &query).await?;
        }
        Commands::Stats => {
            show_stats(&config).await?;
        }
    }

    Ok(())
}

async fn run(config: SoulSpotConfig, log_sink: Option<telemetry::LogSink>) -> anyhow::Result<()> {
    tracing::info!("Starting SoulSpot daemon");
    tracing::info!("Workers: {}", config.workers.count);
    tracing::info!("Library paths: {:?}", config.library.scan_paths);

    let mut builder = DaemonBuilder::new(config);
    if let Some(sink) = log_sink {
        builder = builder.with_log_sink(sink);
    }

    let mut daemon = builder.build().await?;
    daemon.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    match daemon.stats().await {
        Ok(stats) => tracing::info!(
            tracks = stats.tracks,
            lock_errors = stats.lock_metrics.lock_errors,
            lock_retries = stats.lock_metrics.retries,
            dropped_logs = stats.dropped_logs,
            "Final stats"
        ),
        Err(e) => tracing::warn!(error = %e, "Failed to collect final stats"),
    }

    daemon.shutdown().await;
    Ok(())
}

async fn enqueue_scan(
    config: &SoulSpotConfig,
    path: &Path,
    priority: JobPriority,
) -> anyhow::Result<()> {
    let db = daemon::open_database(config).await?;
    let job = commands::enqueue_scan(&db, path, priority, config.workers.max_job_attempts).await?;
    db.close().await;

    println!("Queued library scan {}", job.id);
    Ok(())
}

async fn list_jobs(
    config: &SoulSpotConfig,
    status: Option<JobStatus>,
    limit: i64,
) -> anyhow::Result<()> {
    let db = daemon::open_database(config).await?;
    let jobs = commands::list_jobs(&db, status, limit).await?;
    db.close().await;

    if jobs.is_empty() {
        println!("No jobs");
    }
    for job in &jobs {
        println!("{}", commands::format_job(job));
    }
    Ok(())
}

async fn show_logs(config: &SoulSpotConfig, query: &LogQuery) -> anyhow::Result<()> {
    let store = daemon::open_log_store(config).await?;
    let records = commands::query_logs(&store, query).await?;
    store.close().await;

    // Oldest first reads naturally in a terminal
    for record in records.iter().rev() {
        println!("{}", commands::format_log(record));
    }
    Ok(())
}

async fn show_stats(config: &SoulSpotConfig) -> anyhow::Result<()> {
    let db = daemon::open_database(config).await?;
    let store = daemon::open_log_store(config).await?;
    let stats = commands::stats(&db, &store).await?;
    store.close().await;
    db.close().await;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
