//! resilience-dlq - dead-letter queue operations
//!
//! Inspects and drives the persisted dead-letter queue: run a recovery batch,
//! keep a periodic processor running, show statistics, list jobs, force a
//! retry and purge expired jobs. Output is pretty-printed JSON on stdout.

use anyhow::Context;
use clap::{Parser, Subcommand};
use resilience_core::config::{LogFormat, ResilienceSettings};
use resilience_core::dead_letter::{
    DeadLetterQueueService, ExternalApiRetryStrategy, HttpReplayer, JobFilter, ProcessOptions,
    StatsFilter, WebhookRetryStrategy,
};
use resilience_core::storage::DeadLetterStore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "resilience-dlq")]
#[command(about = "Operate the persisted dead-letter queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Database URL (`file:` path or `libsql://` URL)
    #[arg(long, global = true, env = "RESILIENCE_DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one recovery batch
    Process {
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Process batches periodically until Ctrl-C
    Run {
        /// Interval between batches, e.g. "30s" or "5m"
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        interval: Option<Duration>,
    },
    /// Show queue statistics
    Stats {
        #[arg(long)]
        company_id: Option<String>,
        #[arg(long)]
        job_type: Option<String>,
    },
    /// List queued jobs
    List {
        #[arg(long)]
        company_id: Option<String>,
        #[arg(long)]
        job_type: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Reset a job's retry budget and recover it now
    Retry { job_id: Uuid },
    /// Delete jobs older than the retention period
    Cleanup,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(feature = "turso")]
async fn open_store(settings: &ResilienceSettings) -> anyhow::Result<Arc<dyn DeadLetterStore>> {
    let config = resilience_core::storage::TursoConfig::from(&settings.storage);
    let store = resilience_core::storage::TursoStore::open(&config)
        .await
        .with_context(|| format!("failed to open {}", settings.storage.database_url))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "turso"))]
async fn open_store(_settings: &ResilienceSettings) -> anyhow::Result<Arc<dyn DeadLetterStore>> {
    tracing::warn!("Built without the turso feature, using in-memory storage");
    Ok(Arc::new(resilience_core::storage::MemoryStore::new()))
}

async fn build_service(settings: &ResilienceSettings) -> anyhow::Result<Arc<DeadLetterQueueService>> {
    let store = open_store(settings).await?;
    let service = Arc::new(DeadLetterQueueService::new(store, settings.dead_letter.clone()));

    let replayer = Arc::new(HttpReplayer::new(REPLAY_TIMEOUT)?);
    service
        .register_strategy(Arc::new(WebhookRetryStrategy::new(replayer.clone())))
        .await;
    service
        .register_strategy(Arc::new(ExternalApiRetryStrategy::new(replayer)))
        .await;
    Ok(service)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings =
        ResilienceSettings::load(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(url) = cli.database_url {
        settings.storage.database_url = url;
    }
    if cli.debug {
        settings.logging.level = "debug".to_string();
        settings.logging.format = LogFormat::Compact;
    }
    let _log_guard = resilience_core::logging::init_logging(&settings.logging)?;

    let service = build_service(&settings).await?;

    match cli.command {
        Command::Process { batch_size } => {
            let summary = service.process_jobs(ProcessOptions { batch_size }).await?;
            print_json(&summary)?;
        }
        Command::Run { interval } => {
            let interval = interval.unwrap_or(settings.dead_letter.processing_interval);
            let shutdown = CancellationToken::new();
            let handle = service.clone().spawn_processor(interval, shutdown.clone());

            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl-C, stopping processor");
            shutdown.cancel();
            handle.await?;
        }
        Command::Stats { company_id, job_type } => {
            let stats = service.get_stats(StatsFilter { company_id, job_type }).await?;
            print_json(&stats)?;
        }
        Command::List {
            company_id,
            job_type,
            limit,
        } => {
            let jobs = service
                .list_jobs(JobFilter {
                    company_id,
                    job_type,
                    limit: Some(limit),
                    ..Default::default()
                })
                .await?;
            print_json(&jobs)?;
        }
        Command::Retry { job_id } => {
            let outcome = service.retry_job(job_id).await?;
            print_json(&outcome)?;
        }
        Command::Cleanup => {
            let removed = service.cleanup().await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
    }

    Ok(())
}
