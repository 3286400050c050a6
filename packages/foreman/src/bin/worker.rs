//! Job Worker
//!
//! This binary runs a worker process: it claims queued jobs from
//! Postgres, executes registered handlers, heartbeats its claims and
//! sweeps for jobs left behind by crashed workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use foreman::{
    Config, HandlerRegistry, JobManager, JobType, PostgresJobStore, Worker, WorkerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "worker", about = "Background job worker")]
struct Args {
    /// Jobs executed concurrently by this process
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Seconds to sleep between claim attempts when the queue is empty
    #[arg(long, default_value_t = 5)]
    poll_interval_secs: u64,

    /// Seconds between automatic heartbeats for running jobs
    #[arg(long, default_value_t = 15)]
    heartbeat_interval_secs: u64,

    /// Seconds without a heartbeat before a running job is presumed lost
    #[arg(long, default_value_t = 300)]
    stale_after_secs: u64,

    /// Seconds between stuck-job sweeps
    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,

    /// Stable worker identity; defaults to a random one
    #[arg(long)]
    worker_id: Option<String>,

    /// Restrict claiming to these job types (repeatable); claims all when
    /// omitted
    #[arg(long = "job-type", value_parser = clap::value_parser!(JobType))]
    job_types: Vec<JobType>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,foreman=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    tracing::info!("Starting job worker");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let manager = Arc::new(JobManager::new(Arc::new(PostgresJobStore::new(pool))));

    // Handler composition point: register one handler per job type the
    // deployment serves. Unregistered types fail as no_handler.
    let registry = Arc::new(HandlerRegistry::new());

    let mut worker_config = match args.worker_id {
        Some(id) => WorkerConfig::with_worker_id(id),
        None => WorkerConfig::default(),
    };
    worker_config.concurrency = args.concurrency;
    worker_config.poll_interval = Duration::from_secs(args.poll_interval_secs);
    worker_config.heartbeat_interval = Duration::from_secs(args.heartbeat_interval_secs);
    worker_config.stale_after = Duration::from_secs(args.stale_after_secs);
    worker_config.sweep_interval = Duration::from_secs(args.sweep_interval_secs);
    if !args.job_types.is_empty() {
        worker_config.job_types = Some(args.job_types);
    }

    let worker = Worker::new(manager, registry, worker_config);
    worker.run_until_shutdown().await
}
