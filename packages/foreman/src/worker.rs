//! Worker process loop: polls for claimable jobs, runs them with bounded
//! concurrency, sweeps for stuck jobs, and drains gracefully on shutdown.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::job::{ErrorKind, JobError, JobType};
use crate::manager::JobManager;
use crate::registry::HandlerRegistry;
use crate::runner::JobRunner;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identity stamped on every job this process claims.
    pub worker_id: String,
    /// Jobs executed concurrently by this process.
    pub concurrency: usize,
    /// Sleep between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Cadence of the automatic per-job heartbeat.
    pub heartbeat_interval: Duration,
    /// A running job whose heartbeat is older than this is presumed lost.
    pub stale_after: Duration,
    /// Cadence of the stuck-job sweep.
    pub sweep_interval: Duration,
    /// How long shutdown waits for in-flight jobs before aborting them.
    pub drain_timeout: Duration,
    /// Restrict claiming to these types; `None` claims everything.
    pub job_types: Option<Vec<JobType>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 4,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            job_types: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

pub struct Worker {
    manager: Arc<JobManager>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    // Ids of jobs currently held by runner tasks; survivors of an aborted
    // drain are finalized from here.
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl Worker {
    pub fn new(
        manager: Arc<JobManager>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            manager,
            registry,
            config,
            shutdown: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Token that stops the poll loop and signals in-flight jobs to drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token fires, then drain in-flight jobs.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            job_types = ?self.config.job_types,
            "worker started"
        );

        let sweeper = self.spawn_sweeper();
        let runner = Arc::new(JobRunner::new(
            self.manager.clone(),
            self.registry.clone(),
            self.config.heartbeat_interval,
        ));

        let mut in_flight: JoinSet<()> = JoinSet::new();

        while !self.shutdown.is_cancelled() {
            // Reap whatever finished since the last pass.
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(worker_id = %self.config.worker_id, error = ?e, "job task panicked");
                }
            }

            if in_flight.len() >= self.config.concurrency {
                tokio::select! {
                    _ = in_flight.join_next() => {}
                    _ = self.shutdown.cancelled() => break,
                }
                continue;
            }

            match self
                .manager
                .claim_next(&self.config.worker_id, self.config.job_types.as_deref())
                .await
            {
                Ok(Some(job)) => {
                    let runner = runner.clone();
                    let shutdown = self.shutdown.clone();
                    let active = self.active.clone();
                    self.lock_active().insert(job.id);
                    in_flight.spawn(async move {
                        let job_id = job.id;
                        if let Err(e) = runner.run(job, shutdown).await {
                            error!(job_id = %job_id, error = ?e, "job finalization failed");
                        }
                        active
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&job_id);
                    });
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = ?e, "claim failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }

        self.drain(in_flight).await;
        sweeper.abort();
        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }

    /// Run until SIGINT, then drain.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received, draining");
                shutdown.cancel();
            }
        });
        self.run().await
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.manager.clone();
        let stale_after = self.config.stale_after;
        let interval = self.config.sweep_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match manager.sweep_stale(stale_after).await {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                warn!(count = reclaimed.len(), "stuck jobs failed as worker_lost");
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = ?e, "stuck-job sweep failed"),
                        }
                    }
                }
            }
        })
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        info!(in_flight = in_flight.len(), "draining in-flight jobs");
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        loop {
            tokio::select! {
                joined = in_flight.join_next() => {
                    match joined {
                        Some(Err(e)) if !e.is_cancelled() => {
                            error!(error = ?e, "job task panicked during drain");
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(abandoned = in_flight.len(), "drain timed out, aborting remaining jobs");
                    in_flight.abort_all();
                    while in_flight.join_next().await.is_some() {}
                    break;
                }
            }
        }

        // Aborted runners never reached their own finalization; their jobs
        // are still registered here and must be closed out.
        let abandoned: Vec<Uuid> = self.lock_active().drain().collect();
        for job_id in abandoned {
            let job_error = JobError::new(
                ErrorKind::WorkerShutdown,
                "worker shut down before the job could finish",
            );
            match self.manager.mark_cancelled(job_id, Some(job_error)).await {
                Ok(true) => {}
                Ok(false) => {
                    // The runner finalized it between abort and cleanup.
                }
                Err(e) => {
                    error!(job_id = %job_id, error = ?e, "failed to finalize abandoned job");
                }
            }
        }
    }
}
