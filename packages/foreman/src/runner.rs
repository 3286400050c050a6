//! Executes one claimed job: typed-param decode, handler dispatch, an
//! automatic heartbeat task, and exactly one terminal transition.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::context::JobContext;
use crate::job::{ErrorKind, Job, JobError};
use crate::manager::JobManager;
use crate::registry::HandlerRegistry;

/// Typed failure causes handlers can raise to get an exact classification
/// instead of the string heuristics in [`classify`].
#[derive(Debug, Error)]
pub enum Fault {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("ai quota exceeded: {0}")]
    AiQuota(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("connection failed: {0}")]
    Connection(String),
}

impl Fault {
    fn kind(&self) -> ErrorKind {
        match self {
            Fault::Validation(_) => ErrorKind::ValidationError,
            Fault::RateLimit(_) => ErrorKind::RateLimit,
            Fault::AiQuota(_) => ErrorKind::AiQuotaExceeded,
            Fault::Timeout(_) => ErrorKind::Timeout,
            Fault::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Fault::NotFound(_) => ErrorKind::NotFound,
            Fault::Connection(_) => ErrorKind::ConnectionError,
        }
    }
}

/// Classify an arbitrary handler error into a persisted [`ErrorKind`].
///
/// A downcast to [`Fault`] is authoritative; otherwise the message is
/// matched against well-known phrasings from upstream services. Order
/// matters: quota before rate limit, since quota messages often mention
/// both.
pub fn classify(error: &anyhow::Error) -> ErrorKind {
    if let Some(fault) = error.downcast_ref::<Fault>() {
        return fault.kind();
    }
    let text = format!("{error:#}").to_lowercase();
    if text.contains("quota") {
        ErrorKind::AiQuotaExceeded
    } else if text.contains("rate limit") || text.contains("too many requests") {
        ErrorKind::RateLimit
    } else if text.contains("timed out") || text.contains("timeout") {
        ErrorKind::Timeout
    } else if text.contains("permission")
        || text.contains("unauthorized")
        || text.contains("forbidden")
    {
        ErrorKind::PermissionDenied
    } else if text.contains("not found") {
        ErrorKind::NotFound
    } else if text.contains("connection") || text.contains("connect") || text.contains("network") {
        ErrorKind::ConnectionError
    } else if text.contains("invalid") || text.contains("validation") {
        ErrorKind::ValidationError
    } else {
        ErrorKind::Internal
    }
}

pub struct JobRunner {
    manager: Arc<JobManager>,
    registry: Arc<HandlerRegistry>,
    heartbeat_interval: Duration,
}

impl JobRunner {
    pub fn new(
        manager: Arc<JobManager>,
        registry: Arc<HandlerRegistry>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            manager,
            registry,
            heartbeat_interval,
        }
    }

    /// Run one claimed job to a terminal state.
    ///
    /// `shutdown` is the worker's drain signal; a job interrupted by it
    /// finishes as cancelled with a `worker_shutdown` error so callers can
    /// tell it apart from a user cancellation.
    pub async fn run(&self, job: Job, shutdown: CancellationToken) -> Result<()> {
        let job_id = job.id;

        let params = match job.typed_params() {
            Ok(params) => params,
            Err(e) => {
                // The row predates a params schema change, or was written by
                // a newer deploy. Not a handler bug, but not retryable as-is.
                let job_error = JobError::new(
                    ErrorKind::WorkerException,
                    format!("stored params do not deserialize: {e}"),
                );
                self.manager.mark_failed(job_id, job_error).await?;
                return Ok(());
            }
        };

        let Some(handler) = self.registry.get(job.job_type) else {
            let job_error = JobError::new(
                ErrorKind::NoHandler,
                format!("no handler registered for job type {}", job.job_type),
            );
            self.manager.mark_failed(job_id, job_error).await?;
            return Ok(());
        };

        let ctx = JobContext::new(self.manager.clone(), &job, shutdown.clone());

        // Background heartbeat so the stuck-job sweep never reaps a live
        // handler that doesn't checkpoint on its own.
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = {
            let manager = self.manager.clone();
            let stop = heartbeat_stop.clone();
            let interval = self.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick fires immediately
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = manager.heartbeat(job_id).await {
                                warn!(job_id = %job_id, error = ?e, "heartbeat write failed");
                            }
                        }
                    }
                }
            })
        };

        // The guard cancels the stop token when this future is dropped, so
        // an aborted runner cannot leave the loop refreshing heartbeats.
        let heartbeat_guard = heartbeat_stop.drop_guard();

        let outcome = handler.run(params, &ctx).await;

        drop(heartbeat_guard);
        let _ = heartbeat.await;

        self.finalize(job_id, &ctx, outcome, &shutdown).await
    }

    async fn finalize(
        &self,
        job_id: uuid::Uuid,
        ctx: &JobContext,
        outcome: Result<serde_json::Value>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        if shutdown.is_cancelled() {
            let job_error = JobError::new(
                ErrorKind::WorkerShutdown,
                "worker shut down while the job was running",
            );
            self.manager.mark_cancelled(job_id, Some(job_error)).await?;
            return Ok(());
        }

        if self.manager.is_cancel_requested(job_id).await? {
            self.manager.mark_cancelled(job_id, None).await?;
            return Ok(());
        }

        match outcome {
            Ok(result) => {
                let completed = self
                    .manager
                    .mark_completed(job_id, result, ctx.take_warnings())
                    .await?;
                if !completed {
                    // A cancellation request landed after our check above.
                    debug!(job_id = %job_id, "completion lost to a cancellation request");
                    self.manager.mark_cancelled(job_id, None).await?;
                }
            }
            Err(e) => {
                let kind = classify(&e);
                let mut job_error = JobError::new(kind, format!("{e}"));
                if let Some(stage) = ctx.current_stage() {
                    job_error = job_error.with_stage(stage);
                }
                // Persist the terse record; the full chain goes to the log.
                error!(job_id = %job_id, kind = ?kind, error = ?e, "handler failed");
                self.manager.mark_failed(job_id, job_error).await?;
            }
        }
        Ok(())
    }
}
