//! Job manager: the single owner of the job lifecycle.
//!
//! Everything that mutates a job row flows through here — idempotent
//! creation, progress and heartbeat writes, terminal transitions, retries,
//! cancellation, the stuck-job sweep and named-lock brokering. Handlers
//! never touch the store directly; they go through a [`JobContext`]
//! (see `context.rs`), which in turn calls into this type.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::events::{JobEvent, JobEventKind};
use crate::job::{
    idempotency_key, ErrorKind, Job, JobError, JobParams, JobPriority, JobStatus, JobType,
    DEFAULT_MAX_RETRIES,
};
use crate::store::{JobFilter, JobStore, StoreError};

// ============================================================================
// Requests and outcomes
// ============================================================================

/// A job-creation request.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CreateJob {
    pub org_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub entity_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub fiscal_year: Option<i32>,
    pub params: JobParams,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default, setter(strip_option))]
    pub parent_id: Option<Uuid>,
    /// Overrides the computed idempotency key. Callers that pass this own
    /// the deduplication semantics.
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub created_by: Option<String>,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: i32,
}

#[derive(Debug)]
pub enum CancelOutcome {
    /// The job was queued and is now cancelled.
    Cancelled,
    /// The job is running; cancellation was durably recorded and the runner
    /// will honor it at its next checkpoint.
    Requested,
    Refused(String),
}

impl CancelOutcome {
    pub fn accepted(&self) -> bool {
        !matches!(self, CancelOutcome::Refused(_))
    }
}

#[derive(Debug)]
pub enum RetryOutcome {
    Retried(Job),
    Refused(String),
}

// ============================================================================
// Manager
// ============================================================================

pub struct JobManager {
    store: Arc<dyn JobStore>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create a job, deduplicating by idempotency key.
    ///
    /// Returns the job and whether it already existed. Two logically
    /// identical requests — even racing inserts — resolve to one row: a
    /// uniqueness violation from the store is answered by re-querying for
    /// the winner rather than erroring.
    pub async fn create_job(&self, request: CreateJob) -> Result<(Job, bool)> {
        let key = request.idempotency_key.clone().unwrap_or_else(|| {
            idempotency_key(
                &request.params,
                request.org_id,
                request.entity_id,
                request.fiscal_year,
            )
        });

        if let Some(existing) = self.store.find_active_by_key(request.org_id, &key).await? {
            debug!(job_id = %existing.id, key = %key, "idempotency hit, returning existing job");
            return Ok((existing, true));
        }

        let job = Job::queued(
            request.org_id,
            request.entity_id,
            request.fiscal_year,
            &request.params,
            request.priority,
            key.clone(),
            request.parent_id,
            request.created_by,
            request.max_retries,
        );

        let job = match self.store.insert(job).await {
            Ok(job) => job,
            Err(StoreError::DuplicateIdempotencyKey(_)) => {
                // Lost the insert race; the winner's row is our job.
                let existing = self
                    .store
                    .find_active_by_key(request.org_id, &key)
                    .await?
                    .with_context(|| {
                        format!("idempotency conflict for {key} but no active job is visible")
                    })?;
                debug!(job_id = %existing.id, key = %key, "lost create race, returning winner");
                return Ok((existing, true));
            }
            Err(e) => return Err(e.into()),
        };

        self.store
            .append_event(JobEvent::stage_changed(job.id, "queued"))
            .await?;
        if let Some(parent_id) = job.parent_id {
            self.store
                .append_event(JobEvent::child_created(parent_id, job.id))
                .await?;
        }

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            org_id = %job.org_id,
            priority = ?job.priority,
            "job created"
        );
        Ok((job, false))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn get_events(
        &self,
        job_id: Uuid,
        kinds: Option<&[JobEventKind]>,
        limit: i64,
    ) -> Result<Vec<JobEvent>> {
        Ok(self.store.list_events(job_id, kinds, limit).await?)
    }

    pub async fn is_cancel_requested(&self, id: Uuid) -> Result<bool> {
        Ok(self.store.is_cancel_requested(id).await?)
    }

    // ------------------------------------------------------------------
    // Claiming
    // ------------------------------------------------------------------

    /// Atomically claim the next eligible queued job for `worker_id`.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        allowed_types: Option<&[JobType]>,
    ) -> Result<Option<Job>> {
        let Some(job) = self.store.claim_next(worker_id, allowed_types).await? else {
            return Ok(None);
        };
        self.store
            .append_event(JobEvent::stage_changed(job.id, "running"))
            .await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            worker_id = %worker_id,
            "job claimed"
        );
        Ok(Some(job))
    }

    // ------------------------------------------------------------------
    // Progress and heartbeat
    // ------------------------------------------------------------------

    /// Write a progress step: percent is clamped to [0, 100] and never
    /// decreases within an attempt; the heartbeat is refreshed as a side
    /// effect.
    pub async fn update_progress(
        &self,
        id: Uuid,
        percent: i16,
        stage: Option<&str>,
        detail: Option<&str>,
        counters: Option<&serde_json::Value>,
    ) -> Result<()> {
        let percent = percent.clamp(0, 100);
        let written = self
            .store
            .write_progress(id, Some(percent), stage, detail, counters)
            .await?;
        if !written {
            // The job finalized under us; nothing to record.
            debug!(job_id = %id, "progress write skipped, job no longer executing");
            return Ok(());
        }
        self.store
            .append_event(JobEvent::progress(
                id,
                percent,
                stage.map(str::to_string),
                detail.map(str::to_string),
            ))
            .await?;
        Ok(())
    }

    pub async fn set_stage(&self, id: Uuid, stage: &str) -> Result<()> {
        if self
            .store
            .write_progress(id, None, Some(stage), None, None)
            .await?
        {
            self.store
                .append_event(JobEvent::stage_changed(id, stage))
                .await?;
        }
        Ok(())
    }

    /// Refresh only the heartbeat timestamp.
    ///
    /// Deliberately minimal: heartbeat freshness is what the stuck-job sweep
    /// keys on, so this path must keep working even when richer progress
    /// writes fail.
    pub async fn heartbeat(&self, id: Uuid) -> Result<()> {
        self.store.touch_heartbeat(id).await?;
        Ok(())
    }

    /// Heartbeat plus an audit note, for explicit handler checkpoints.
    pub async fn heartbeat_note(&self, id: Uuid, note: Option<String>) -> Result<()> {
        self.store.touch_heartbeat(id).await?;
        self.store
            .append_event(JobEvent::heartbeat(id, note))
            .await?;
        Ok(())
    }

    pub async fn append_log(&self, id: Uuid, message: &str) -> Result<()> {
        debug!(job_id = %id, "{message}");
        self.store.append_event(JobEvent::log(id, message)).await?;
        Ok(())
    }

    pub async fn append_warning(&self, id: Uuid, message: &str) -> Result<()> {
        warn!(job_id = %id, "{message}");
        self.store
            .append_event(JobEvent::warning(id, message))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Terminal transitions
    // ------------------------------------------------------------------

    /// Finalize a successful attempt. Returns `false` when the job is no
    /// longer plainly `running` (a cancellation request won the race).
    pub async fn mark_completed(
        &self,
        id: Uuid,
        result: serde_json::Value,
        warnings: Vec<String>,
    ) -> Result<bool> {
        if !self.store.complete(id, result, &warnings).await? {
            return Ok(false);
        }
        self.store
            .append_event(JobEvent::stage_changed(id, "completed"))
            .await?;
        info!(job_id = %id, warnings = warnings.len(), "job completed");
        Ok(true)
    }

    /// Finalize a failed attempt with the structured error. Only the terse
    /// record is persisted; callers log diagnostic detail to the
    /// operational log themselves.
    pub async fn mark_failed(&self, id: Uuid, job_error: JobError) -> Result<bool> {
        if !self.store.fail(id, &job_error).await? {
            return Ok(false);
        }
        self.store
            .append_event(JobEvent::error(id, &job_error))
            .await?;
        error!(
            job_id = %id,
            kind = ?job_error.kind,
            stage = job_error.stage.as_deref().unwrap_or("-"),
            "job failed: {}",
            job_error.message
        );
        Ok(true)
    }

    /// Finalize a cancelled attempt. `job_error` distinguishes shutdown-
    /// induced cancellation (`worker_shutdown`) from a plain user request.
    pub async fn mark_cancelled(&self, id: Uuid, job_error: Option<JobError>) -> Result<bool> {
        if !self.store.finalize_cancelled(id, job_error.as_ref()).await? {
            return Ok(false);
        }
        self.store
            .append_event(JobEvent::stage_changed(id, "cancelled"))
            .await?;
        info!(job_id = %id, kind = ?job_error.map(|e| e.kind), "job cancelled");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Cancel a job: queued jobs immediately, running jobs cooperatively.
    /// The request is durably recorded before this returns; the actual stop
    /// of a running handler is best-effort and checkpoint-bounded.
    ///
    /// The guarded store transitions are attempted directly, so a job that
    /// changes state concurrently lands in the right outcome instead of
    /// being mis-reported from a stale read.
    pub async fn cancel_job(&self, id: Uuid, requested_by: &str) -> Result<CancelOutcome> {
        if self.store.cancel_queued(id, requested_by).await? {
            self.store
                .append_event(JobEvent::cancel_requested(id, requested_by))
                .await?;
            self.store
                .append_event(JobEvent::stage_changed(id, "cancelled"))
                .await?;
            info!(job_id = %id, requested_by, "queued job cancelled");
            return Ok(CancelOutcome::Cancelled);
        }

        if self.store.request_cancel(id, requested_by).await? {
            self.store
                .append_event(JobEvent::cancel_requested(id, requested_by))
                .await?;
            info!(job_id = %id, requested_by, "cancellation requested");
            return Ok(CancelOutcome::Requested);
        }

        // Neither guard matched: already requested, already terminal, or
        // no such job.
        let job = self
            .store
            .get(id)
            .await?
            .ok_or(StoreError::JobNotFound(id))?;
        match job.status {
            JobStatus::CancellationRequested => Ok(CancelOutcome::Requested),
            status if status.is_terminal() => Ok(CancelOutcome::Refused(format!(
                "job is already {}, nothing to cancel",
                status.as_str()
            ))),
            status => Ok(CancelOutcome::Refused(format!(
                "job moved to {} while cancelling; try again",
                status.as_str()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Retry
    // ------------------------------------------------------------------

    /// Create a retry of a failed or cancelled job.
    ///
    /// The retry is a fresh row with a derived idempotency key and
    /// `retry_of` pointing at `id`; the original is left untouched.
    pub async fn retry_job(
        &self,
        id: Uuid,
        requested_by: &str,
        force: bool,
    ) -> Result<RetryOutcome> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or(StoreError::JobNotFound(id))?;

        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Ok(RetryOutcome::Refused(format!(
                "job is {}; only failed or cancelled jobs can be retried",
                job.status.as_str()
            )));
        }
        if job.retry_count >= job.max_retries && !force {
            return Ok(RetryOutcome::Refused(format!(
                "retry limit reached ({} of {}); pass force to override",
                job.retry_count, job.max_retries
            )));
        }
        if job.error_kind == Some(ErrorKind::NoHandler) && !force {
            return Ok(RetryOutcome::Refused(
                "job failed because no handler is deployed for its type; retrying cannot help"
                    .into(),
            ));
        }

        let retry = job
            .retry(Some(requested_by.to_string()))
            .context("stored job params no longer deserialize")?;
        let retry = match self.store.insert(retry).await {
            Ok(retry) => retry,
            Err(StoreError::DuplicateIdempotencyKey(_)) => {
                return Ok(RetryOutcome::Refused(
                    "a retry of this job is already queued or running".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        self.store
            .append_event(JobEvent::retry_scheduled(job.id, retry.id))
            .await?;
        self.store
            .append_event(JobEvent::stage_changed(retry.id, "queued"))
            .await?;
        info!(
            job_id = %retry.id,
            retry_of = %job.id,
            attempt = retry.retry_count,
            requested_by,
            "retry created"
        );
        Ok(RetryOutcome::Retried(retry))
    }

    // ------------------------------------------------------------------
    // Stuck-job sweep
    // ------------------------------------------------------------------

    /// Fail running jobs whose heartbeat is older than `stale_after`.
    ///
    /// This is the crash-recovery path: a dead worker cannot heartbeat its
    /// claimed jobs, so staleness is the only signal it left behind. The
    /// terminal write re-checks staleness so a heartbeat arriving between
    /// detection and the write wins.
    pub async fn sweep_stale(&self, stale_after: Duration) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(stale_after.as_millis() as i64);
        let stale = self.store.find_stale_running(cutoff).await?;
        let mut reclaimed = Vec::new();

        for job in stale {
            let last_seen = job
                .heartbeat_at
                .map(|hb| hb.to_rfc3339())
                .unwrap_or_else(|| "never".into());
            let mut job_error = JobError::new(
                ErrorKind::WorkerLost,
                format!("worker heartbeat not seen since {last_seen}"),
            );
            if let Some(stage) = &job.stage {
                job_error = job_error.with_stage(stage.clone());
            }

            if self.store.fail_if_stale(job.id, cutoff, &job_error).await? {
                self.store
                    .append_event(JobEvent::error(job.id, &job_error))
                    .await?;
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    worker_id = job.worker_id.as_deref().unwrap_or("-"),
                    last_seen = %last_seen,
                    "stale running job failed as worker_lost"
                );
                reclaimed.push(job.id);
            }
        }
        Ok(reclaimed)
    }

    // ------------------------------------------------------------------
    // Named locks
    // ------------------------------------------------------------------

    /// Acquire a named lock for a job. First writer wins; an expired lock
    /// is stealable, so a crashed holder cannot deadlock the key forever.
    pub async fn acquire_lock(
        &self,
        key: &str,
        job_id: Uuid,
        ttl: Duration,
        reason: Option<&str>,
    ) -> Result<bool> {
        let acquired = self.store.acquire_lock(key, job_id, ttl, reason).await?;
        debug!(lock_key = %key, job_id = %job_id, acquired, "lock acquisition attempted");
        Ok(acquired)
    }

    /// Release a named lock. Only the holding job may release.
    pub async fn release_lock(&self, key: &str, job_id: Uuid) -> Result<bool> {
        let released = self.store.release_lock(key, job_id).await?;
        debug!(lock_key = %key, job_id = %job_id, released, "lock released");
        Ok(released)
    }
}
