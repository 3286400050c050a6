//! Per-execution handle given to job handlers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::{Job, JobParams, JobPriority};
use crate::manager::{CreateJob, JobManager};

/// Everything a handler may do while it runs, scoped to its own job.
///
/// The context is the only path from handler code back into the store:
/// progress, stage, logs, warnings, heartbeats, cancellation checks,
/// child jobs and named locks all go through it, carrying the job's
/// identity and tenant scope so handlers cannot write outside their row.
pub struct JobContext {
    manager: Arc<JobManager>,
    job_id: Uuid,
    org_id: Uuid,
    entity_id: Option<Uuid>,
    fiscal_year: Option<i32>,
    shutdown: CancellationToken,
    // Warnings accumulate here and land on the job row at completion.
    warnings: Mutex<Vec<String>>,
    stage: Mutex<Option<String>>,
}

impl JobContext {
    pub fn new(manager: Arc<JobManager>, job: &Job, shutdown: CancellationToken) -> Self {
        Self {
            manager,
            job_id: job.id,
            org_id: job.org_id,
            entity_id: job.entity_id,
            fiscal_year: job.fiscal_year,
            shutdown,
            warnings: Mutex::new(Vec::new()),
            stage: Mutex::new(job.stage.clone()),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn org_id(&self) -> Uuid {
        self.org_id
    }

    pub fn entity_id(&self) -> Option<Uuid> {
        self.entity_id
    }

    pub fn fiscal_year(&self) -> Option<i32> {
        self.fiscal_year
    }

    // ------------------------------------------------------------------
    // Progress and observability
    // ------------------------------------------------------------------

    /// Record a progress step. Percent is clamped to [0, 100] and never
    /// moves backwards; counters merge into the stored map key-by-key.
    pub async fn update_progress(
        &self,
        percent: i16,
        detail: Option<&str>,
        counters: Option<&serde_json::Value>,
    ) -> Result<()> {
        let stage = self.current_stage();
        self.manager
            .update_progress(self.job_id, percent, stage.as_deref(), detail, counters)
            .await
    }

    /// Enter a named stage. The stage is stamped on later progress writes
    /// and on any error raised while it is current.
    pub async fn set_stage(&self, stage: &str) -> Result<()> {
        *self.lock_stage() = Some(stage.to_string());
        self.manager.set_stage(self.job_id, stage).await
    }

    pub async fn log(&self, message: &str) -> Result<()> {
        self.manager.append_log(self.job_id, message).await
    }

    /// Record a non-fatal problem. Warnings are surfaced on the finished
    /// job alongside its result.
    pub async fn warn(&self, message: &str) -> Result<()> {
        self.lock_warnings().push(message.to_string());
        self.manager.append_warning(self.job_id, message).await
    }

    /// Snapshot of the warnings recorded so far in this execution.
    pub fn warnings(&self) -> Vec<String> {
        self.lock_warnings().clone()
    }

    /// Explicit liveness checkpoint, for handlers whose long stretches of
    /// work outlast the runner's automatic heartbeat cadence guarantees.
    pub async fn heartbeat(&self, note: Option<String>) -> Result<()> {
        self.manager.heartbeat_note(self.job_id, note).await
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Whether this job should stop: either a cancellation request was
    /// recorded or the worker is shutting down. Handlers poll this at
    /// their own checkpoints; cancellation is cooperative, never forced.
    pub async fn check_cancelled(&self) -> Result<bool> {
        if self.shutdown.is_cancelled() {
            return Ok(true);
        }
        self.manager.is_cancel_requested(self.job_id).await
    }

    // ------------------------------------------------------------------
    // Child jobs
    // ------------------------------------------------------------------

    /// Create a child job inheriting this job's tenant scope. The child is
    /// an independent job; this one may finish before it runs.
    pub async fn create_child_job(
        &self,
        params: JobParams,
        priority: JobPriority,
    ) -> Result<(Job, bool)> {
        let mut request = CreateJob::builder()
            .org_id(self.org_id)
            .params(params)
            .priority(priority)
            .parent_id(self.job_id)
            .created_by(format!("job:{}", self.job_id))
            .build();
        request.entity_id = self.entity_id;
        request.fiscal_year = self.fiscal_year;
        self.manager.create_job(request).await
    }

    // ------------------------------------------------------------------
    // Named locks
    // ------------------------------------------------------------------

    pub async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        reason: Option<&str>,
    ) -> Result<bool> {
        self.manager.acquire_lock(key, self.job_id, ttl, reason).await
    }

    pub async fn release_lock(&self, key: &str) -> Result<bool> {
        self.manager.release_lock(key, self.job_id).await
    }

    // ------------------------------------------------------------------
    // Internals shared with the runner
    // ------------------------------------------------------------------

    pub(crate) fn current_stage(&self) -> Option<String> {
        self.lock_stage().clone()
    }

    pub(crate) fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut *self.lock_warnings())
    }

    fn lock_warnings(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.warnings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stage(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.stage.lock().unwrap_or_else(|e| e.into_inner())
    }
}
