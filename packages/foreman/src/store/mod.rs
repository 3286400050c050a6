//! The narrow persistent-store contract the orchestration core runs on.
//!
//! Workers cooperate only through this surface: inserts, conditional
//! updates, an atomic claim, an append-only event log, and named locks.
//! Policy (retry rules, staleness thresholds, polling cadence) lives in the
//! manager and worker, not here.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::events::{JobEvent, JobEventKind};
use crate::job::{Job, JobError, JobStatus, JobType};

/// Default and maximum page sizes for job listings.
pub const DEFAULT_JOB_PAGE: i64 = 50;
pub const MAX_JOB_PAGE: i64 = 200;

/// Default and maximum page sizes for event listings.
pub const DEFAULT_EVENT_PAGE: i64 = 200;
pub const MAX_EVENT_PAGE: i64 = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    /// An active (queued/running/cancellation_requested) job already holds
    /// this idempotency key for the same org.
    #[error("an active job already exists for idempotency key {0}")]
    DuplicateIdempotencyKey(String),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filters for job listings. Results are ordered by creation time descending.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub org_id: Option<Uuid>,
    pub entity_id: Option<Uuid>,
    pub fiscal_year: Option<i32>,
    pub statuses: Option<Vec<JobStatus>>,
    pub job_type: Option<JobType>,
    pub created_by: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl JobFilter {
    pub fn for_org(org_id: Uuid) -> Self {
        Self {
            org_id: Some(org_id),
            ..Default::default()
        }
    }

    pub(crate) fn effective_limit(&self) -> i64 {
        if self.limit <= 0 {
            DEFAULT_JOB_PAGE
        } else {
            self.limit.min(MAX_JOB_PAGE)
        }
    }
}

/// Persistent store operations for jobs, events and named locks.
///
/// # Implementer notes
///
/// - `insert` must enforce idempotency-key uniqueness among active jobs and
///   report violations as [`StoreError::DuplicateIdempotencyKey`]; callers
///   resolve the race by re-querying.
/// - `claim_next` must be a single atomic operation: two stores polled
///   concurrently never hand the same job to two workers.
/// - Conditional transitions (`complete`, `fail`, `cancel_queued`, ...)
///   return `false` when the guard status no longer holds, never error.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly built `queued` job row.
    async fn insert(&self, job: Job) -> StoreResult<Job>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Job>>;

    /// Find the active job holding `key` within `org_id`, if any.
    async fn find_active_by_key(&self, org_id: Uuid, key: &str) -> StoreResult<Option<Job>>;

    async fn list(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;

    /// Atomically claim the next eligible queued job: transition it to
    /// `running`, stamp the claiming worker and start/heartbeat timestamps,
    /// and return the claimed row.
    async fn claim_next(
        &self,
        worker_id: &str,
        allowed_types: Option<&[JobType]>,
    ) -> StoreResult<Option<Job>>;

    /// Write progress for an executing job and refresh its heartbeat.
    ///
    /// The stored percent never decreases within an attempt; `counters` are
    /// merged key-by-key into the existing map. Returns `false` once the job
    /// is no longer executing.
    async fn write_progress(
        &self,
        id: Uuid,
        percent: Option<i16>,
        stage: Option<&str>,
        detail: Option<&str>,
        counters: Option<&serde_json::Value>,
    ) -> StoreResult<bool>;

    /// Refresh only the heartbeat timestamp of an executing job.
    async fn touch_heartbeat(&self, id: Uuid) -> StoreResult<bool>;

    /// `running` -> `completed` with result, warnings and a 100% snapshot.
    /// Returns `false` if the job is not plainly `running` anymore (e.g. a
    /// cancellation request landed in the meantime).
    async fn complete(
        &self,
        id: Uuid,
        result: serde_json::Value,
        warnings: &[String],
    ) -> StoreResult<bool>;

    /// Any active status -> `failed` with the structured error.
    async fn fail(&self, id: Uuid, error: &JobError) -> StoreResult<bool>;

    /// `running` -> `failed`, but only while the heartbeat is still older
    /// than `cutoff`. Guards the stuck-job sweep against a heartbeat that
    /// arrives between detection and the write.
    async fn fail_if_stale(
        &self,
        id: Uuid,
        cutoff: DateTime<Utc>,
        error: &JobError,
    ) -> StoreResult<bool>;

    /// Running jobs whose heartbeat is older than `cutoff`.
    async fn find_stale_running(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Job>>;

    /// `queued` -> `cancelled`, immediate.
    async fn cancel_queued(&self, id: Uuid, requested_by: &str) -> StoreResult<bool>;

    /// `running` -> `cancellation_requested`; the runner honors it
    /// cooperatively.
    async fn request_cancel(&self, id: Uuid, requested_by: &str) -> StoreResult<bool>;

    /// `running`/`cancellation_requested` -> `cancelled`, with an optional
    /// error (e.g. `worker_shutdown`).
    async fn finalize_cancelled(&self, id: Uuid, error: Option<&JobError>) -> StoreResult<bool>;

    async fn is_cancel_requested(&self, id: Uuid) -> StoreResult<bool>;

    /// Append an event, assigning its monotonic sequence number.
    async fn append_event(&self, event: JobEvent) -> StoreResult<JobEvent>;

    /// Events for a job in sequence order, optionally restricted by kind.
    async fn list_events(
        &self,
        job_id: Uuid,
        kinds: Option<&[JobEventKind]>,
        limit: i64,
    ) -> StoreResult<Vec<JobEvent>>;

    /// Atomically acquire a named lock for `job_id`. First writer wins;
    /// expired locks are stealable. Returns whether the lock was acquired.
    async fn acquire_lock(
        &self,
        key: &str,
        job_id: Uuid,
        ttl: Duration,
        reason: Option<&str>,
    ) -> StoreResult<bool>;

    /// Release a named lock. Only succeeds for the holding job.
    async fn release_lock(&self, key: &str, job_id: Uuid) -> StoreResult<bool>;
}

pub(crate) fn effective_event_limit(limit: i64) -> i64 {
    if limit <= 0 {
        DEFAULT_EVENT_PAGE
    } else {
        limit.min(MAX_EVENT_PAGE)
    }
}
