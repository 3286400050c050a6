//! In-memory job store.
//!
//! Enforces the same contract as the Postgres store (active-key uniqueness,
//! atomic claim, monotonic progress, per-job event sequence, expirable
//! locks) behind a single lock, so managers, runners and workers can be
//! exercised in tests and embedders without a database.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{effective_event_limit, JobFilter, JobStore, StoreError, StoreResult};
use crate::events::{JobEvent, JobEventKind};
use crate::job::{Job, JobError, JobStatus, JobType};

#[derive(Debug, Clone)]
struct LockRow {
    job_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    events: Vec<JobEvent>,
    locks: HashMap<String, LockRow>,
    next_seq: i64,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Test affordance: rewind a job's heartbeat so the stuck-job sweep can
    /// be exercised without waiting out a real staleness window.
    pub fn backdate_heartbeat(&self, id: Uuid, heartbeat_at: DateTime<Utc>) {
        if let Some(job) = self.write().jobs.get_mut(&id) {
            job.heartbeat_at = Some(heartbeat_at);
        }
    }

    fn with_active_job(
        &self,
        id: Uuid,
        statuses: &[JobStatus],
        apply: impl FnOnce(&mut Job),
    ) -> bool {
        let mut inner = self.write();
        match inner.jobs.get_mut(&id) {
            Some(job) if statuses.contains(&job.status) => {
                apply(job);
                job.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

fn merge_counters(existing: &mut serde_json::Value, incoming: &serde_json::Value) {
    if let (serde_json::Value::Object(target), serde_json::Value::Object(source)) =
        (existing, incoming)
    {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn apply_error(job: &mut Job, error: &JobError) {
    job.error_kind = Some(error.kind);
    job.error_message = Some(error.message.clone());
    job.error_hint = error.hint.clone();
    job.error_stage = error.stage.clone();
    job.error_detail = error.detail.clone();
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> StoreResult<Job> {
        let mut inner = self.write();
        let duplicate = inner.jobs.values().any(|existing| {
            existing.org_id == job.org_id
                && existing.idempotency_key == job.idempotency_key
                && existing.status.is_active()
        });
        if duplicate {
            return Err(StoreError::DuplicateIdempotencyKey(job.idempotency_key));
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.read().jobs.get(&id).cloned())
    }

    async fn find_active_by_key(&self, org_id: Uuid, key: &str) -> StoreResult<Option<Job>> {
        Ok(self
            .read()
            .jobs
            .values()
            .find(|j| j.org_id == org_id && j.idempotency_key == key && j.status.is_active())
            .cloned())
    }

    async fn list(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let inner = self.read();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| filter.org_id.is_none_or(|org| j.org_id == org))
            .filter(|j| filter.entity_id.is_none_or(|e| j.entity_id == Some(e)))
            .filter(|j| filter.fiscal_year.is_none_or(|y| j.fiscal_year == Some(y)))
            .filter(|j| {
                filter
                    .statuses
                    .as_ref()
                    .is_none_or(|s| s.contains(&j.status))
            })
            .filter(|j| filter.job_type.is_none_or(|t| j.job_type == t))
            .filter(|j| {
                filter
                    .created_by
                    .as_ref()
                    .is_none_or(|c| j.created_by.as_ref() == Some(c))
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let offset = filter.offset.max(0) as usize;
        let limit = filter.effective_limit() as usize;
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        allowed_types: Option<&[JobType]>,
    ) -> StoreResult<Option<Job>> {
        let mut inner = self.write();
        let candidate = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .filter(|j| allowed_types.is_none_or(|types| types.contains(&j.job_type)))
            .min_by_key(|j| (j.priority.as_i16(), j.created_at, j.id))
            .map(|j| j.id);

        let now = Utc::now();
        match candidate.and_then(|id| inner.jobs.get_mut(&id)) {
            Some(job) => {
                job.status = JobStatus::Running;
                job.worker_id = Some(worker_id.to_string());
                job.started_at = Some(now);
                job.heartbeat_at = Some(now);
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn write_progress(
        &self,
        id: Uuid,
        percent: Option<i16>,
        stage: Option<&str>,
        detail: Option<&str>,
        counters: Option<&serde_json::Value>,
    ) -> StoreResult<bool> {
        Ok(self.with_active_job(
            id,
            &[JobStatus::Running, JobStatus::CancellationRequested],
            |job| {
                if let Some(percent) = percent {
                    job.progress_percent = job.progress_percent.max(percent);
                }
                if let Some(stage) = stage {
                    job.stage = Some(stage.to_string());
                }
                if let Some(detail) = detail {
                    job.stage_detail = Some(detail.to_string());
                }
                if let Some(counters) = counters {
                    merge_counters(&mut job.counters, counters);
                }
                job.heartbeat_at = Some(Utc::now());
            },
        ))
    }

    async fn touch_heartbeat(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.with_active_job(
            id,
            &[JobStatus::Running, JobStatus::CancellationRequested],
            |job| {
                job.heartbeat_at = Some(Utc::now());
            },
        ))
    }

    async fn complete(
        &self,
        id: Uuid,
        result: serde_json::Value,
        warnings: &[String],
    ) -> StoreResult<bool> {
        let warnings = serde_json::to_value(warnings)?;
        Ok(self.with_active_job(id, &[JobStatus::Running], |job| {
            job.status = JobStatus::Completed;
            job.result = Some(result);
            job.warnings = Some(warnings);
            job.progress_percent = 100;
            let now = Utc::now();
            job.finished_at = Some(now);
            job.heartbeat_at = Some(now);
        }))
    }

    async fn fail(&self, id: Uuid, error: &JobError) -> StoreResult<bool> {
        Ok(self.with_active_job(
            id,
            &[
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::CancellationRequested,
            ],
            |job| {
                job.status = JobStatus::Failed;
                apply_error(job, error);
                job.finished_at = Some(Utc::now());
            },
        ))
    }

    async fn fail_if_stale(
        &self,
        id: Uuid,
        cutoff: DateTime<Utc>,
        error: &JobError,
    ) -> StoreResult<bool> {
        let mut inner = self.write();
        match inner.jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Running
                    && job.heartbeat_at.is_none_or(|hb| hb < cutoff) =>
            {
                job.status = JobStatus::Failed;
                apply_error(job, error);
                let now = Utc::now();
                job.finished_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale_running(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        Ok(self
            .read()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .filter(|j| j.heartbeat_at.is_none_or(|hb| hb < cutoff))
            .cloned()
            .collect())
    }

    async fn cancel_queued(&self, id: Uuid, requested_by: &str) -> StoreResult<bool> {
        Ok(self.with_active_job(id, &[JobStatus::Queued], |job| {
            job.status = JobStatus::Cancelled;
            job.cancel_requested_by = Some(requested_by.to_string());
            job.finished_at = Some(Utc::now());
        }))
    }

    async fn request_cancel(&self, id: Uuid, requested_by: &str) -> StoreResult<bool> {
        Ok(self.with_active_job(id, &[JobStatus::Running], |job| {
            job.status = JobStatus::CancellationRequested;
            job.cancel_requested_by = Some(requested_by.to_string());
        }))
    }

    async fn finalize_cancelled(&self, id: Uuid, error: Option<&JobError>) -> StoreResult<bool> {
        Ok(self.with_active_job(
            id,
            &[JobStatus::Running, JobStatus::CancellationRequested],
            |job| {
                job.status = JobStatus::Cancelled;
                if let Some(error) = error {
                    apply_error(job, error);
                }
                job.finished_at = Some(Utc::now());
            },
        ))
    }

    async fn is_cancel_requested(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self
            .read()
            .jobs
            .get(&id)
            .is_some_and(|j| j.status == JobStatus::CancellationRequested))
    }

    async fn append_event(&self, mut event: JobEvent) -> StoreResult<JobEvent> {
        let mut inner = self.write();
        inner.next_seq += 1;
        event.seq = inner.next_seq;
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn list_events(
        &self,
        job_id: Uuid,
        kinds: Option<&[JobEventKind]>,
        limit: i64,
    ) -> StoreResult<Vec<JobEvent>> {
        let inner = self.read();
        let mut events: Vec<JobEvent> = inner
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .filter(|e| kinds.is_none_or(|ks| ks.contains(&e.kind)))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.seq);
        events.truncate(effective_event_limit(limit) as usize);
        Ok(events)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        job_id: Uuid,
        ttl: Duration,
        reason: Option<&str>,
    ) -> StoreResult<bool> {
        let _ = reason;
        let mut inner = self.write();
        let now = Utc::now();
        let held = inner
            .locks
            .get(key)
            .is_some_and(|lock| lock.expires_at > now);
        if held {
            return Ok(false);
        }
        inner.locks.insert(
            key.to_string(),
            LockRow {
                job_id,
                expires_at: now + chrono::Duration::milliseconds(ttl.as_millis() as i64),
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, job_id: Uuid) -> StoreResult<bool> {
        let mut inner = self.write();
        match inner.locks.get(key) {
            Some(lock) if lock.job_id == job_id => {
                inner.locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
