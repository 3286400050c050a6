//! PostgreSQL-backed job store.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrently polling workers
//! never double-claim, idempotency is enforced by a partial unique index
//! over active statuses, and named locks ride an `ON CONFLICT` upsert that
//! only steals expired rows.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{effective_event_limit, JobFilter, JobStore, StoreError, StoreResult};
use crate::events::{JobEvent, JobEventKind};
use crate::job::{Job, JobError, JobStatus, JobType};

const JOB_COLUMNS: &str = "id, org_id, entity_id, fiscal_year, job_type, priority, idempotency_key, status, \
     params, progress_percent, stage, stage_detail, counters, heartbeat_at, \
     result, warnings, error_kind, error_message, error_hint, error_stage, error_detail, \
     retry_of, retry_count, max_retries, parent_id, worker_id, created_by, cancel_requested_by, \
     created_at, started_at, finished_at, updated_at";

const EVENT_COLUMNS: &str = "id, job_id, seq, kind, stage, message, percent, data, created_at";

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> StoreResult<Job> {
        let sql = format!(
            r#"
            INSERT INTO jobs (
                id, org_id, entity_id, fiscal_year, job_type, priority, idempotency_key, status,
                params, progress_percent, stage, stage_detail, counters, heartbeat_at,
                result, warnings, error_kind, error_message, error_hint, error_stage, error_detail,
                retry_of, retry_count, max_retries, parent_id, worker_id, created_by, cancel_requested_by,
                created_at, started_at, finished_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8,
                $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21,
                $22, $23, $24, $25, $26, $27, $28,
                $29, $30, $31, $32
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let inserted = sqlx::query_as::<_, Job>(&sql)
            .bind(job.id)
            .bind(job.org_id)
            .bind(job.entity_id)
            .bind(job.fiscal_year)
            .bind(job.job_type)
            .bind(job.priority)
            .bind(&job.idempotency_key)
            .bind(job.status)
            .bind(&job.params)
            .bind(job.progress_percent)
            .bind(&job.stage)
            .bind(&job.stage_detail)
            .bind(&job.counters)
            .bind(job.heartbeat_at)
            .bind(&job.result)
            .bind(&job.warnings)
            .bind(job.error_kind)
            .bind(&job.error_message)
            .bind(&job.error_hint)
            .bind(&job.error_stage)
            .bind(&job.error_detail)
            .bind(job.retry_of)
            .bind(job.retry_count)
            .bind(job.max_retries)
            .bind(job.parent_id)
            .bind(&job.worker_id)
            .bind(&job.created_by)
            .bind(&job.cancel_requested_by)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.finished_at)
            .bind(job.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    StoreError::DuplicateIdempotencyKey(job.idempotency_key.clone())
                }
                _ => StoreError::Database(e),
            })?;

        Ok(inserted)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn find_active_by_key(&self, org_id: Uuid, key: &str) -> StoreResult<Option<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE org_id = $1
              AND idempotency_key = $2
              AND status IN ('queued', 'running', 'cancellation_requested')
            LIMIT 1
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(org_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn list(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let statuses: Option<Vec<String>> = filter
            .statuses
            .as_ref()
            .map(|s| s.iter().map(|st| st.as_str().to_string()).collect());

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::uuid IS NULL OR org_id = $1)
              AND ($2::uuid IS NULL OR entity_id = $2)
              AND ($3::int IS NULL OR fiscal_year = $3)
              AND ($4::text[] IS NULL OR status::text = ANY($4))
              AND ($5::job_type IS NULL OR job_type = $5)
              AND ($6::text IS NULL OR created_by = $6)
            ORDER BY created_at DESC
            LIMIT $7 OFFSET $8
            "#
        );

        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(filter.org_id)
            .bind(filter.entity_id)
            .bind(filter.fiscal_year)
            .bind(statuses)
            .bind(filter.job_type)
            .bind(&filter.created_by)
            .bind(filter.effective_limit())
            .bind(filter.offset.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        allowed_types: Option<&[JobType]>,
    ) -> StoreResult<Option<Job>> {
        let types: Option<Vec<String>> =
            allowed_types.map(|t| t.iter().map(|ty| ty.as_str().to_string()).collect());

        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'queued'
                  AND ($2::text[] IS NULL OR job_type::text = ANY($2))
                ORDER BY priority, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                worker_id = $1,
                started_at = NOW(),
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(worker_id)
            .bind(types)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn write_progress(
        &self,
        id: Uuid,
        percent: Option<i16>,
        stage: Option<&str>,
        detail: Option<&str>,
        counters: Option<&serde_json::Value>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET progress_percent = GREATEST(progress_percent, COALESCE($2, progress_percent)),
                stage = COALESCE($3, stage),
                stage_detail = COALESCE($4, stage_detail),
                counters = counters || COALESCE($5, '{}'::jsonb),
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('running', 'cancellation_requested')
            "#,
        )
        .bind(id)
        .bind(percent)
        .bind(stage)
        .bind(detail)
        .bind(counters.cloned())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_heartbeat(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('running', 'cancellation_requested')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete(
        &self,
        id: Uuid,
        result: serde_json::Value,
        warnings: &[String],
    ) -> StoreResult<bool> {
        let warnings = serde_json::to_value(warnings)?;
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                result = $2,
                warnings = $3,
                progress_percent = 100,
                finished_at = NOW(),
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(result)
        .bind(warnings)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn fail(&self, id: Uuid, error: &JobError) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error_kind = $2,
                error_message = $3,
                error_hint = $4,
                error_stage = $5,
                error_detail = $6,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running', 'cancellation_requested')
            "#,
        )
        .bind(id)
        .bind(error.kind)
        .bind(&error.message)
        .bind(&error.hint)
        .bind(&error.stage)
        .bind(&error.detail)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_if_stale(
        &self,
        id: Uuid,
        cutoff: DateTime<Utc>,
        error: &JobError,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error_kind = $3,
                error_message = $4,
                error_hint = $5,
                error_stage = $6,
                error_detail = $7,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND (heartbeat_at IS NULL OR heartbeat_at < $2)
            "#,
        )
        .bind(id)
        .bind(cutoff)
        .bind(error.kind)
        .bind(&error.message)
        .bind(&error.hint)
        .bind(&error.stage)
        .bind(&error.detail)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_stale_running(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'running'
              AND (heartbeat_at IS NULL OR heartbeat_at < $1)
            ORDER BY heartbeat_at ASC NULLS FIRST
            "#
        );
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn cancel_queued(&self, id: Uuid, requested_by: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                cancel_requested_by = $2,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(requested_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn request_cancel(&self, id: Uuid, requested_by: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancellation_requested',
                cancel_requested_by = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(requested_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finalize_cancelled(&self, id: Uuid, error: Option<&JobError>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                error_kind = $2,
                error_message = $3,
                error_hint = $4,
                error_stage = $5,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('running', 'cancellation_requested')
            "#,
        )
        .bind(id)
        .bind(error.map(|e| e.kind))
        .bind(error.map(|e| e.message.clone()))
        .bind(error.and_then(|e| e.hint.clone()))
        .bind(error.and_then(|e| e.stage.clone()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_cancel_requested(&self, id: Uuid) -> StoreResult<bool> {
        let status = sqlx::query_scalar::<_, JobStatus>("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(matches!(status, Some(JobStatus::CancellationRequested)))
    }

    async fn append_event(&self, event: JobEvent) -> StoreResult<JobEvent> {
        let sql = format!(
            r#"
            INSERT INTO job_events (id, job_id, kind, stage, message, percent, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let stored = sqlx::query_as::<_, JobEvent>(&sql)
            .bind(event.id)
            .bind(event.job_id)
            .bind(event.kind)
            .bind(&event.stage)
            .bind(&event.message)
            .bind(event.percent)
            .bind(&event.data)
            .bind(event.created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(stored)
    }

    async fn list_events(
        &self,
        job_id: Uuid,
        kinds: Option<&[JobEventKind]>,
        limit: i64,
    ) -> StoreResult<Vec<JobEvent>> {
        let kinds: Option<Vec<String>> =
            kinds.map(|ks| ks.iter().map(|k| k.as_str().to_string()).collect());

        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM job_events
            WHERE job_id = $1
              AND ($2::text[] IS NULL OR kind::text = ANY($2))
            ORDER BY seq ASC
            LIMIT $3
            "#
        );
        let events = sqlx::query_as::<_, JobEvent>(&sql)
            .bind(job_id)
            .bind(kinds)
            .bind(effective_event_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(events)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        job_id: Uuid,
        ttl: Duration,
        reason: Option<&str>,
    ) -> StoreResult<bool> {
        let ttl_ms = ttl.as_millis() as i64;
        let result = sqlx::query(
            r#"
            INSERT INTO job_locks (key, job_id, reason, acquired_at, expires_at)
            VALUES ($1, $2, $3, NOW(), NOW() + ($4 || ' milliseconds')::INTERVAL)
            ON CONFLICT (key) DO UPDATE SET
                job_id = EXCLUDED.job_id,
                reason = EXCLUDED.reason,
                acquired_at = NOW(),
                expires_at = NOW() + ($4 || ' milliseconds')::INTERVAL
            WHERE job_locks.expires_at < NOW()
            "#,
        )
        .bind(key)
        .bind(job_id)
        .bind(reason)
        .bind(ttl_ms.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, key: &str, job_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM job_locks WHERE key = $1 AND job_id = $2")
            .bind(key)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
