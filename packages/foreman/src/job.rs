//! Job model for background task orchestration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Default retry ceiling applied when a caller does not override it.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Parameter fields excluded from idempotency hashing.
///
/// Two requests that differ only in these fields are logically the same
/// job and must collapse to one idempotency key.
const VOLATILE_PARAM_FIELDS: &[&str] = &["force", "request_id", "requested_at"];

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    /// Cancellation has been durably recorded; the runner will honor it at
    /// its next cooperative checkpoint.
    CancellationRequested,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Active statuses participate in idempotency-key uniqueness.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::CancellationRequested => "cancellation_requested",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Convert to integer for ordering (lower = sooner).
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

/// The closed set of job types this system executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ParseDocuments,
    EvaluateDocuments,
    GenerateReport,
    GenerateArchive,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ParseDocuments => "parse_documents",
            JobType::EvaluateDocuments => "evaluate_documents",
            JobType::GenerateReport => "generate_report",
            JobType::GenerateArchive => "generate_archive",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parse_documents" => Ok(JobType::ParseDocuments),
            "evaluate_documents" => Ok(JobType::EvaluateDocuments),
            "generate_report" => Ok(JobType::GenerateReport),
            "generate_archive" => Ok(JobType::GenerateArchive),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Classification of a job failure.
///
/// Persisted on the job row so callers see a terse, actionable reason.
/// Full diagnostic detail only ever goes to the operational log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    /// No handler registered for the job type. A deployment defect; retrying
    /// the same deployment cannot help.
    NoHandler,
    AiQuotaExceeded,
    RateLimit,
    Timeout,
    PermissionDenied,
    NotFound,
    ConnectionError,
    /// Heartbeat went stale; the claiming worker is presumed dead.
    WorkerLost,
    /// Orderly worker shutdown interrupted the job.
    WorkerShutdown,
    /// Fault in claim/dispatch plumbing, outside the handler body.
    WorkerException,
    Internal,
}

impl ErrorKind {
    /// User-facing hint surfaced by the API layer next to a failed job.
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "the job input was invalid; fix it and submit again",
            ErrorKind::NoHandler => "no handler is deployed for this job type; contact support",
            ErrorKind::AiQuotaExceeded => "the AI usage quota is exhausted; wait for it to reset",
            ErrorKind::RateLimit => "rate-limited by an upstream service; wait and retry",
            ErrorKind::Timeout => "the operation took too long; retry later",
            ErrorKind::PermissionDenied => "missing permission for a required resource",
            ErrorKind::NotFound => "a referenced resource no longer exists",
            ErrorKind::ConnectionError => "a network error occurred; retry later",
            ErrorKind::WorkerLost => "the executing worker stopped responding; retry the job",
            ErrorKind::WorkerShutdown => "execution was interrupted by maintenance; retry the job",
            ErrorKind::WorkerException => "an internal dispatch error occurred; contact support",
            ErrorKind::Internal => "an unexpected error occurred; retry or contact support",
        }
    }

    /// Whether submitting the same job again can plausibly succeed.
    pub fn retry_may_help(&self) -> bool {
        !matches!(self, ErrorKind::NoHandler)
    }
}

// ============================================================================
// Structured error
// ============================================================================

/// The persisted failure record: kind + terse message + hint + failing stage.
///
/// `detail` is an opaque JSON blob for machine consumers. Stack traces never
/// go here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: Option<String>,
    pub stage: Option<String>,
    pub detail: Option<serde_json::Value>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: Some(kind.hint().to_string()),
            stage: None,
            detail: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

// ============================================================================
// Typed parameters
// ============================================================================

/// Job parameters as a tagged union, one validated variant per job type.
///
/// Handlers receive the variant matching their registration, so parameter
/// interpretation is exhaustive instead of duck-typed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobParams {
    ParseDocuments {
        document_ids: Vec<Uuid>,
        #[serde(default)]
        force: bool,
    },
    EvaluateDocuments {
        submission_id: Uuid,
        rubric: String,
        #[serde(default)]
        force: bool,
    },
    GenerateReport {
        template: String,
        #[serde(default)]
        sections: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
    },
    GenerateArchive {
        include_attachments: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
    },
}

impl JobParams {
    pub fn job_type(&self) -> JobType {
        match self {
            JobParams::ParseDocuments { .. } => JobType::ParseDocuments,
            JobParams::EvaluateDocuments { .. } => JobType::EvaluateDocuments,
            JobParams::GenerateReport { .. } => JobType::GenerateReport,
            JobParams::GenerateArchive { .. } => JobType::GenerateArchive,
        }
    }

    /// Stable content hash of the parameters with volatile fields removed.
    ///
    /// serde_json object keys are sorted, so serialization order is stable
    /// across logically identical values.
    pub fn fingerprint(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(map) = &mut value {
            for field in VOLATILE_PARAM_FIELDS {
                map.remove(*field);
            }
        }
        let canonical = value.to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Deterministic idempotency key for a job request.
///
/// Shape: `{type}:{org}:{entity|-}:{fiscal_year|-}:{fingerprint[..16]}`.
pub fn idempotency_key(
    params: &JobParams,
    org_id: Uuid,
    entity_id: Option<Uuid>,
    fiscal_year: Option<i32>,
) -> String {
    let fingerprint = params.fingerprint();
    format!(
        "{}:{}:{}:{}:{}",
        params.job_type(),
        org_id,
        entity_id.map(|e| e.to_string()).unwrap_or_else(|| "-".into()),
        fiscal_year.map(|y| y.to_string()).unwrap_or_else(|| "-".into()),
        &fingerprint[..16],
    )
}

// ============================================================================
// Job model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,

    // Scope
    pub org_id: Uuid,
    pub entity_id: Option<Uuid>,
    pub fiscal_year: Option<i32>,

    // Identity
    pub job_type: JobType,
    pub priority: JobPriority,
    pub idempotency_key: String,
    pub status: JobStatus,

    // Payload (the serialized JobParams variant)
    pub params: serde_json::Value,

    // Progress
    pub progress_percent: i16,
    pub stage: Option<String>,
    pub stage_detail: Option<String>,
    pub counters: serde_json::Value,
    pub heartbeat_at: Option<DateTime<Utc>>,

    // Terminal outcome
    pub result: Option<serde_json::Value>,
    pub warnings: Option<serde_json::Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub error_hint: Option<String>,
    pub error_stage: Option<String>,
    pub error_detail: Option<serde_json::Value>,

    // Retry lineage
    pub retry_of: Option<Uuid>,
    pub retry_count: i32,
    pub max_retries: i32,

    // Parent/child lineage
    pub parent_id: Option<Uuid>,

    // Execution
    pub worker_id: Option<String>,
    pub created_by: Option<String>,
    pub cancel_requested_by: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `queued` row for insertion.
    #[allow(clippy::too_many_arguments)]
    pub fn queued(
        org_id: Uuid,
        entity_id: Option<Uuid>,
        fiscal_year: Option<i32>,
        params: &JobParams,
        priority: JobPriority,
        idempotency_key: String,
        parent_id: Option<Uuid>,
        created_by: Option<String>,
        max_retries: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            org_id,
            entity_id,
            fiscal_year,
            job_type: params.job_type(),
            priority,
            idempotency_key,
            status: JobStatus::Queued,
            params: serde_json::to_value(params).unwrap_or(serde_json::Value::Null),
            progress_percent: 0,
            stage: None,
            stage_detail: None,
            counters: serde_json::json!({}),
            heartbeat_at: None,
            result: None,
            warnings: None,
            error_kind: None,
            error_message: None,
            error_hint: None,
            error_stage: None,
            error_detail: None,
            retry_of: None,
            retry_count: 0,
            max_retries,
            parent_id,
            worker_id: None,
            created_by,
            cancel_requested_by: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Build the replacement row for a retry of this job.
    ///
    /// The derived idempotency key cannot collide with the original's, so the
    /// retry is insertable even while the original row is still visible.
    pub fn retry(&self, created_by: Option<String>) -> Result<Self, serde_json::Error> {
        let next = self.retry_count + 1;
        // Params are carried verbatim; a retry re-runs the same request.
        let params: JobParams = serde_json::from_value(self.params.clone())?;
        let mut job = Self::queued(
            self.org_id,
            self.entity_id,
            self.fiscal_year,
            &params,
            self.priority,
            retry_key(&self.idempotency_key, self.retry_count, next),
            self.parent_id,
            created_by,
            self.max_retries,
        );
        job.retry_of = Some(self.id);
        job.retry_count = next;
        Ok(job)
    }

    /// Decode the stored params back into the tagged union.
    pub fn typed_params(&self) -> Result<JobParams, serde_json::Error> {
        serde_json::from_value(self.params.clone())
    }

    /// Reconstruct the structured error from the flattened columns.
    pub fn error(&self) -> Option<JobError> {
        self.error_kind.map(|kind| JobError {
            kind,
            message: self.error_message.clone().unwrap_or_default(),
            hint: self.error_hint.clone(),
            stage: self.error_stage.clone(),
            detail: self.error_detail.clone(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Derive the idempotency key for retry number `next` from the current key.
///
/// Strips the previous `:rN` suffix (if any) so retry chains stay flat:
/// `key`, `key:r1`, `key:r2`, ...
fn retry_key(current: &str, current_retry: i32, next: i32) -> String {
    let base = if current_retry > 0 {
        current
            .strip_suffix(&format!(":r{current_retry}"))
            .unwrap_or(current)
    } else {
        current
    };
    format!("{base}:r{next}")
}
