//! Append-only job event log.
//!
//! Events are facts about the job lifecycle, written as side effects of
//! manager/runner actions and immutable once stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::job::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_event_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    StageChanged,
    Progress,
    Log,
    Warning,
    Error,
    Heartbeat,
    ChildCreated,
    RetryScheduled,
    CancelRequested,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::StageChanged => "stage_changed",
            JobEventKind::Progress => "progress",
            JobEventKind::Log => "log",
            JobEventKind::Warning => "warning",
            JobEventKind::Error => "error",
            JobEventKind::Heartbeat => "heartbeat",
            JobEventKind::ChildCreated => "child_created",
            JobEventKind::RetryScheduled => "retry_scheduled",
            JobEventKind::CancelRequested => "cancel_requested",
        }
    }
}

/// One entry in a job's audit trail.
///
/// `seq` is assigned by the store on append and is monotonic per job.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub job_id: Uuid,
    pub seq: i64,
    pub kind: JobEventKind,
    pub stage: Option<String>,
    pub message: Option<String>,
    pub percent: Option<i16>,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl JobEvent {
    fn base(job_id: Uuid, kind: JobEventKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            seq: 0,
            kind,
            stage: None,
            message: None,
            percent: None,
            data: None,
            created_at: Utc::now(),
        }
    }

    pub fn stage_changed(job_id: Uuid, stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            ..Self::base(job_id, JobEventKind::StageChanged)
        }
    }

    pub fn progress(
        job_id: Uuid,
        percent: i16,
        stage: Option<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            percent: Some(percent),
            stage,
            message: detail,
            ..Self::base(job_id, JobEventKind::Progress)
        }
    }

    pub fn log(job_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::base(job_id, JobEventKind::Log)
        }
    }

    pub fn warning(job_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::base(job_id, JobEventKind::Warning)
        }
    }

    pub fn error(job_id: Uuid, error: &JobError) -> Self {
        Self {
            message: Some(error.message.clone()),
            stage: error.stage.clone(),
            data: serde_json::to_value(error).ok(),
            ..Self::base(job_id, JobEventKind::Error)
        }
    }

    pub fn heartbeat(job_id: Uuid, note: Option<String>) -> Self {
        Self {
            message: note,
            ..Self::base(job_id, JobEventKind::Heartbeat)
        }
    }

    pub fn child_created(parent_id: Uuid, child_id: Uuid) -> Self {
        Self {
            data: Some(serde_json::json!({ "child_job_id": child_id })),
            ..Self::base(parent_id, JobEventKind::ChildCreated)
        }
    }

    pub fn retry_scheduled(job_id: Uuid, retry_job_id: Uuid) -> Self {
        Self {
            data: Some(serde_json::json!({ "retry_job_id": retry_job_id })),
            ..Self::base(job_id, JobEventKind::RetryScheduled)
        }
    }

    pub fn cancel_requested(job_id: Uuid, requested_by: &str) -> Self {
        Self {
            message: Some(format!("cancellation requested by {requested_by}")),
            ..Self::base(job_id, JobEventKind::CancelRequested)
        }
    }
}
