//! Client-facing projection of a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::JobError;
use crate::id::JobId;
use crate::job::{Job, JobProgress, JobStatus};

/// Controls which optional fields a [`JobView`] exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewOptions {
    /// Include the submitted payload. Off by default so list views never
    /// echo large or sensitive inputs back.
    pub include_input: bool,
}

impl ViewOptions {
    pub fn with_input() -> Self {
        Self {
            include_input: true,
        }
    }
}

/// Sanitized job record: no owner, lease holder or lease deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub idempotency_key: Option<String>,
    pub result: Option<JsonValue>,
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl JobView {
    pub fn from_job(job: Job, options: ViewOptions) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            progress: job.progress,
            idempotency_key: job.idempotency_key,
            result: job.result,
            error: job.error,
            input: options.include_input.then_some(job.input),
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            failed_at: job.failed_at,
        }
    }
}
