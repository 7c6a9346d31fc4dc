//! Job failure model and stable error codes.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Stable error codes surfaced to callers and recorded on failed jobs.
pub mod codes {
    pub const AUTH_REQUIRED: &str = "AuthRequired";
    pub const INVALID_JOB_TYPE: &str = "InvalidJobType";
    pub const INVALID_JOB_PROCESSOR: &str = "InvalidJobProcessor";
    pub const INVALID_PROCESSOR_TYPE: &str = "InvalidProcessorType";
    pub const JOB_NOT_FOUND: &str = "JobNotFound";
    pub const JOB_FORBIDDEN: &str = "JobForbidden";
    pub const IDEMPOTENCY_CONFLICT: &str = "IdempotencyConflict";
    pub const JOB_EXECUTION_FAILED: &str = "JobExecutionFailed";
    pub const JOB_TIMEOUT: &str = "JobTimeout";
    pub const JOB_PROCESSOR_NOT_REGISTERED: &str = "JobProcessorNotRegistered";
    pub const JOB_STORAGE_INIT_FAILED: &str = "JobStorageInitFailed";
    pub const JOB_STORAGE_ERROR: &str = "JobStorageError";
}

/// Structured failure recorded on a job.
///
/// Processors may also return this as a typed application error; its code,
/// message and details are then recorded verbatim instead of being collapsed
/// into `JobExecutionFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(codes::JOB_EXECUTION_FAILED, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(codes::JOB_TIMEOUT, message)
    }

    pub fn processor_not_registered(job_type: &str) -> Self {
        Self::new(
            codes::JOB_PROCESSOR_NOT_REGISTERED,
            format!("no processor registered for job type '{job_type}'"),
        )
    }
}

/// A job id string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job id: {0}")]
pub struct InvalidJobId(pub String);
