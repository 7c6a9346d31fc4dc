//! Job record, lifecycle states and the transitions between them.
//!
//! Every transition here is pure: callers pass the clock in, so the memory
//! backend and tests share exactly the same state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::JobError;
use crate::id::JobId;

/// Progress floor applied when a job is claimed.
pub const MIN_RUNNING_PERCENT: u8 = 5;

/// Default attempt ceiling when neither the caller nor configuration sets one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,
    /// Leased by a worker
    Running,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Case-insensitive parse of the stored representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("queued") => Some(JobStatus::Queued),
            s if s.eq_ignore_ascii_case("running") => Some(JobStatus::Running),
            s if s.eq_ignore_ascii_case("completed") => Some(JobStatus::Completed),
            s if s.eq_ignore_ascii_case("failed") => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last progress report for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: u8,
    pub message: String,
}

impl JobProgress {
    /// Build a progress value, clamping `percent` into 0..=100.
    pub fn new(percent: i64, message: impl Into<String>) -> Self {
        Self {
            percent: percent.clamp(0, 100) as u8,
            message: message.into(),
        }
    }

    pub fn queued() -> Self {
        Self::new(0, "Queued")
    }

    /// Progress after a lease expired and the job went back to the queue.
    pub fn retrying() -> Self {
        Self::new(0, "Queued for retry")
    }

    pub fn completed() -> Self {
        Self::new(100, "Completed")
    }

    pub fn failed() -> Self {
        Self::new(100, "Failed")
    }
}

/// The `(owner, type, key)` triple that makes a submission idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyScope {
    pub owner_id: String,
    pub job_type: String,
    pub key: String,
}

impl IdempotencyScope {
    pub fn new(
        owner_id: impl Into<String>,
        job_type: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            job_type: job_type.into(),
            key: key.into(),
        }
    }
}

/// Request to create a job row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Generated when absent.
    pub id: Option<JobId>,
    pub job_type: String,
    pub owner_id: String,
    pub idempotency_key: Option<String>,
    pub input: JsonValue,
    /// Falls back to the store's configured default.
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, owner_id: impl Into<String>, input: JsonValue) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            owner_id: owner_id.into(),
            idempotency_key: None,
            input,
            max_attempts: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn idempotency_scope(&self) -> Option<IdempotencyScope> {
        self.idempotency_key
            .as_ref()
            .map(|key| IdempotencyScope::new(&self.owner_id, &self.job_type, key))
    }
}

/// Outcome of an expired lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseExpiry {
    /// Attempts remain; the job is claimable again.
    Requeued,
    /// Attempt budget exhausted; the job failed with `JobTimeout`.
    TimedOut,
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub owner_id: String,
    pub idempotency_key: Option<String>,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub input: JsonValue,
    pub result: Option<JsonValue>,
    pub error: Option<JobError>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Lease holder; set only while running
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Materialize a queued job from a creation request.
    pub fn from_new(new: NewJob, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id.unwrap_or_default(),
            job_type: new.job_type,
            owner_id: new.owner_id,
            idempotency_key: new.idempotency_key,
            status: JobStatus::Queued,
            progress: JobProgress::queued(),
            input: new.input,
            result: None,
            error: None,
            attempt_count: 0,
            max_attempts: new.max_attempts.unwrap_or(default_max_attempts).max(1),
            worker_id: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    pub fn idempotency_scope(&self) -> Option<IdempotencyScope> {
        self.idempotency_key
            .as_ref()
            .map(|key| IdempotencyScope::new(&self.owner_id, &self.job_type, key))
    }

    /// `true` when no worker is given, or the given worker holds the lease.
    pub fn is_held_by(&self, worker_id: Option<&str>) -> bool {
        match worker_id {
            None => true,
            Some(w) => self.worker_id.as_deref() == Some(w),
        }
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_some_and(|at| at < now)
    }

    /// Lease the job to `worker_id` for `lease`.
    pub fn claim(&mut self, worker_id: &str, lease: Duration, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.worker_id = Some(worker_id.to_string());
        self.lease_expires_at = Some(lease_deadline(now, lease));
        self.attempt_count += 1;
        self.progress = JobProgress {
            percent: self.progress.percent.max(MIN_RUNNING_PERCENT),
            message: "Running".to_string(),
        };
        self.started_at.get_or_insert(now);
        self.updated_at = now;
    }

    /// Record progress and extend the lease.
    pub fn heartbeat(&mut self, progress: JobProgress, lease: Duration, now: DateTime<Utc>) {
        self.progress = progress;
        self.lease_expires_at = Some(lease_deadline(now, lease));
        self.updated_at = now;
    }

    pub fn complete(&mut self, result: JsonValue, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.progress = JobProgress::completed();
        self.result = Some(result);
        self.error = None;
        self.release_lease();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn fail(&mut self, error: JobError, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.progress = JobProgress::failed();
        self.result = None;
        self.error = Some(error);
        self.release_lease();
        self.failed_at = Some(now);
        self.updated_at = now;
    }

    /// Resolve an expired lease: requeue while attempts remain, otherwise time out.
    ///
    /// `attempt_count` is left untouched on requeue; it was already counted at claim.
    pub fn expire_lease(&mut self, timeout_message: &str, now: DateTime<Utc>) -> LeaseExpiry {
        if self.attempt_count < self.max_attempts {
            self.status = JobStatus::Queued;
            self.progress = JobProgress::retrying();
            self.release_lease();
            self.updated_at = now;
            LeaseExpiry::Requeued
        } else {
            self.fail(JobError::timeout(timeout_message), now);
            LeaseExpiry::TimedOut
        }
    }

    fn release_lease(&mut self) {
        self.worker_id = None;
        self.lease_expires_at = None;
    }
}

/// `now + lease`, saturating instead of overflowing.
pub fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
