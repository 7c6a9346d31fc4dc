//! Job storage abstraction and its implementations.
//!
//! Every component above this module depends only on [`JobStore`]; which
//! backend is active is decided once by [`LazyJobStore`].
//!
//! Operations that target one job by id return `Ok(None)` when the job is
//! missing or a precondition (status, lease holder) does not hold. Callers
//! treat that as "lost the race" and move on.

pub mod in_memory;
pub mod postgres;
pub mod selector;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use jobline_core::{IdempotencyScope, Job, JobError, JobId, JobProgress, JobStatus, NewJob, codes};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use selector::{LazyJobStore, open_job_store};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    /// Another insert already holds the `(owner, type, key)` triple.
    #[error("idempotency conflict for owner '{}' type '{}' key '{}'", .0.owner_id, .0.job_type, .0.key)]
    IdempotencyConflict(IdempotencyScope),
    /// Durable storage was required but could not be initialized.
    #[error("job storage initialization failed: {0}")]
    InitFailed(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl JobStoreError {
    pub fn code(&self) -> &'static str {
        match self {
            JobStoreError::IdempotencyConflict(_) => codes::IDEMPOTENCY_CONFLICT,
            JobStoreError::InitFailed(_) => codes::JOB_STORAGE_INIT_FAILED,
            JobStoreError::Storage(_) | JobStoreError::Serialization(_) => codes::JOB_STORAGE_ERROR,
        }
    }
}

/// Listing filter; `None` fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub owner_id: Option<String>,
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.owner_id.as_deref().is_none_or(|o| job.owner_id == o)
            && self.job_type.as_deref().is_none_or(|t| job.job_type == t)
            && self.status.is_none_or(|s| job.status == s)
    }
}

/// Heartbeat from a running processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub progress: JobProgress,
    /// When set, the update is dropped unless this worker holds the lease.
    pub worker_id: Option<String>,
    /// New lease length measured from now.
    pub lease: Duration,
}

/// Result of a lease-expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepOutcome {
    pub requeued: u64,
    pub timed_out: u64,
}

/// Which backend is serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageInfo {
    pub mode: &'static str,
    pub durable: bool,
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    pub(crate) fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.running + self.completed + self.failed
    }
}

/// Job store abstraction.
///
/// `claim_next_queued_job` must be atomic: no two callers, even in different
/// processes sharing one durable backend, may receive the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job.
    ///
    /// Fails with [`JobStoreError::IdempotencyConflict`] when the idempotency
    /// triple is already taken; re-fetch with `find_job_by_idempotency`.
    async fn create_job(&self, new: NewJob) -> Result<Job, JobStoreError>;

    /// Most recently created job for an idempotency triple.
    async fn find_job_by_idempotency(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<Job>, JobStoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Matching jobs, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Lease the oldest queued job to `worker_id`.
    async fn claim_next_queued_job(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Record progress and extend the lease of a running job.
    async fn update_job_progress(&self, update: ProgressUpdate) -> Result<Option<Job>, JobStoreError>;

    async fn complete_job(
        &self,
        job_id: JobId,
        result: JsonValue,
        worker_id: Option<&str>,
    ) -> Result<Option<Job>, JobStoreError>;

    async fn fail_job(
        &self,
        job_id: JobId,
        error: JobError,
        worker_id: Option<&str>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Requeue or time out running jobs whose lease ended before `now`.
    async fn requeue_expired_jobs(
        &self,
        now: DateTime<Utc>,
        timeout_message: &str,
    ) -> Result<SweepOutcome, JobStoreError>;

    /// Delete terminal jobs last updated more than `retention` ago.
    async fn delete_stale_jobs(&self, retention: Duration) -> Result<u64, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    async fn storage_info(&self) -> Result<StorageInfo, JobStoreError>;
}

/// Oldest moment a terminal job may have been updated and still be retained.
pub(crate) fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
