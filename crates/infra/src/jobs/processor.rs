//! Processor registry and the handles passed to running processors.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;

use jobline_core::{Job, JobId, JobProgress};

use super::store::{JobStore, JobStoreError, ProgressUpdate};

/// Executes one job type.
///
/// Return an error to fail the job. A [`jobline_core::JobError`] inside the
/// `anyhow::Error` is recorded as-is; anything else becomes
/// `JobExecutionFailed` with the error's message.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(
        &self,
        input: JsonValue,
        progress: ProgressReporter,
        job: JobMetadata,
    ) -> anyhow::Result<JsonValue>;
}

#[async_trait]
impl<F, Fut> JobProcessor for F
where
    F: Fn(JsonValue, ProgressReporter, JobMetadata) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
{
    async fn process(
        &self,
        input: JsonValue,
        progress: ProgressReporter,
        job: JobMetadata,
    ) -> anyhow::Result<JsonValue> {
        (self)(input, progress, job).await
    }
}

/// Read-only facts about the job being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMetadata {
    pub id: JobId,
    pub job_type: String,
    pub owner_id: String,
    pub idempotency_key: Option<String>,
    /// 1 on the first run, incremented on every retry
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&Job> for JobMetadata {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type.clone(),
            owner_id: job.owner_id.clone(),
            idempotency_key: job.idempotency_key.clone(),
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
        }
    }
}

/// Lets a processor report progress, which also renews its lease.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    worker_id: String,
    lease: Duration,
}

impl ProgressReporter {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        job_id: JobId,
        worker_id: impl Into<String>,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            job_id,
            worker_id: worker_id.into(),
            lease,
        }
    }

    /// Record progress. `percent` is clamped to 0..=100.
    ///
    /// Returns `false` when this worker no longer holds the job, e.g. after
    /// its lease expired and another worker picked it up. The processor may
    /// keep going; its final result will be discarded.
    pub async fn report(&self, percent: i64, message: impl Into<String>) -> Result<bool, JobStoreError> {
        let updated = self
            .store
            .update_job_progress(ProgressUpdate {
                job_id: self.job_id,
                progress: JobProgress::new(percent, message),
                worker_id: Some(self.worker_id.clone()),
                lease: self.lease,
            })
            .await?;

        if updated.is_none() {
            debug!(job_id = %self.job_id, worker_id = %self.worker_id, "progress dropped; lease no longer held");
        }
        Ok(updated.is_some())
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .field("worker_id", &self.worker_id)
            .field("lease", &self.lease)
            .finish()
    }
}

/// Job type was empty or whitespace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("processor job type must be a non-empty string")]
pub struct InvalidProcessorType;

/// Job type to processor mapping. Later registrations replace earlier ones.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn JobProcessor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        job_type: impl Into<String>,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<(), InvalidProcessorType> {
        let job_type = job_type.into();
        let job_type = job_type.trim();
        if job_type.is_empty() {
            return Err(InvalidProcessorType);
        }

        let mut processors = self
            .processors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        processors.insert(job_type.to_string(), processor);
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(job_type)
            .cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.get(job_type).is_some()
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .processors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
