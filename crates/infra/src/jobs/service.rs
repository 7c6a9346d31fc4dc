//! Job service: the entry point for everything outside the engine.
//!
//! Enforces ownership, owns the processor registry and shapes records into
//! [`JobView`]s for clients.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument};

use jobline_core::{Job, JobId, JobStatus, JobView, NewJob, ViewOptions, codes};

use crate::config::JobConfig;

use super::processor::{InvalidProcessorType, JobProcessor, ProcessorRegistry};
use super::pump::{JobPump, PumpHandle};
use super::store::{JobFilter, JobStats, JobStore, JobStoreError, LazyJobStore, StorageInfo};

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Job service error.
#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error("an owner id is required")]
    AuthRequired,
    #[error("job type must be a non-empty string")]
    InvalidJobType,
    #[error("no processor registered for job type '{0}'")]
    InvalidJobProcessor(String),
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job {0} belongs to another owner")]
    JobForbidden(JobId),
    #[error(transparent)]
    InvalidProcessorType(#[from] InvalidProcessorType),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl JobServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            JobServiceError::AuthRequired => codes::AUTH_REQUIRED,
            JobServiceError::InvalidJobType => codes::INVALID_JOB_TYPE,
            JobServiceError::InvalidJobProcessor(_) => codes::INVALID_JOB_PROCESSOR,
            JobServiceError::JobNotFound(_) => codes::JOB_NOT_FOUND,
            JobServiceError::JobForbidden(_) => codes::JOB_FORBIDDEN,
            JobServiceError::InvalidProcessorType(_) => codes::INVALID_PROCESSOR_TYPE,
            JobServiceError::Store(e) => e.code(),
        }
    }
}

/// A job submission.
#[derive(Clone)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub owner_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub input: JsonValue,
    /// Registered for `job_type` before the job is created.
    pub processor: Option<Arc<dyn JobProcessor>>,
}

impl EnqueueRequest {
    pub fn new(job_type: impl Into<String>, owner_id: impl Into<String>, input: JsonValue) -> Self {
        Self {
            job_type: job_type.into(),
            owner_id: Some(owner_id.into()),
            idempotency_key: None,
            input,
            processor: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn JobProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }
}

impl std::fmt::Debug for EnqueueRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnqueueRequest")
            .field("job_type", &self.job_type)
            .field("owner_id", &self.owner_id)
            .field("idempotency_key", &self.idempotency_key)
            .field("has_processor", &self.processor.is_some())
            .finish()
    }
}

/// Result of [`JobService::enqueue_job`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    pub job: Job,
    /// `true` when an earlier submission with the same idempotency key was returned.
    pub reused: bool,
}

/// Listing filter and pagination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListJobsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl PageMeta {
    fn new(page: Option<u32>, limit: Option<u32>, total: u64) -> Self {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let total_pages = total.div_ceil(u64::from(limit)).max(1);
        Self {
            page,
            limit,
            total,
            total_pages,
        }
    }

    fn offset(&self) -> usize {
        (self.page as usize - 1).saturating_mul(self.limit as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobView>,
    pub meta: PageMeta,
}

/// Job service.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    registry: Arc<ProcessorRegistry>,
    pump: JobPump,
}

impl JobService {
    /// Service over a lazily selected backend. Storage is opened on first use
    /// or by [`start`](Self::start).
    pub fn from_config(config: JobConfig) -> Self {
        let store: Arc<dyn JobStore> = Arc::new(LazyJobStore::new(config.storage));
        Self::new(store, config.pump)
    }

    pub fn from_env() -> Self {
        Self::from_config(JobConfig::from_env())
    }

    pub fn new(store: Arc<dyn JobStore>, pump_config: crate::config::PumpConfig) -> Self {
        let registry = Arc::new(ProcessorRegistry::new());
        let pump = JobPump::new(store.clone(), registry.clone(), pump_config);
        Self {
            store,
            registry,
            pump,
        }
    }

    /// Open storage and start the housekeeping interval.
    ///
    /// Fails with `JobStorageInitFailed` when durable storage was required
    /// but is unavailable.
    pub async fn start(&self) -> Result<PumpHandle, JobServiceError> {
        let info = self.store.storage_info().await?;
        info!(mode = info.mode, durable = info.durable, "job service starting");
        Ok(self.pump.start())
    }

    pub fn register_processor(
        &self,
        job_type: impl Into<String>,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<(), JobServiceError> {
        self.registry.register(job_type, processor)?;
        Ok(())
    }

    /// Submit a job, or return the earlier one with the same idempotency key.
    #[instrument(skip(self, request), fields(job_type = %request.job_type), err)]
    pub async fn enqueue_job(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, JobServiceError> {
        let owner_id = request
            .owner_id
            .filter(|o| !o.trim().is_empty())
            .ok_or(JobServiceError::AuthRequired)?;

        let job_type = request.job_type.trim().to_string();
        if job_type.is_empty() {
            return Err(JobServiceError::InvalidJobType);
        }

        if let Some(processor) = request.processor {
            self.registry.register(job_type.clone(), processor)?;
        }
        if !self.registry.contains(&job_type) {
            return Err(JobServiceError::InvalidJobProcessor(job_type));
        }

        let mut new = NewJob::new(job_type, owner_id, request.input);
        if let Some(key) = request
            .idempotency_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
        {
            new = new.with_idempotency_key(key);
        }

        let outcome = self.create_or_reuse(new).await;
        self.pump.trigger();
        outcome
    }

    async fn create_or_reuse(&self, new: NewJob) -> Result<EnqueueOutcome, JobServiceError> {
        if let Some(scope) = new.idempotency_scope() {
            if let Some(job) = self.store.find_job_by_idempotency(&scope).await? {
                debug!(job_id = %job.id, "reusing idempotent submission");
                return Ok(EnqueueOutcome { job, reused: true });
            }
        }

        match self.store.create_job(new).await {
            Ok(job) => {
                debug!(job_id = %job.id, "job enqueued");
                Ok(EnqueueOutcome { job, reused: false })
            }
            // Lost the insert race to a concurrent submission with the same key.
            Err(JobStoreError::IdempotencyConflict(scope)) => {
                match self.store.find_job_by_idempotency(&scope).await? {
                    Some(job) => Ok(EnqueueOutcome { job, reused: true }),
                    None => Err(JobStoreError::IdempotencyConflict(scope).into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch one job, provided `owner_id` owns it.
    pub async fn get_job_for_owner(
        &self,
        job_id: JobId,
        owner_id: Option<&str>,
        options: ViewOptions,
    ) -> Result<JobView, JobServiceError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(JobServiceError::JobNotFound(job_id))?;

        match owner_id {
            Some(owner) if owner == job.owner_id => Ok(JobView::from_job(job, options)),
            _ => Err(JobServiceError::JobForbidden(job_id)),
        }
    }

    /// One page of the owner's jobs, newest first.
    pub async fn list_jobs_for_owner(
        &self,
        owner_id: Option<&str>,
        query: ListJobsQuery,
        options: ViewOptions,
    ) -> Result<JobPage, JobServiceError> {
        let owner_id = owner_id
            .filter(|o| !o.trim().is_empty())
            .ok_or(JobServiceError::AuthRequired)?;

        let filter = JobFilter {
            owner_id: Some(owner_id.to_string()),
            job_type: query
                .job_type
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            status: query.status,
        };
        let jobs = self.store.list_jobs(&filter).await?;

        let meta = PageMeta::new(query.page, query.limit, jobs.len() as u64);
        let jobs = jobs
            .into_iter()
            .skip(meta.offset())
            .take(meta.limit as usize)
            .map(|job| JobView::from_job(job, options))
            .collect();

        Ok(JobPage { jobs, meta })
    }

    pub async fn storage_info(&self) -> Result<StorageInfo, JobServiceError> {
        Ok(self.store.storage_info().await?)
    }

    pub async fn job_stats(&self) -> Result<JobStats, JobServiceError> {
        Ok(self.store.stats().await?)
    }

    pub fn pump(&self) -> &JobPump {
        &self.pump
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("registry", &self.registry)
            .field("pump", &self.pump)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PumpConfig, StorageMode};
    use crate::jobs::processor::{JobMetadata, ProgressReporter};
    use crate::jobs::store::InMemoryJobStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn noop() -> Arc<dyn JobProcessor> {
        Arc::new(|_: JsonValue, _: ProgressReporter, _: JobMetadata| async move {
            Ok::<_, anyhow::Error>(JsonValue::Null)
        })
    }

    fn service() -> JobService {
        let service = JobService::new(Arc::new(InMemoryJobStore::new()), PumpConfig::default());
        service.register_processor("noop", noop()).unwrap();
        service
    }

    #[tokio::test]
    async fn enqueue_requires_owner_first() {
        let service = service();
        let mut request = EnqueueRequest::new("  ", "u1", json!({}));
        request.owner_id = None;

        let err = service.enqueue_job(request).await.unwrap_err();
        assert_eq!(err.code(), "AuthRequired");
    }

    #[tokio::test]
    async fn enqueue_rejects_blank_type() {
        let err = service()
            .enqueue_job(EnqueueRequest::new(" ", "u1", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidJobType");
    }

    #[tokio::test]
    async fn enqueue_unregistered_type_creates_nothing() {
        let service = service();
        let err = service
            .enqueue_job(EnqueueRequest::new("missing", "u1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, JobServiceError::InvalidJobProcessor(ref t) if t == "missing"));
        assert_eq!(service.job_stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn inline_processor_is_registered() {
        let service = service();
        let outcome = service
            .enqueue_job(EnqueueRequest::new("inline", "u1", json!({})).with_processor(noop()))
            .await
            .unwrap();
        assert!(!outcome.reused);
        assert!(service.registry().contains("inline"));
    }

    #[tokio::test]
    async fn idempotency_key_is_trimmed_and_scoped() {
        let service = service();
        let first = service
            .enqueue_job(EnqueueRequest::new("noop", "u1", json!({"n": 1})).with_idempotency_key(" k "))
            .await
            .unwrap();
        let second = service
            .enqueue_job(EnqueueRequest::new("noop", "u1", json!({"n": 2})).with_idempotency_key("k"))
            .await
            .unwrap();
        let other_owner = service
            .enqueue_job(EnqueueRequest::new("noop", "u2", json!({})).with_idempotency_key("k"))
            .await
            .unwrap();

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.job.id, second.job.id);
        assert_eq!(first.job.idempotency_key.as_deref(), Some("k"));
        assert!(!other_owner.reused);
        assert_ne!(other_owner.job.id, first.job.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_idempotent_enqueues_share_one_job() {
        let service = service();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                service
                    .enqueue_job(EnqueueRequest::new("noop", "u1", json!({})).with_idempotency_key("same"))
                    .await
                    .unwrap()
            }));
        }

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }
        let first_id = outcomes[0].job.id;
        assert!(outcomes.iter().all(|o| o.job.id == first_id));
        assert_eq!(outcomes.iter().filter(|o| !o.reused).count(), 1);
    }

    #[tokio::test]
    async fn get_job_enforces_ownership() {
        let service = service();
        let job = service
            .enqueue_job(EnqueueRequest::new("noop", "owner-b", json!({"secret": true})))
            .await
            .unwrap()
            .job;

        let err = service
            .get_job_for_owner(job.id, Some("owner-a"), ViewOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "JobForbidden");

        let err = service
            .get_job_for_owner(job.id, None, ViewOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "JobForbidden");

        let err = service
            .get_job_for_owner(JobId::new(), Some("owner-b"), ViewOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "JobNotFound");

        let view = service
            .get_job_for_owner(job.id, Some("owner-b"), ViewOptions::default())
            .await
            .unwrap();
        assert_eq!(view.input, None);

        let view = service
            .get_job_for_owner(job.id, Some("owner-b"), ViewOptions::with_input())
            .await
            .unwrap();
        assert_eq!(view.input, Some(json!({"secret": true})));
    }

    #[tokio::test]
    async fn list_paginates_newest_first() {
        let service = service();
        let mut ids = Vec::new();
        for n in 0..5 {
            let outcome = service
                .enqueue_job(EnqueueRequest::new("noop", "u1", json!({ "n": n })))
                .await
                .unwrap();
            ids.push(outcome.job.id);
        }
        service
            .enqueue_job(EnqueueRequest::new("noop", "u2", json!({})))
            .await
            .unwrap();

        let page = service
            .list_jobs_for_owner(
                Some("u1"),
                ListJobsQuery {
                    page: Some(2),
                    limit: Some(2),
                    ..Default::default()
                },
                ViewOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            page.meta,
            PageMeta {
                page: 2,
                limit: 2,
                total: 5,
                total_pages: 3
            }
        );
        let listed: Vec<JobId> = page.jobs.iter().map(|j| j.id).collect();
        assert_eq!(listed, vec![ids[2], ids[1]]);
    }

    #[tokio::test]
    async fn list_trims_job_type_filter() {
        let service = service();
        service.register_processor("other", noop()).unwrap();
        for job_type in ["noop", "noop", "other"] {
            service
                .enqueue_job(EnqueueRequest::new(job_type, "u1", json!({})))
                .await
                .unwrap();
        }

        let list = |job_type: &str| {
            let query = ListJobsQuery {
                job_type: Some(job_type.to_string()),
                ..Default::default()
            };
            service.list_jobs_for_owner(Some("u1"), query, ViewOptions::default())
        };

        let padded = list(" noop ").await.unwrap();
        assert_eq!(padded.meta.total, 2);
        assert!(padded.jobs.iter().all(|j| j.job_type == "noop"));

        // Blank means unfiltered.
        assert_eq!(list("   ").await.unwrap().meta.total, 3);
    }

    #[test]
    fn page_meta_clamps_inputs() {
        assert_eq!(PageMeta::new(None, None, 0), PageMeta { page: 1, limit: 20, total: 0, total_pages: 1 });
        assert_eq!(PageMeta::new(Some(0), Some(0), 3).limit, 1);
        assert_eq!(PageMeta::new(Some(0), Some(0), 3).page, 1);
        assert_eq!(PageMeta::new(None, Some(500), 250).limit, 100);
        assert_eq!(PageMeta::new(None, Some(500), 250).total_pages, 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn pages_cover_every_job_exactly_once(total in 0u64..500, limit in 0u32..150) {
            let first = PageMeta::new(Some(1), Some(limit), total);
            prop_assert!((1..=MAX_PAGE_LIMIT).contains(&first.limit));

            let mut seen = 0u64;
            for page in 1..=first.total_pages {
                let meta = PageMeta::new(Some(page as u32), Some(limit), total);
                let remaining = total.saturating_sub(meta.offset() as u64);
                seen += remaining.min(u64::from(meta.limit));
            }
            prop_assert_eq!(seen, total);
        }
    }

    #[tokio::test]
    async fn list_requires_owner() {
        let err = service()
            .list_jobs_for_owner(None, ListJobsQuery::default(), ViewOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AuthRequired");
    }

    #[tokio::test]
    async fn start_fails_when_durable_storage_is_missing() {
        let config = JobConfig::default().with_storage_mode(StorageMode::Postgres);
        let service = JobService::from_config(config);
        let err = service.start().await.unwrap_err();
        assert_eq!(err.code(), "JobStorageInitFailed");
    }

    #[tokio::test]
    async fn start_reports_memory_storage() {
        let service = JobService::from_config(JobConfig::default().with_storage_mode(StorageMode::Memory));
        let handle = service.start().await.unwrap();
        let info = service.storage_info().await.unwrap();
        assert_eq!(info.mode, "memory");
        assert!(!info.durable);
        handle.shutdown().await;
    }
}
