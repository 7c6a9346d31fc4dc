//! Process-local job store.
//!
//! Used when no durable backend is configured. Every operation runs inside a
//! single lock, so claims are atomic within this process; there is no
//! cross-process sharing by construction.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use jobline_core::{
    DEFAULT_MAX_ATTEMPTS, IdempotencyScope, Job, JobError, JobId, JobStatus, LeaseExpiry, NewJob,
};

use super::{
    JobFilter, JobStats, JobStore, JobStoreError, ProgressUpdate, StorageInfo, SweepOutcome,
    retention_cutoff,
};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    idempotency: HashMap<IdempotencyScope, JobId>,
}

/// In-memory job store for tests/dev and database-less deployments.
#[derive(Debug)]
pub struct InMemoryJobStore {
    state: RwLock<MemoryState>,
    default_max_attempts: u32,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_default_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_default_max_attempts(default_max_attempts: u32) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            default_max_attempts: default_max_attempts.max(1),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, JobStoreError> {
        self.state
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, JobStoreError> {
        self.state
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    /// Apply `f` to a running job when `worker_id` (if given) still holds it.
    fn mutate_held<F>(
        &self,
        job_id: JobId,
        worker_id: Option<&str>,
        f: F,
    ) -> Result<Option<Job>, JobStoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut state = self.write()?;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running || !job.is_held_by(worker_id) {
            return Ok(None);
        }
        f(job);
        Ok(Some(job.clone()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Creation order, oldest first; ids break timestamp ties.
fn creation_key(job: &Job) -> (DateTime<Utc>, JobId) {
    (job.created_at, job.id)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let mut state = self.write()?;

        if let Some(id) = new.id {
            if state.jobs.contains_key(&id) {
                return Err(JobStoreError::Storage(format!("job already exists: {id}")));
            }
        }

        let scope = new.idempotency_scope();
        if let Some(scope) = &scope {
            if let Some(existing) = state.idempotency.get(scope) {
                if state.jobs.contains_key(existing) {
                    return Err(JobStoreError::IdempotencyConflict(scope.clone()));
                }
            }
        }

        let job = Job::from_new(new, self.default_max_attempts, Utc::now());
        if let Some(scope) = scope {
            state.idempotency.insert(scope, job.id);
        }
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_job_by_idempotency(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<Job>, JobStoreError> {
        let state = self.read()?;
        Ok(state
            .idempotency
            .get(scope)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let state = self.read()?;
        let mut result: Vec<_> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();

        result.sort_by(|a, b| creation_key(b).cmp(&creation_key(a)));
        Ok(result)
    }

    async fn claim_next_queued_job(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.write()?;

        let next = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by_key(|j| creation_key(j))
            .map(|j| j.id);

        let Some(job) = next.and_then(|id| state.jobs.get_mut(&id)) else {
            return Ok(None);
        };
        job.claim(worker_id, lease, Utc::now());
        Ok(Some(job.clone()))
    }

    async fn update_job_progress(&self, update: ProgressUpdate) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.write()?;
        let Some(job) = state.jobs.get_mut(&update.job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running || !job.is_held_by(update.worker_id.as_deref()) {
            return Ok(None);
        }
        job.heartbeat(update.progress, update.lease, Utc::now());
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        job_id: JobId,
        result: JsonValue,
        worker_id: Option<&str>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.mutate_held(job_id, worker_id, |job| job.complete(result, Utc::now()))
    }

    async fn fail_job(
        &self,
        job_id: JobId,
        error: JobError,
        worker_id: Option<&str>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.mutate_held(job_id, worker_id, |job| job.fail(error, Utc::now()))
    }

    async fn requeue_expired_jobs(
        &self,
        now: DateTime<Utc>,
        timeout_message: &str,
    ) -> Result<SweepOutcome, JobStoreError> {
        let mut state = self.write()?;
        let mut outcome = SweepOutcome::default();

        for job in state.jobs.values_mut().filter(|j| j.is_lease_expired(now)) {
            match job.expire_lease(timeout_message, now) {
                LeaseExpiry::Requeued => outcome.requeued += 1,
                LeaseExpiry::TimedOut => outcome.timed_out += 1,
            }
        }

        Ok(outcome)
    }

    async fn delete_stale_jobs(&self, retention: Duration) -> Result<u64, JobStoreError> {
        let cutoff = retention_cutoff(Utc::now(), retention);
        let mut state = self.write()?;

        let stale: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.updated_at < cutoff)
            .map(|j| j.id)
            .collect();

        for id in &stale {
            if let Some(job) = state.jobs.remove(id) {
                if let Some(scope) = job.idempotency_scope() {
                    if state.idempotency.get(&scope) == Some(id) {
                        state.idempotency.remove(&scope);
                    }
                }
            }
        }

        Ok(stale.len() as u64)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.read()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }

    async fn storage_info(&self) -> Result<StorageInfo, JobStoreError> {
        Ok(StorageInfo {
            mode: "memory",
            durable: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jobline_core::JobProgress;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    fn echo(owner: &str) -> NewJob {
        NewJob::new("echo", owner, json!({"value": 42}))
    }

    fn progress(job_id: JobId, worker_id: &str, percent: i64) -> ProgressUpdate {
        ProgressUpdate {
            job_id,
            progress: JobProgress::new(percent, "working"),
            worker_id: Some(worker_id.to_string()),
            lease: LEASE,
        }
    }

    fn after_lease() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::minutes(5)
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(echo("u1")).await.unwrap();

        let claimed = store.claim_next_queued_job("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert_eq!(claimed.progress, JobProgress::new(5, "Running"));

        // No more jobs
        assert!(store.claim_next_queued_job("w1", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        let store = InMemoryJobStore::new();
        let first = store.create_job(echo("u1")).await.unwrap();
        let second = store.create_job(echo("u2")).await.unwrap();

        let a = store.claim_next_queued_job("w", LEASE).await.unwrap().unwrap();
        let b = store.claim_next_queued_job("w", LEASE).await.unwrap().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_hand_out_a_job_once() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = store.create_job(echo("u1")).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .claim_next_queued_job(&format!("w{i}"), LEASE)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = Vec::new();
        for task in tasks {
            if let Some(claimed) = task.await.unwrap() {
                winners.push(claimed);
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].id, job.id);
        assert_eq!(winners[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_conflicts() {
        let store = InMemoryJobStore::new();
        let original = store
            .create_job(echo("u1").with_idempotency_key("k1"))
            .await
            .unwrap();

        let err = store
            .create_job(echo("u1").with_idempotency_key("k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::IdempotencyConflict(_)));

        let found = store
            .find_job_by_idempotency(&IdempotencyScope::new("u1", "echo", "k1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, original.id);

        // Same key under another owner is a different scope.
        assert!(store.create_job(echo("u2").with_idempotency_key("k1")).await.is_ok());
    }

    #[tokio::test]
    async fn stale_progress_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(echo("u1")).await.unwrap();
        store.claim_next_queued_job("w1", LEASE).await.unwrap();

        let rejected = store.update_job_progress(progress(job.id, "w2", 80)).await.unwrap();
        assert!(rejected.is_none());
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, JobProgress::new(5, "Running"));

        let accepted = store
            .update_job_progress(progress(job.id, "w1", 40))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.progress, JobProgress::new(40, "working"));
    }

    #[tokio::test]
    async fn progress_requires_running_job() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(echo("u1")).await.unwrap();
        assert!(
            store
                .update_job_progress(ProgressUpdate {
                    worker_id: None,
                    ..progress(job.id, "w1", 10)
                })
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn complete_and_fail_respect_lease_holder() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(echo("u1")).await.unwrap();
        store.claim_next_queued_job("w1", LEASE).await.unwrap();

        assert!(
            store
                .complete_job(job.id, json!(1), Some("w2"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .fail_job(job.id, JobError::execution_failed("x"), Some("w2"))
                .await
                .unwrap()
                .is_none()
        );

        let done = store
            .complete_job(job.id, json!({"echoed": 42}), Some("w1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.worker_id.is_none());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn complete_and_fail_require_running_job() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(echo("u1")).await.unwrap();

        // Queued: not claimed yet, nothing to settle.
        assert!(store.complete_job(job.id, json!("x"), None).await.unwrap().is_none());
        assert!(
            store
                .fail_job(job.id, JobError::execution_failed("x"), None)
                .await
                .unwrap()
                .is_none()
        );
        let untouched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Queued);
        assert_eq!(untouched.attempt_count, 0);
        assert!(untouched.started_at.is_none());

        store.claim_next_queued_job("w1", LEASE).await.unwrap();
        store
            .complete_job(job.id, json!({"echoed": 42}), None)
            .await
            .unwrap()
            .unwrap();

        // Terminal: a completed job cannot be flipped to failed.
        assert!(
            store
                .fail_job(job.id, JobError::new("Y", "late"), None)
                .await
                .unwrap()
                .is_none()
        );
        let done = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result, Some(json!({"echoed": 42})));
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_requeued_and_claimable() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(echo("u1")).await.unwrap();
        store.claim_next_queued_job("w1", LEASE).await.unwrap();

        let outcome = store.requeue_expired_jobs(after_lease(), "timed out").await.unwrap();
        assert_eq!(outcome, SweepOutcome { requeued: 1, timed_out: 0 });

        let requeued = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.attempt_count, 1);
        assert!(requeued.worker_id.is_none() && requeued.lease_expires_at.is_none());

        // The old holder can no longer report progress.
        assert!(store.update_job_progress(progress(job.id, "w1", 50)).await.unwrap().is_none());

        let reclaimed = store.claim_next_queued_job("w2", LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[tokio::test]
    async fn exhausted_lease_fails_with_timeout() {
        let store = InMemoryJobStore::new();
        let job = store
            .create_job(echo("u1").with_max_attempts(3))
            .await
            .unwrap();

        for attempt in 1..=3 {
            let claimed = store.claim_next_queued_job("w", LEASE).await.unwrap().unwrap();
            assert_eq!(claimed.attempt_count, attempt);
            store.requeue_expired_jobs(after_lease(), "timed out").await.unwrap();
        }

        let failed = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        let error = failed.error.unwrap();
        assert_eq!(error.code, "JobTimeout");
        assert_eq!(error.message, "timed out");
        assert!(store.claim_next_queued_job("w", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unexpired_leases_are_left_alone() {
        let store = InMemoryJobStore::new();
        store.create_job(echo("u1")).await.unwrap();
        store.claim_next_queued_job("w1", LEASE).await.unwrap();

        let outcome = store.requeue_expired_jobs(Utc::now(), "timed out").await.unwrap();
        assert_eq!(outcome, SweepOutcome::default());
    }

    #[tokio::test]
    async fn retention_sweep_removes_only_old_terminal_jobs() {
        let store = InMemoryJobStore::new();
        let done = store
            .create_job(echo("u1").with_idempotency_key("k1"))
            .await
            .unwrap();
        let queued = store.create_job(echo("u1")).await.unwrap();
        store.claim_next_queued_job("w", LEASE).await.unwrap();
        store.complete_job(done.id, json!(1), None).await.unwrap();

        // Inside a one-hour window nothing is stale.
        assert_eq!(store.delete_stale_jobs(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(store.get_job(done.id).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.delete_stale_jobs(Duration::ZERO).await.unwrap(), 1);
        assert!(store.get_job(done.id).await.unwrap().is_none());
        assert!(store.get_job(queued.id).await.unwrap().is_some());

        // The idempotency slot is free again.
        let fresh = store
            .create_job(echo("u1").with_idempotency_key("k1"))
            .await
            .unwrap();
        assert_ne!(fresh.id, done.id);
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        let store = InMemoryJobStore::new();
        let a = store.create_job(echo("u1")).await.unwrap();
        let b = store
            .create_job(NewJob::new("report", "u1", json!({})))
            .await
            .unwrap();
        store.create_job(echo("u2")).await.unwrap();

        let mine = store.list_jobs(&JobFilter::owner("u1")).await.unwrap();
        assert_eq!(mine.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b.id, a.id]);

        let reports = store
            .list_jobs(&JobFilter::owner("u1").with_type("report"))
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);

        let running = store
            .list_jobs(&JobFilter::default().with_status(JobStatus::Running))
            .await
            .unwrap();
        assert!(running.is_empty());
        assert_eq!(store.list_jobs(&JobFilter::default()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store
                .create_job(NewJob::new("echo", "u1", json!({"i": i})))
                .await
                .unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 5);

        store.claim_next_queued_job("w", LEASE).await.unwrap();
        store.claim_next_queued_job("w", LEASE).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.running, 2);
        assert_eq!(stats.total(), 5);
    }

    #[tokio::test]
    async fn default_max_attempts_applies_when_unset() {
        let store = InMemoryJobStore::with_default_max_attempts(7);
        let job = store.create_job(echo("u1")).await.unwrap();
        assert_eq!(job.max_attempts, 7);

        let explicit = store.create_job(echo("u1").with_max_attempts(2)).await.unwrap();
        assert_eq!(explicit.max_attempts, 2);
    }
}
