//! Execution pump: claims queued jobs and runs them up to a concurrency ceiling.
//!
//! ## Scheduling
//!
//! A pump cycle is never invoked directly. [`JobPump::trigger`] sets a
//! "scheduled" flag and spawns a cycle only if the flag was clear, so a burst
//! of enqueues collapses into one cycle. The flag is cleared when the cycle
//! starts; triggers that arrive while a cycle runs schedule one more pass.
//!
//! Cycles are serialized by a mutex. Within a cycle the pump:
//!
//! 1. deletes terminal jobs past retention and sweeps expired leases,
//! 2. claims jobs while fewer than `concurrency` are active,
//! 3. spawns each claimed job and returns without waiting for it.
//!
//! Every settled job re-triggers the pump, as does the housekeeping interval
//! started by [`JobPump::start`].
//!
//! ## Lease holders
//!
//! Each claim takes the lease under a fresh holder token,
//! `<worker_id>:<claim uuid>`. An attempt that outlives its lease therefore
//! cannot heartbeat, complete, or fail a later attempt of the same job, even
//! when this pump made both claims.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use jobline_core::{Job, JobError};

use crate::config::PumpConfig;

use super::processor::{JobMetadata, JobProcessor, ProcessorRegistry, ProgressReporter};
use super::store::JobStore;

/// Pump runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PumpStats {
    pub cycles: u64,
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
}

#[derive(Debug, Default)]
struct StatCounters {
    cycles: AtomicU64,
    claimed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Handle to the periodic housekeeping task.
#[derive(Debug)]
pub struct PumpHandle {
    pump: JobPump,
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
}

impl PumpHandle {
    /// Stop the housekeeping interval.
    ///
    /// Jobs already executing keep running to completion.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "job pump housekeeping task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> PumpStats {
        self.pump.stats()
    }
}

/// In-process job dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct JobPump {
    inner: Arc<PumpInner>,
}

struct PumpInner {
    store: Arc<dyn JobStore>,
    registry: Arc<ProcessorRegistry>,
    config: PumpConfig,
    active: AtomicUsize,
    scheduled: AtomicBool,
    cycle_lock: Mutex<()>,
    stats: StatCounters,
}

impl JobPump {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<ProcessorRegistry>, config: PumpConfig) -> Self {
        Self {
            inner: Arc::new(PumpInner {
                store,
                registry,
                config,
                active: AtomicUsize::new(0),
                scheduled: AtomicBool::new(false),
                cycle_lock: Mutex::new(()),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Schedule a pump cycle unless one is already pending.
    ///
    /// Must be called from within a Tokio runtime; outside one the trigger is
    /// logged and dropped.
    pub fn trigger(&self) {
        self.inner.trigger();
    }

    /// Run one cycle now and wait for it to finish claiming.
    ///
    /// Claimed jobs still execute in the background.
    pub async fn run_once(&self) {
        self.inner.scheduled.store(true, Ordering::SeqCst);
        run_cycle(self.inner.clone()).await;
    }

    /// Start the housekeeping interval and kick off a first cycle.
    pub fn start(&self) -> PumpHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let pump = self.clone();
        let interval = self.inner.config.housekeeping_interval.max(std::time::Duration::from_millis(10));

        info!(
            worker_id = %self.inner.config.worker_id,
            concurrency = self.inner.config.concurrency,
            housekeeping_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "job pump started"
        );

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => pump.trigger(),
                }
            }
            debug!("job pump housekeeping stopped");
        });

        PumpHandle {
            pump: self.clone(),
            shutdown,
            join: Some(join),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PumpStats {
        let stats = &self.inner.stats;
        PumpStats {
            cycles: stats.cycles.load(Ordering::Relaxed),
            jobs_claimed: stats.claimed.load(Ordering::Relaxed),
            jobs_succeeded: stats.succeeded.load(Ordering::Relaxed),
            jobs_failed: stats.failed.load(Ordering::Relaxed),
            current_running: self.active_workers(),
        }
    }
}

impl std::fmt::Debug for JobPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPump")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PumpInner {
    fn trigger(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_cycle(self.clone()));
            }
            Err(_) => {
                self.scheduled.store(false, Ordering::SeqCst);
                warn!("job pump triggered outside a Tokio runtime; ignoring");
            }
        }
    }

    fn lease_holder(&self) -> String {
        format!("{}:{}", self.config.worker_id, Uuid::now_v7().simple())
    }

    fn has_capacity(&self) -> bool {
        self.active.load(Ordering::SeqCst) < self.config.concurrency.max(1)
    }
}

async fn run_cycle(inner: Arc<PumpInner>) {
    let _cycle = inner.cycle_lock.lock().await;
    inner.scheduled.store(false, Ordering::SeqCst);
    inner.stats.cycles.fetch_add(1, Ordering::Relaxed);

    housekeeping(&inner).await;

    while inner.has_capacity() {
        let lease_holder = inner.lease_holder();
        let job = match inner
            .store
            .claim_next_queued_job(&lease_holder, inner.config.lease)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to claim next job");
                break;
            }
        };
        inner.stats.claimed.fetch_add(1, Ordering::Relaxed);

        let Some(processor) = inner.registry.get(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "claimed job has no local processor");
            let error = JobError::processor_not_registered(&job.job_type);
            settle_failure(&inner, &job, &lease_holder, error).await;
            continue;
        };

        inner.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(execute(inner.clone(), job, lease_holder, processor));
    }
}

/// Retention and lease sweeps. Errors are logged, never raised.
async fn housekeeping(inner: &PumpInner) {
    match inner.store.delete_stale_jobs(inner.config.retention).await {
        Ok(0) => {}
        Ok(deleted) => info!(deleted, "deleted stale jobs"),
        Err(e) => warn!(error = %e, "stale job cleanup failed"),
    }

    match inner
        .store
        .requeue_expired_jobs(Utc::now(), &inner.config.timeout_message)
        .await
    {
        Ok(outcome) if outcome.requeued > 0 || outcome.timed_out > 0 => {
            info!(
                requeued = outcome.requeued,
                timed_out = outcome.timed_out,
                "swept expired job leases"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "expired lease sweep failed"),
    }
}

#[instrument(
    skip_all,
    fields(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt_count, lease_holder = %lease_holder)
)]
async fn execute(inner: Arc<PumpInner>, job: Job, lease_holder: String, processor: Arc<dyn JobProcessor>) {
    let reporter = ProgressReporter::new(inner.store.clone(), job.id, lease_holder.clone(), inner.config.lease);
    let metadata = JobMetadata::from(&job);
    let input = job.input.clone();

    // Runs in its own task so a panicking processor fails the job instead of the pump.
    let outcome = tokio::spawn(async move { processor.process(input, reporter, metadata).await }).await;

    match outcome {
        Ok(Ok(result)) => {
            match inner.store.complete_job(job.id, result, Some(lease_holder.as_str())).await {
                Ok(Some(_)) => {
                    inner.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!("job completed");
                }
                Ok(None) => debug!("completion dropped; lease no longer held"),
                Err(e) => error!(error = %e, "failed to record job completion"),
            }
        }
        Ok(Err(err)) => settle_failure(&inner, &job, &lease_holder, classify_error(err)).await,
        Err(join_err) => {
            let message = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                "processor task was cancelled".to_string()
            };
            settle_failure(&inner, &job, &lease_holder, JobError::execution_failed(message)).await;
        }
    }

    inner.active.fetch_sub(1, Ordering::SeqCst);
    inner.trigger();
}

async fn settle_failure(inner: &PumpInner, job: &Job, lease_holder: &str, error: JobError) {
    let code = error.code.clone();
    match inner.store.fail_job(job.id, error, Some(lease_holder)).await {
        Ok(Some(_)) => {
            inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(job_id = %job.id, code = %code, "job failed");
        }
        Ok(None) => debug!(job_id = %job.id, "failure dropped; lease no longer held"),
        Err(e) => error!(job_id = %job.id, error = %e, "failed to record job failure"),
    }
}

/// Typed [`JobError`]s keep their code; everything else is `JobExecutionFailed`.
pub(crate) fn classify_error(err: anyhow::Error) -> JobError {
    match err.downcast::<JobError>() {
        Ok(job_error) => job_error,
        Err(other) => JobError::execution_failed(other.to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("processor panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("processor panicked: {s}")
    } else {
        "processor panicked".to_string()
    }
}
