//! Job queue with worker leases.
//!
//! ## Design
//!
//! - Jobs are owner-scoped and typed by a free-form job type string
//! - Submissions may carry an idempotency key scoped to `(owner, type)`
//! - Running jobs hold a time-bounded lease renewed by progress reports
//! - Expired leases are requeued until the attempt budget runs out
//! - All coordination goes through the store's atomic claim
//!
//! ## Components
//!
//! - `JobStore`: persistence (in-memory or Postgres), selected once per process
//! - `ProcessorRegistry`: job type to processor mapping
//! - `JobPump`: claims queued jobs and runs them up to a concurrency ceiling
//! - `JobService`: ownership checks, enqueue, listing

pub mod processor;
pub mod pump;
pub mod service;
pub mod store;

pub use processor::{
    InvalidProcessorType, JobMetadata, JobProcessor, ProcessorRegistry, ProgressReporter,
};
pub use pump::{JobPump, PumpHandle, PumpStats};
pub use service::{
    EnqueueOutcome, EnqueueRequest, JobPage, JobService, JobServiceError, ListJobsQuery, PageMeta,
};
pub use store::{
    InMemoryJobStore, JobFilter, JobStats, JobStore, JobStoreError, LazyJobStore,
    PostgresJobStore, ProgressUpdate, StorageInfo, SweepOutcome, open_job_store,
};
