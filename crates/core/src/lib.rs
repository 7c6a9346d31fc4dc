//! `jobline-core` — job model building blocks.
//!
//! This crate contains the job record, its state machine and the client-facing
//! projection (no storage or runtime concerns).

pub mod error;
pub mod id;
pub mod job;
pub mod view;

pub use error::{InvalidJobId, JobError, codes};
pub use id::JobId;
pub use job::{
    DEFAULT_MAX_ATTEMPTS, IdempotencyScope, Job, JobProgress, JobStatus, LeaseExpiry,
    MIN_RUNNING_PERCENT, NewJob, lease_deadline,
};
pub use view::{JobView, ViewOptions};
