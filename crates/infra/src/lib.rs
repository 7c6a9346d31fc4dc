//! Infrastructure layer: job storage backends, execution pump, job service.

/// Configuration loading and representation.
pub mod config;

/// Job queue, leases, processors and the execution pump.
pub mod jobs;


pub use config::{JobConfig, PumpConfig, StorageConfig, StorageMode};
pub use jobs::{EnqueueRequest, JobService, JobServiceError};
