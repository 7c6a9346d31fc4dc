//! Job engine configuration, read once at startup.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use jobline_core::DEFAULT_MAX_ATTEMPTS;

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Use Postgres when `DATABASE_URL` is set and reachable, otherwise memory.
    #[default]
    Auto,
    /// Require Postgres; initialization failures are fatal.
    Postgres,
    /// Force the process-local store.
    Memory,
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "postgres" | "durable" | "db" => Ok(Self::Postgres),
            "memory" | "in-memory" | "mem" => Ok(Self::Memory),
            other => Err(format!("unknown storage mode '{other}'")),
        }
    }
}

/// Storage backend selection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub mode: StorageMode,
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Applied to jobs created without an explicit attempt ceiling
    pub default_max_attempts: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Auto,
            database_url: None,
            max_connections: 5,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Execution pump settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpConfig {
    /// Maximum concurrently executing jobs in this process
    pub concurrency: usize,
    /// Lease granted on claim and on every progress report
    pub lease: Duration,
    /// Terminal jobs older than this are deleted
    pub retention: Duration,
    /// Prefix of the lease holder token taken on each claim
    pub worker_id: String,
    /// How often the pump runs on its own for lease sweeps
    pub housekeeping_interval: Duration,
    /// Recorded on jobs failed by lease exhaustion
    pub timeout_message: String,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            lease: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            worker_id: default_worker_id(),
            housekeeping_interval: Duration::from_secs(30),
            timeout_message: "Job lease expired before completion".to_string(),
        }
    }
}

/// Full job engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobConfig {
    pub storage: StorageConfig,
    pub pump: PumpConfig,
}

impl JobConfig {
    /// Load configuration from environment variables.
    ///
    /// Invalid values are logged and replaced by defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let storage = StorageConfig {
            mode: parse_or("JOB_STORAGE_MODE", &lookup, defaults.storage.mode),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            max_connections: parse_or(
                "JOB_DB_MAX_CONNECTIONS",
                &lookup,
                defaults.storage.max_connections,
            )
            .max(1),
            default_max_attempts: parse_or(
                "JOB_MAX_ATTEMPTS",
                &lookup,
                defaults.storage.default_max_attempts,
            )
            .max(1),
        };

        let pump = PumpConfig {
            concurrency: parse_or("JOB_WORKER_CONCURRENCY", &lookup, defaults.pump.concurrency)
                .max(1),
            lease: millis_or("JOB_LEASE_MS", &lookup, defaults.pump.lease),
            retention: millis_or("JOB_RETENTION_MS", &lookup, defaults.pump.retention),
            worker_id: lookup("JOB_WORKER_ID")
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or(defaults.pump.worker_id),
            housekeeping_interval: millis_or(
                "JOB_HOUSEKEEPING_INTERVAL_MS",
                &lookup,
                defaults.pump.housekeeping_interval,
            ),
            timeout_message: defaults.pump.timeout_message,
        };

        Self { storage, pump }
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage.mode = mode;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.storage.database_url = Some(url.into());
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.storage.default_max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.pump.concurrency = concurrency.max(1);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.pump.lease = lease;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.pump.retention = retention;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.pump.worker_id = worker_id.into();
        self
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.pump.housekeeping_interval = interval;
        self
    }
}

fn default_worker_id() -> String {
    format!("worker-{}-{}", std::process::id(), Uuid::now_v7().simple())
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|e| {
            warn!(key, value = %raw, error = %e, "invalid configuration value; using default");
            default
        }),
    }
}

fn millis_or<F>(key: &str, lookup: &F, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(parse_or(key, lookup, default_ms))
}
