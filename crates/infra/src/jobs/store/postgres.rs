//! Postgres-backed job store implementation.
//!
//! One `jobs` table holds every job. Coordination between pumps (in this
//! process or others) happens entirely through row-level locking here.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation on `jobs_idempotency_key_uniq`) | `23505` | `IdempotencyConflict` | Concurrent enqueue with the same idempotency triple |
//! | Database (other) | Any other | `Storage` | Constraint or query failures |
//! | PoolClosed / Io / Tls / other | N/A | `Storage` | Connection problems |
//!
//! ## Claiming
//!
//! `claim_next_queued_job` is a single `UPDATE ... WHERE id = (SELECT ...
//! FOR UPDATE SKIP LOCKED LIMIT 1)`. Concurrent claimers skip rows another
//! transaction already locked and move to the next candidate instead of
//! blocking behind it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};

use jobline_core::{
    DEFAULT_MAX_ATTEMPTS, IdempotencyScope, Job, JobError, JobId, JobProgress, JobStatus,
    MIN_RUNNING_PERCENT, NewJob, lease_deadline,
};

use super::{
    JobFilter, JobStats, JobStore, JobStoreError, ProgressUpdate, StorageInfo, SweepOutcome,
    retention_cutoff,
};

const IDEMPOTENCY_CONSTRAINT: &str = "jobs_idempotency_key_uniq";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id               UUID PRIMARY KEY,
        job_type         TEXT NOT NULL,
        owner_id         TEXT NOT NULL,
        idempotency_key  TEXT,
        status           TEXT NOT NULL CHECK (status IN ('queued', 'running', 'completed', 'failed')),
        progress_percent SMALLINT NOT NULL DEFAULT 0 CHECK (progress_percent BETWEEN 0 AND 100),
        progress_message TEXT NOT NULL DEFAULT '',
        input            JSONB NOT NULL,
        result           JSONB,
        error            JSONB,
        attempt_count    INTEGER NOT NULL DEFAULT 0,
        max_attempts     INTEGER NOT NULL CHECK (max_attempts > 0),
        worker_id        TEXT,
        lease_expires_at TIMESTAMPTZ,
        created_at       TIMESTAMPTZ NOT NULL,
        updated_at       TIMESTAMPTZ NOT NULL,
        started_at       TIMESTAMPTZ,
        completed_at     TIMESTAMPTZ,
        failed_at        TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS jobs_idempotency_key_uniq
        ON jobs (owner_id, job_type, idempotency_key)
        WHERE idempotency_key IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_queued_idx
        ON jobs (created_at, id)
        WHERE status = 'queued'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_owner_created_idx
        ON jobs (owner_id, created_at DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_running_lease_idx
        ON jobs (lease_expires_at)
        WHERE status = 'running'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_terminal_updated_idx
        ON jobs (updated_at)
        WHERE status IN ('completed', 'failed')
    "#,
];

macro_rules! job_columns {
    () => {
        r#"
        id,
        job_type,
        owner_id,
        idempotency_key,
        status,
        progress_percent,
        progress_message,
        input,
        result,
        error,
        attempt_count,
        max_attempts,
        worker_id,
        lease_expires_at,
        created_at,
        updated_at,
        started_at,
        completed_at,
        failed_at
        "#
    };
}

/// Postgres-backed job store.
///
/// `Send + Sync`; all operations go through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    default_max_attempts: u32,
}

impl PostgresJobStore {
    /// Create a store over an existing pool. Call [`ensure_schema`](Self::ensure_schema) before use.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_default_max_attempts(mut self, default_max_attempts: u32) -> Self {
        self.default_max_attempts = default_max_attempts.max(1);
        self
    }

    /// Connect a pool and make sure the schema exists.
    #[instrument(skip(database_url), err)]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the jobs table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        debug!("jobs schema ready");
        Ok(())
    }

    async fn fetch_optional(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        row.map(|row| decode_job(&row)).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new), fields(job_type = %new.job_type), err)]
    async fn create_job(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let scope = new.idempotency_scope();
        let job = Job::from_new(new, self.default_max_attempts, Utc::now());

        let row = sqlx::query(concat!(
            r#"
            INSERT INTO jobs (
                id,
                job_type,
                owner_id,
                idempotency_key,
                status,
                progress_percent,
                progress_message,
                input,
                attempt_count,
                max_attempts,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10, $10)
            RETURNING "#,
            job_columns!()
        ))
        .bind(job.id.as_uuid())
        .bind(&job.job_type)
        .bind(&job.owner_id)
        .bind(&job.idempotency_key)
        .bind(job.status.as_str())
        .bind(i16::from(job.progress.percent))
        .bind(&job.progress.message)
        .bind(&job.input)
        .bind(to_i32(job.max_attempts))
        .bind(job.created_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| match scope {
            Some(scope) if is_idempotency_violation(&e) => JobStoreError::IdempotencyConflict(scope),
            _ => map_sqlx_error("create_job", e),
        })?;

        decode_job(&row)
    }

    #[instrument(skip(self), err)]
    async fn find_job_by_idempotency(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<Job>, JobStoreError> {
        self.fetch_optional(
            "find_job_by_idempotency",
            sqlx::query(concat!(
                "SELECT ",
                job_columns!(),
                r#"
                FROM jobs
                WHERE owner_id = $1 AND job_type = $2 AND idempotency_key = $3
                ORDER BY created_at DESC
                LIMIT 1
                "#
            ))
            .bind(&scope.owner_id)
            .bind(&scope.job_type)
            .bind(&scope.key),
        )
        .await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.fetch_optional(
            "get_job",
            sqlx::query(concat!("SELECT ", job_columns!(), " FROM jobs WHERE id = $1"))
                .bind(job_id.as_uuid()),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            r#"
            FROM jobs
            WHERE ($1::text IS NULL OR owner_id = $1)
                AND ($2::text IS NULL OR job_type = $2)
                AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at DESC, id DESC
            "#
        ))
        .bind(filter.owner_id.as_deref())
        .bind(filter.job_type.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_next_queued_job(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();

        self.fetch_optional(
            "claim_next_queued_job",
            sqlx::query(concat!(
                r#"
                UPDATE jobs
                SET status = 'running',
                    worker_id = $1,
                    lease_expires_at = $2,
                    attempt_count = attempt_count + 1,
                    progress_percent = GREATEST(progress_percent, $3),
                    progress_message = 'Running',
                    started_at = COALESCE(started_at, $4),
                    updated_at = $4
                WHERE id = (
                    SELECT id
                    FROM jobs
                    WHERE status = 'queued'
                    ORDER BY created_at ASC, id ASC
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                RETURNING "#,
                job_columns!()
            ))
            .bind(worker_id)
            .bind(lease_deadline(now, lease))
            .bind(i16::from(MIN_RUNNING_PERCENT))
            .bind(now),
        )
        .await
    }

    #[instrument(skip(self, update), fields(job_id = %update.job_id), err)]
    async fn update_job_progress(&self, update: ProgressUpdate) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();

        self.fetch_optional(
            "update_job_progress",
            sqlx::query(concat!(
                r#"
                UPDATE jobs
                SET progress_percent = $2,
                    progress_message = $3,
                    lease_expires_at = $4,
                    updated_at = $5
                WHERE id = $1
                    AND status = 'running'
                    AND ($6::text IS NULL OR worker_id = $6)
                RETURNING "#,
                job_columns!()
            ))
            .bind(update.job_id.as_uuid())
            .bind(i16::from(update.progress.percent))
            .bind(&update.progress.message)
            .bind(lease_deadline(now, update.lease))
            .bind(now)
            .bind(update.worker_id.as_deref()),
        )
        .await
    }

    #[instrument(skip(self, result), fields(job_id = %job_id), err)]
    async fn complete_job(
        &self,
        job_id: JobId,
        result: JsonValue,
        worker_id: Option<&str>,
    ) -> Result<Option<Job>, JobStoreError> {
        let progress = JobProgress::completed();

        self.fetch_optional(
            "complete_job",
            sqlx::query(concat!(
                r#"
                UPDATE jobs
                SET status = 'completed',
                    progress_percent = $2,
                    progress_message = $3,
                    result = $4,
                    error = NULL,
                    worker_id = NULL,
                    lease_expires_at = NULL,
                    completed_at = $5,
                    updated_at = $5
                WHERE id = $1
                    AND status = 'running'
                    AND ($6::text IS NULL OR worker_id = $6)
                RETURNING "#,
                job_columns!()
            ))
            .bind(job_id.as_uuid())
            .bind(i16::from(progress.percent))
            .bind(progress.message)
            .bind(result)
            .bind(Utc::now())
            .bind(worker_id),
        )
        .await
    }

    #[instrument(skip(self, error), fields(job_id = %job_id, code = %error.code), err)]
    async fn fail_job(
        &self,
        job_id: JobId,
        error: JobError,
        worker_id: Option<&str>,
    ) -> Result<Option<Job>, JobStoreError> {
        let progress = JobProgress::failed();
        let error = encode_error(&error)?;

        self.fetch_optional(
            "fail_job",
            sqlx::query(concat!(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    progress_percent = $2,
                    progress_message = $3,
                    result = NULL,
                    error = $4,
                    worker_id = NULL,
                    lease_expires_at = NULL,
                    failed_at = $5,
                    updated_at = $5
                WHERE id = $1
                    AND status = 'running'
                    AND ($6::text IS NULL OR worker_id = $6)
                RETURNING "#,
                job_columns!()
            ))
            .bind(job_id.as_uuid())
            .bind(i16::from(progress.percent))
            .bind(progress.message)
            .bind(error)
            .bind(Utc::now())
            .bind(worker_id),
        )
        .await
    }

    #[instrument(skip(self, timeout_message), err)]
    async fn requeue_expired_jobs(
        &self,
        now: DateTime<Utc>,
        timeout_message: &str,
    ) -> Result<SweepOutcome, JobStoreError> {
        let retrying = JobProgress::retrying();
        let failed = JobProgress::failed();
        let timeout = encode_error(&JobError::timeout(timeout_message))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // attempt_count was bumped at claim time; the next claim bumps it again.
        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                worker_id = NULL,
                lease_expires_at = NULL,
                progress_percent = $2,
                progress_message = $3,
                updated_at = $1
            WHERE status = 'running'
                AND lease_expires_at < $1
                AND attempt_count < max_attempts
            "#,
        )
        .bind(now)
        .bind(i16::from(retrying.percent))
        .bind(&retrying.message)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("requeue_expired_jobs", e))?
        .rows_affected();

        let timed_out = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                worker_id = NULL,
                lease_expires_at = NULL,
                progress_percent = $2,
                progress_message = $3,
                result = NULL,
                error = $4,
                failed_at = $1,
                updated_at = $1
            WHERE status = 'running'
                AND lease_expires_at < $1
                AND attempt_count >= max_attempts
            "#,
        )
        .bind(now)
        .bind(i16::from(failed.percent))
        .bind(&failed.message)
        .bind(timeout)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail_expired_jobs", e))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(SweepOutcome {
            requeued,
            timed_out,
        })
    }

    #[instrument(skip(self), err)]
    async fn delete_stale_jobs(&self, retention: Duration) -> Result<u64, JobStoreError> {
        let cutoff = retention_cutoff(Utc::now(), retention);

        let deleted = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed')
                AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_stale_jobs", e))?
        .rows_affected();

        Ok(deleted)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            let total = u64::try_from(total).unwrap_or_default();
            match JobStatus::parse(&status) {
                Some(JobStatus::Queued) => stats.queued += total,
                Some(JobStatus::Running) => stats.running += total,
                Some(JobStatus::Completed) => stats.completed += total,
                Some(JobStatus::Failed) => stats.failed += total,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn storage_info(&self) -> Result<StorageInfo, JobStoreError> {
        Ok(StorageInfo {
            mode: "postgres",
            durable: true,
        })
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn encode_error(error: &JobError) -> Result<JsonValue, JobStoreError> {
    serde_json::to_value(error).map_err(|e| JobStoreError::Serialization(e.to_string()))
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Serialization(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("unknown")
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("timed out acquiring a connection in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique violation of the idempotency index.
fn is_idempotency_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505")
            && db_err.constraint() == Some(IDEMPOTENCY_CONSTRAINT);
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    job_type: String,
    owner_id: String,
    idempotency_key: Option<String>,
    status: String,
    progress_percent: i16,
    progress_message: String,
    input: JsonValue,
    result: Option<JsonValue>,
    error: Option<JsonValue>,
    attempt_count: i32,
    max_attempts: i32,
    worker_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            owner_id: row.try_get("owner_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status: row.try_get("status")?,
            progress_percent: row.try_get("progress_percent")?,
            progress_message: row.try_get("progress_message")?,
            input: row.try_get("input")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            worker_id: row.try_get("worker_id")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            JobStoreError::Serialization(format!("unknown job status '{}'", row.status))
        })?;
        let error = row
            .error
            .map(serde_json::from_value::<JobError>)
            .transpose()
            .map_err(|e| JobStoreError::Serialization(format!("invalid job error: {e}")))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            owner_id: row.owner_id,
            idempotency_key: row.idempotency_key,
            status,
            progress: JobProgress::new(i64::from(row.progress_percent), row.progress_message),
            input: row.input,
            result: row.result,
            error,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or_default(),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(1),
            worker_id: row.worker_id,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
        })
    }
}
