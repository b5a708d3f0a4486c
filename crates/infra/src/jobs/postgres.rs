//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_batch` is a single `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE
//! SKIP LOCKED) RETURNING ...` statement. Rows locked by a concurrent claim are
//! skipped rather than waited on, so any number of dispatchers can poll the
//! same queue without handing one job to two of them.
//!
//! ## Transitions
//!
//! Outcome updates (`mark_completed`, `mark_retry`, `mark_failed`, `release`)
//! lock the row with `SELECT ... FOR UPDATE`, apply the transition through
//! [`Job`]'s state machine, and write the result back in the same
//! transaction. The transition rules are therefore identical to the
//! in-memory store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed, Io, Tls, ... | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use jobqueue_core::{DomainResult, Job, JobId, JobStatus, JobType, NewJob, QueueName};

use super::store::{JobStore, QueueStats, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id            UUID PRIMARY KEY,
        queue_name    TEXT NOT NULL,
        job_type      TEXT NOT NULL,
        payload       JSONB NOT NULL,
        priority      INTEGER NOT NULL DEFAULT 0,
        max_retries   BIGINT NOT NULL CHECK (max_retries >= 0),
        attempts      BIGINT NOT NULL DEFAULT 0 CHECK (attempts >= 0 AND attempts <= max_retries),
        status        TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
        run_at        TIMESTAMPTZ NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL,
        updated_at    TIMESTAMPTZ NOT NULL,
        started_at    TIMESTAMPTZ,
        completed_at  TIMESTAMPTZ,
        failed_at     TIMESTAMPTZ,
        result        JSONB,
        error         TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_queue_type_idx
        ON jobs (queue_name, job_type)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_claim_idx
        ON jobs (queue_name, status, run_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_retention_idx
        ON jobs (queue_name, status, updated_at)
    "#,
];

const COLUMNS: &str = "id, queue_name, job_type, payload, priority, max_retries, attempts, status, \
     run_at, created_at, updated_at, started_at, completed_at, failed_at, result, error";

/// Postgres-backed durable job store.
///
/// `Send + Sync`; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `jobs` table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn transition<F>(&self, operation: &str, id: JobId, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Job) -> DomainResult<()> + Send,
    {
        let mut tx: Transaction<'_, Postgres> = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        let mut job = match row {
            Some(row) => job_from_row(&row)?,
            None => return Err(StoreError::NotFound(id)),
        };

        apply(&mut job)?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                attempts = $3,
                run_at = $4,
                updated_at = $5,
                completed_at = $6,
                failed_at = $7,
                result = $8,
                error = $9
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(job.status.as_str())
        .bind(i64::from(job.attempts))
        .bind(job.run_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(job.result.as_ref())
        .bind(job.error.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue_name, job_type = %job.job_type), err)]
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue_name, job_type, payload, priority, max_retries,
                attempts, status, run_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, 'pending', $7, $8, $8)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.queue_name.as_str())
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.priority)
        .bind(i64::from(job.max_retries))
        .bind(job.run_at)
        .bind(now)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(err) if is_unique_violation(&err) => Err(StoreError::AlreadyExists(job.id)),
            Err(err) => Err(map_sqlx_error("insert", err)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn claim_batch(
        &self,
        queue: &QueueName,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = $3, updated_at = $3
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue_name = $1 AND status = 'pending' AND run_at <= $3
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'pending'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(queue.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        // RETURNING does not preserve the subquery order.
        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(Job::claim_order);
        Ok(jobs)
    }

    #[instrument(skip(self, result), fields(job_id = %id), err)]
    async fn mark_completed(
        &self,
        id: JobId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition("mark_completed", id, |job| job.complete(result, now))
            .await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn mark_retry(
        &self,
        id: JobId,
        error: &str,
        attempts: u32,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition("mark_retry", id, |job| {
            job.schedule_retry(attempts, error, next_run_at, now)
        })
        .await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn mark_failed(
        &self,
        id: JobId,
        error: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition("mark_failed", id, |job| job.fail(attempts, error, now))
            .await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn release(
        &self,
        id: JobId,
        error: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition("release", id, |job| job.release(error, run_at, now))
            .await
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM jobs
            WHERE queue_name = $1
            GROUP BY status
            "#,
        )
        .bind(queue.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            stats.add(parse_status(&status)?, count.max(0) as u64);
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn delete_older_than(
        &self,
        queue: &QueueName,
        cutoff: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<u64, StoreError> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let statuses: Vec<&str> = statuses.iter().map(JobStatus::as_str).collect();

        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue_name = $1 AND status = ANY($2) AND updated_at < $3
            "#,
        )
        .bind(queue.as_str())
        .bind(&statuses)
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_older_than", e))?;

        Ok(result.rows_affected())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed during {}", operation))
        }
        other => StoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Storage(format!("unknown job status in database: {raw}")))
}

fn to_u32(column: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Storage(format!("column {column} out of range: {value}")))
}

// SQLx row type

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    queue_name: String,
    job_type: String,
    payload: serde_json::Value,
    priority: i32,
    max_retries: i64,
    attempts: i64,
    status: String,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            max_retries: row.try_get("max_retries")?,
            attempts: row.try_get("attempts")?,
            status: row.try_get("status")?,
            run_at: row.try_get("run_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            queue_name: QueueName::new(row.queue_name).map_err(|e| StoreError::Storage(e.to_string()))?,
            job_type: JobType::new(row.job_type).map_err(|e| StoreError::Storage(e.to_string()))?,
            payload: row.payload,
            priority: row.priority,
            max_retries: to_u32("max_retries", row.max_retries)?,
            attempts: to_u32("attempts", row.attempts)?,
            status: parse_status(&row.status)?,
            run_at: row.run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            result: row.result,
            error: row.error,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let row = <JobRow as sqlx::FromRow<'_, PgRow>>::from_row(row)
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    Job::try_from(row)
}
