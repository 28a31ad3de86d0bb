//! Postgres-backed job store.
//!
//! Every `update_if` is a single guarded `UPDATE ... WHERE ... RETURNING`:
//! the WHERE clause re-asserts the caller's precondition, so the database
//! itself performs the compare-and-swap and a zero-row result means the
//! predicate no longer held. No transaction or row lock is required; each
//! transition is one statement.
//!
//! ## Schema
//!
//! One table keyed by `id`, with `(status, created_at)` indexed for claim
//! scans and `(status, lock_expires_at)` for reaper scans.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use pressforge_core::{JobId, TenantId, WorkerId};

use super::{ClaimFilter, JobPrecondition, JobStore, JobStoreError, JobUpdate};
use crate::types::{Job, JobStatus, QueueStats};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        job_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        locked_by TEXT,
        locked_at TIMESTAMPTZ,
        lock_expires_at TIMESTAMPTZ,
        last_heartbeat_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ,
        result JSONB,
        error TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs (status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_lock_expiry ON jobs (status, lock_expires_at)",
];

const JOB_COLUMNS: &str = r#"
    id, tenant_id, job_type, payload, status, attempts, max_attempts,
    locked_by, locked_at, lock_expires_at, last_heartbeat_at,
    created_at, updated_at, processed_at, result, error
"#;

/// Postgres job store.
///
/// Shared across tasks via the SQLx pool; all mutation goes through guarded
/// single-statement updates so concurrent workers need no coordination
/// beyond the database.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the jobs schema (idempotent).
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let id = job.id;
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, tenant_id, job_type, payload, status, attempts, max_attempts,
                locked_by, locked_at, lock_expires_at, last_heartbeat_at,
                created_at, updated_at, processed_at, result, error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.locked_by.as_ref().map(|w| w.as_str()))
        .bind(job.locked_at)
        .bind(job.lock_expires_at)
        .bind(job.last_heartbeat_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.processed_at)
        .bind(&job.result)
        .bind(&job.error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;

        Ok(id)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        // Fetch by id alone so a cross-tenant read is distinguishable from a
        // miss; the tenant check is an isolation violation, not NotFound.
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let job = decode_job(&row)?;
                if job.tenant_id != tenant_id {
                    return Err(JobStoreError::TenantIsolation);
                }
                Ok(Some(job))
            }
        }
    }

    #[instrument(skip(self, filter), err)]
    async fn select_pending(
        &self,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'pending'
              AND ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::text IS NULL OR job_type = $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#
        ))
        .bind(filter.tenant_id.map(|t| *t.as_uuid()))
        .bind(filter.job_type.as_deref())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_pending", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn select_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'processing' AND lock_expires_at < $1
            ORDER BY lock_expires_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_expired", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self, precondition, update), fields(job_id = %job_id), err)]
    async fn update_if(
        &self,
        job_id: JobId,
        precondition: &JobPrecondition,
        update: &JobUpdate,
    ) -> Result<Option<Job>, JobStoreError> {
        // The tri-state owner check collapses to a flag + nullable value:
        // IS NOT DISTINCT FROM treats NULL = "expected unowned" correctly.
        let check_owner = precondition.locked_by.is_some();
        let expected_owner = precondition
            .locked_by
            .as_ref()
            .and_then(|o| o.as_ref().map(|w| w.as_str().to_string()));

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs SET
                status = COALESCE($6::text, status),
                locked_by = CASE WHEN $7 THEN $8::text ELSE locked_by END,
                locked_at = CASE WHEN $9 THEN $10::timestamptz ELSE locked_at END,
                lock_expires_at = CASE WHEN $11 THEN $12::timestamptz ELSE lock_expires_at END,
                last_heartbeat_at = CASE WHEN $13 THEN $14::timestamptz ELSE last_heartbeat_at END,
                attempts = attempts + CASE WHEN $15 THEN 1 ELSE 0 END,
                processed_at = COALESCE($16::timestamptz, processed_at),
                result = COALESCE($17::jsonb, result),
                error = COALESCE($18::text, error),
                updated_at = now()
            WHERE id = $1
              AND ($2::text IS NULL OR status = $2)
              AND (NOT $3 OR locked_by IS NOT DISTINCT FROM $4::text)
              AND ($5::timestamptz IS NULL
                   OR (lock_expires_at IS NOT NULL AND lock_expires_at < $5))
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(precondition.status.map(|s| s.as_str()))
        .bind(check_owner)
        .bind(expected_owner)
        .bind(precondition.lock_expired_before)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.locked_by.is_some())
        .bind(
            update
                .locked_by
                .as_ref()
                .and_then(|o| o.as_ref().map(|w| w.as_str().to_string())),
        )
        .bind(update.locked_at.is_some())
        .bind(update.locked_at.flatten())
        .bind(update.lock_expires_at.is_some())
        .bind(update.lock_expires_at.flatten())
        .bind(update.last_heartbeat_at.is_some())
        .bind(update.last_heartbeat_at.flatten())
        .bind(update.increment_attempts)
        .bind(update.processed_at)
        .bind(&update.result)
        .bind(update.error.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_if", e))?;

        match row {
            // A zero-row update is the benign race: the predicate no longer
            // held. Distinguish a missing row so callers see real errors.
            None => {
                let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
                    .bind(job_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("update_if", e))?;
                if exists.is_none() {
                    Err(JobStoreError::NotFound(job_id))
                } else {
                    Ok(None)
                }
            }
            Some(row) => Ok(Some(decode_job(&row)?)),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, JobStoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => stats.pending = count,
                Ok(JobStatus::Processing) => stats.processing = count,
                Ok(JobStatus::Completed) => stats.completed = count,
                Ok(JobStatus::Failed) => stats.failed = count,
                Ok(JobStatus::Cancelled) => stats.cancelled = count,
                Err(e) => return Err(JobStoreError::Storage(e.to_string())),
            }
        }
        Ok(stats)
    }
}

// SQLx row decoding

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    lock_expires_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            lock_expires_at: row.try_get("lock_expires_at")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            processed_at: row.try_get("processed_at")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            job_type: row.job_type,
            payload: row.payload,
            status,
            attempts: row.attempts as u32,
            max_attempts: row.max_attempts as u32,
            locked_by: row.locked_by.map(WorkerId::new),
            locked_at: row.locked_at,
            lock_expires_at: row.lock_expires_at,
            last_heartbeat_at: row.last_heartbeat_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
            result: row.result,
            error: row.error,
        })
    }
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?
        .try_into()
}

/// Map SQLx errors onto the store taxonomy.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check if an error is a unique constraint violation (Postgres 23505).
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
