//! SQLite-backed job store.
//!
//! Timestamps are stored as integer microseconds since the epoch so that
//! ordering and cursor comparisons are exact. Status changes are a
//! conditional `UPDATE ... WHERE status = ?`; zero affected rows means the
//! caller lost a race (or the row is gone).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use wallettaser_core::{Job, JobId, JobOptions, JobStatus, TenantId, Transition};

use super::store::{ExpectedState, JobCursor, JobStore, JobStoreError};
use crate::db::{from_micros, to_micros};

const JOB_COLUMNS: &str = r#"
    job_id, tenant_id, status, source_ref, options, attempts, created_at,
    started_at, completed_at, not_before, error_detail, summary,
    manifest_ref, artifact_bytes
"#;

/// Durable job store on a shared SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Wrap an already-migrated pool (see [`crate::db::connect`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| row_to_job(&r)).transpose()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(tenant_id = %job.tenant_id, job_id = %job.id), err)]
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let options = serde_json::to_string(&job.options)
            .map_err(|e| JobStoreError::Storage(format!("encode options: {e}")))?;
        let summary = job
            .summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("encode summary: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, tenant_id, status, source_ref, options, attempts, created_at,
                started_at, completed_at, not_before, error_detail, summary,
                manifest_ref, artifact_bytes
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.tenant_id.as_str())
        .bind(job.status.as_str())
        .bind(&job.source_ref)
        .bind(options)
        .bind(i64::from(job.attempts))
        .bind(to_micros(job.created_at))
        .bind(job.started_at.map(to_micros))
        .bind(job.completed_at.map(to_micros))
        .bind(job.not_before.map(to_micros))
        .bind(&job.error_detail)
        .bind(summary)
        .bind(&job.manifest_ref)
        .bind(job.artifact_bytes as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.fetch(job_id).await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_page(
        &self,
        tenant_id: &TenantId,
        limit: usize,
        cursor: Option<JobCursor>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = match cursor {
            None => {
                sqlx::query(&format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM jobs
                    WHERE tenant_id = ?1
                    ORDER BY created_at DESC, job_id DESC
                    LIMIT ?2
                    "#
                ))
                .bind(tenant_id.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            Some(cursor) => {
                sqlx::query(&format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM jobs
                    WHERE tenant_id = ?1
                      AND (created_at < ?2 OR (created_at = ?2 AND job_id < ?3))
                    ORDER BY created_at DESC, job_id DESC
                    LIMIT ?4
                    "#
                ))
                .bind(tenant_id.as_str())
                .bind(to_micros(cursor.created_at))
                .bind(cursor.job_id.to_string())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self, transition), fields(to = %transition.target()), err)]
    async fn transition(
        &self,
        job_id: JobId,
        expected: ExpectedState,
        transition: &Transition,
    ) -> Result<Job, JobStoreError> {
        let current = self
            .fetch(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;
        if !expected.matches(&current) {
            return Err(JobStoreError::StaleTransition {
                job_id,
                expected: expected.status,
                actual: current.status,
            });
        }

        let next = current
            .apply(expected.status, transition)
            .map_err(|e| JobStoreError::InvalidTransition(e.to_string()))?;
        let summary = next
            .summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("encode summary: {e}")))?;

        // The attempts guard rejects a write that raced a requeue-and-reclaim,
        // whether before the caller's read or between that read and this update.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?1,
                attempts = ?2,
                started_at = ?3,
                completed_at = ?4,
                not_before = ?5,
                error_detail = ?6,
                summary = ?7,
                manifest_ref = ?8,
                artifact_bytes = ?9
            WHERE job_id = ?10 AND status = ?11 AND attempts = ?12
            "#,
        )
        .bind(next.status.as_str())
        .bind(i64::from(next.attempts))
        .bind(next.started_at.map(to_micros))
        .bind(next.completed_at.map(to_micros))
        .bind(next.not_before.map(to_micros))
        .bind(&next.error_detail)
        .bind(summary)
        .bind(&next.manifest_ref)
        .bind(next.artifact_bytes as i64)
        .bind(job_id.to_string())
        .bind(expected.status.as_str())
        .bind(i64::from(current.attempts))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_job", e))?;

        if result.rows_affected() == 0 {
            return match self.fetch(job_id).await? {
                Some(actual) => Err(JobStoreError::StaleTransition {
                    job_id,
                    expected: expected.status,
                    actual: actual.status,
                }),
                None => Err(JobStoreError::NotFound(job_id)),
            };
        }

        Ok(next)
    }

    async fn list_ready_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'PENDING' AND (not_before IS NULL OR not_before <= ?1)
            ORDER BY created_at ASC, job_id ASC
            LIMIT ?2
            "#
        ))
        .bind(to_micros(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_ready_pending", e))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn list_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'PROCESSING' AND started_at < ?1
            ORDER BY started_at ASC, job_id ASC
            LIMIT ?2
            "#
        ))
        .bind(to_micros(started_before))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stale_processing", e))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_by_status(
        &self,
        tenant_id: &TenantId,
        status: JobStatus,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE tenant_id = ?1 AND status = ?2
            ORDER BY completed_at ASC, job_id ASC
            "#
        ))
        .bind(tenant_id.as_str())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn delete(&self, tenant_id: &TenantId, job_id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE tenant_id = ?1 AND job_id = ?2")
            .bind(tenant_id.as_str())
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let corrupt = |what: &str| JobStoreError::Storage(format!("corrupt job row: {what}"));
    let get_err = |e: sqlx::Error| map_sqlx_error("decode_job", e);

    let id: String = row.try_get("job_id").map_err(get_err)?;
    let tenant: String = row.try_get("tenant_id").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let options: String = row.try_get("options").map_err(get_err)?;
    let attempts: i64 = row.try_get("attempts").map_err(get_err)?;
    let created_at: i64 = row.try_get("created_at").map_err(get_err)?;
    let started_at: Option<i64> = row.try_get("started_at").map_err(get_err)?;
    let completed_at: Option<i64> = row.try_get("completed_at").map_err(get_err)?;
    let not_before: Option<i64> = row.try_get("not_before").map_err(get_err)?;
    let summary: Option<String> = row.try_get("summary").map_err(get_err)?;
    let artifact_bytes: i64 = row.try_get("artifact_bytes").map_err(get_err)?;

    let timestamp = |micros: i64| from_micros(micros).ok_or_else(|| corrupt("timestamp"));
    let optional_timestamp = |micros: Option<i64>| micros.map(timestamp).transpose();

    Ok(Job {
        id: id.parse().map_err(|_| corrupt("job_id"))?,
        tenant_id: TenantId::parse(&tenant).map_err(|_| corrupt("tenant_id"))?,
        status: status.parse().map_err(|_| corrupt("status"))?,
        source_ref: row.try_get("source_ref").map_err(get_err)?,
        options: serde_json::from_str::<JobOptions>(&options).map_err(|_| corrupt("options"))?,
        attempts: u32::try_from(attempts).map_err(|_| corrupt("attempts"))?,
        created_at: timestamp(created_at)?,
        started_at: optional_timestamp(started_at)?,
        completed_at: optional_timestamp(completed_at)?,
        not_before: optional_timestamp(not_before)?,
        error_detail: row.try_get("error_detail").map_err(get_err)?,
        summary: summary
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|_| corrupt("summary"))?,
        manifest_ref: row.try_get("manifest_ref").map_err(get_err)?,
        artifact_bytes: u64::try_from(artifact_bytes).map_err(|_| corrupt("artifact_bytes"))?,
    })
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check if an error is a primary key / unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
