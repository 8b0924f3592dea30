//! SQLite job repository implementation.
//!
//! The jobs table keeps queue fields as real columns so claim ordering
//! (priority DESC, available_at ASC, seq ASC) runs in SQL. The writer pool
//! holds a single connection, so the select-then-guarded-update claim is
//! atomic for this process; concurrency control is process-local by design.

use chrono::{DateTime, Utc};
use gantry_core::repository::job::JobRepository;
use gantry_types::error::RepositoryError;
use gantry_types::job::{Job, JobPayload, JobStatus};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::workflow::{format_datetime, parse_datetime, status_to_str};

/// SQLite-backed implementation of `JobRepository`.
pub struct SqliteJobRepository {
    pool: DatabasePool,
}

impl SqliteJobRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn decode_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job, RepositoryError> {
    let read_err = |e: sqlx::Error| RepositoryError::Query(e.to_string());

    let id: String = row.try_get("id").map_err(read_err)?;
    let workflow_id: String = row.try_get("workflow_id").map_err(read_err)?;
    let instance_id: String = row.try_get("instance_id").map_err(read_err)?;
    let node_id: String = row.try_get("node_id").map_err(read_err)?;
    let attempt: i64 = row.try_get("attempt").map_err(read_err)?;
    let status: String = row.try_get("status").map_err(read_err)?;
    let priority: i64 = row.try_get("priority").map_err(read_err)?;
    let reason: Option<String> = row.try_get("reason").map_err(read_err)?;
    let created_at: String = row.try_get("created_at").map_err(read_err)?;
    let available_at: String = row.try_get("available_at").map_err(read_err)?;
    let seq: i64 = row.try_get("seq").map_err(read_err)?;

    let status: JobStatus = serde_json::from_value(serde_json::Value::String(status.clone()))
        .map_err(|_| RepositoryError::Query(format!("invalid job status: {status}")))?;

    Ok(Job {
        id: parse_uuid(&id)?,
        payload: JobPayload {
            workflow_id: parse_uuid(&workflow_id)?,
            instance_id: parse_uuid(&instance_id)?,
            node_id,
            attempt: attempt as u32,
        },
        status,
        priority,
        reason,
        created_at: parse_datetime(&created_at)?,
        available_at: parse_datetime(&available_at)?,
        seq: seq as u64,
    })
}

const JOB_COLUMNS: &str =
    "seq, id, workflow_id, instance_id, node_id, attempt, status, priority, reason, created_at, available_at";

// ---------------------------------------------------------------------------
// JobRepository impl
// ---------------------------------------------------------------------------

impl JobRepository for SqliteJobRepository {
    async fn insert_job(&self, job: &Job) -> Result<Job, RepositoryError> {
        sqlx::query(
            r#"INSERT INTO jobs
                 (id, workflow_id, instance_id, node_id, attempt, status, priority, reason, created_at, available_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(job.payload.workflow_id.to_string())
        .bind(job.payload.instance_id.to_string())
        .bind(job.payload.node_id.as_str())
        .bind(job.payload.attempt as i64)
        .bind(status_to_str(&job.status)?)
        .bind(job.priority)
        .bind(&job.reason)
        .bind(format_datetime(&job.created_at))
        .bind(format_datetime(&job.available_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(job.id.to_string())
            .fetch_one(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        decode_job(&row)
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        row.as_ref().map(decode_job).transpose()
    }

    async fn update_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE jobs
               SET attempt = ?, status = ?, priority = ?, reason = ?, available_at = ?
               WHERE id = ?"#,
        )
        .bind(job.payload.attempt as i64)
        .bind(status_to_str(&job.status)?)
        .bind(job.priority)
        .bind(&job.reason)
        .bind(format_datetime(&job.available_at))
        .bind(job.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn claim_next(
        &self,
        instance: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let instance = instance.map(|id| id.to_string());
        let now = format_datetime(&now);

        // Single-connection writer pool: select-then-guarded-update is
        // atomic within this process.
        let row = sqlx::query(&format!(
            r#"SELECT {JOB_COLUMNS} FROM jobs
               WHERE status IN ('waiting', 'delayed')
                 AND available_at <= ?
                 AND (? IS NULL OR instance_id = ?)
               ORDER BY priority DESC, available_at ASC, seq ASC
               LIMIT 1"#
        ))
        .bind(&now)
        .bind(&instance)
        .bind(&instance)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = decode_job(&row)?;

        let result = sqlx::query(
            "UPDATE jobs SET status = 'active' WHERE id = ? AND status IN ('waiting', 'delayed')",
        )
        .bind(job.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            // Lost a race with another writer; the next poll retries.
            return Ok(None);
        }
        job.status = JobStatus::Active;
        Ok(Some(job))
    }

    async fn list_jobs(
        &self,
        status: JobStatus,
        instance: Option<Uuid>,
    ) -> Result<Vec<Job>, RepositoryError> {
        let instance = instance.map(|id| id.to_string());
        let rows = sqlx::query(&format!(
            r#"SELECT {JOB_COLUMNS} FROM jobs
               WHERE status = ?
                 AND (? IS NULL OR instance_id = ?)
               ORDER BY seq ASC"#
        ))
        .bind(status_to_str(&status)?)
        .bind(&instance)
        .bind(&instance)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(decode_job).collect()
    }

    async fn delete_jobs_for_instance(&self, instance_id: &Uuid) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM jobs WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn delete_jobs_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND created_at < ?",
        )
        .bind(format_datetime(&cutoff))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
