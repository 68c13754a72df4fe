//! Postgres-backed [`JobQueue`] (spec §4.2).
//!
//! `dequeue` uses `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent workers
//! never grab the same row — the "single writer per job" guarantee from
//! spec §4.2 falls out of the lock, not out of application-level
//! coordination.

use async_trait::async_trait;
use chrono::Utc;
use qntx_core::error::{QntxError, QntxResult};
use qntx_core::model::{AsyncJob, AsyncJobStatus, Progress};
use sqlx::{FromRow, PgPool};

use crate::queue::JobQueue;

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_to_str(s: AsyncJobStatus) -> &'static str {
    match s {
        AsyncJobStatus::Queued => "queued",
        AsyncJobStatus::Running => "running",
        AsyncJobStatus::Paused => "paused",
        AsyncJobStatus::Completed => "completed",
        AsyncJobStatus::Failed => "failed",
        AsyncJobStatus::Cancelled => "cancelled",
    }
}

fn str_to_status(s: &str) -> QntxResult<AsyncJobStatus> {
    Ok(match s {
        "queued" => AsyncJobStatus::Queued,
        "running" => AsyncJobStatus::Running,
        "paused" => AsyncJobStatus::Paused,
        "completed" => AsyncJobStatus::Completed,
        "failed" => AsyncJobStatus::Failed,
        "cancelled" => AsyncJobStatus::Cancelled,
        other => return Err(QntxError::InvalidRequest(format!("unknown async job status {other}"))),
    })
}

#[derive(FromRow)]
struct JobRow {
    id: String,
    handler_name: String,
    payload: Vec<u8>,
    source: Option<String>,
    parent_id: Option<String>,
    status: String,
    progress_current: i64,
    progress_total: i64,
    cost_estimate: Option<f64>,
    cost_actual: Option<f64>,
    error: Option<String>,
    error_details: serde_json::Value,
    started_at: Option<chrono::DateTime<Utc>>,
    completed_at: Option<chrono::DateTime<Utc>>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl JobRow {
    fn into_model(self) -> QntxResult<AsyncJob> {
        Ok(AsyncJob {
            id: self.id,
            handler_name: self.handler_name,
            payload: self.payload,
            source: self.source,
            parent_id: self.parent_id,
            status: str_to_status(&self.status)?,
            progress: Progress {
                current: self.progress_current,
                total: self.progress_total,
            },
            cost_estimate: self.cost_estimate,
            cost_actual: self.cost_actual,
            error: self.error,
            error_details: serde_json::from_value(self.error_details).unwrap_or_default(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: AsyncJob) -> QntxResult<()> {
        let result = sqlx::query(
            "INSERT INTO async_jobs
             (id, handler_name, payload, source, parent_id, status, progress_current, progress_total,
              cost_estimate, cost_actual, error, error_details, started_at, completed_at, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&job.id)
        .bind(&job.handler_name)
        .bind(&job.payload)
        .bind(&job.source)
        .bind(&job.parent_id)
        .bind(status_to_str(job.status))
        .bind(job.progress.current)
        .bind(job.progress.total)
        .bind(job.cost_estimate)
        .bind(job.cost_actual)
        .bind(&job.error)
        .bind(serde_json::to_value(&job.error_details).unwrap())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QntxError::Conflict(format!("job {} already exists", job.id)));
        }
        Ok(())
    }

    async fn dequeue(&self) -> QntxResult<Option<AsyncJob>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM async_jobs WHERE status = 'queued'
             ORDER BY created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        let Some(row) = row else {
            tx.commit().await.ok();
            return Ok(None);
        };

        sqlx::query(
            "UPDATE async_jobs SET status = 'running', started_at = now(), updated_at = now() WHERE id = $1",
        )
        .bind(&row.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        let mut job = row.into_model()?;
        job.status = AsyncJobStatus::Running;
        Ok(Some(job))
    }

    async fn update_progress(&self, id: &str, current: i64, total: i64) -> QntxResult<()> {
        sqlx::query(
            "UPDATE async_jobs SET progress_current = $2, progress_total = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(current)
        .bind(total)
        .execute(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn update_cost(&self, id: &str, actual: f64) -> QntxResult<()> {
        sqlx::query("UPDATE async_jobs SET cost_actual = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(actual)
            .execute(&self.pool)
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn complete(
        &self,
        id: &str,
        status: AsyncJobStatus,
        error: Option<String>,
        details: Vec<String>,
    ) -> QntxResult<()> {
        let result = sqlx::query(
            "UPDATE async_jobs SET status = $2, error = $3, error_details = $4, completed_at = now(), updated_at = now()
             WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(id)
        .bind(status_to_str(status))
        .bind(&error)
        .bind(serde_json::to_value(&details).unwrap())
        .execute(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QntxError::InvalidTransition(format!(
                "job {id} is already terminal or missing"
            )));
        }
        Ok(())
    }

    async fn requeue_preserving_progress(&self, id: &str) -> QntxResult<()> {
        sqlx::query(
            "UPDATE async_jobs SET status = 'queued', started_at = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> QntxResult<Option<AsyncJob>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM async_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        row.map(JobRow::into_model).transpose()
    }

    async fn list_active_jobs(&self, limit: i64) -> QntxResult<Vec<AsyncJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM async_jobs WHERE status NOT IN ('completed', 'failed', 'cancelled')
             ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        rows.into_iter().map(JobRow::into_model).collect()
    }

    async fn list_jobs(&self, status: Option<AsyncJobStatus>, limit: i64) -> QntxResult<Vec<AsyncJob>> {
        let rows = if let Some(status) = status {
            sqlx::query_as::<_, JobRow>(
                "SELECT * FROM async_jobs WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
            )
            .bind(status_to_str(status))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, JobRow>("SELECT * FROM async_jobs ORDER BY created_at DESC LIMIT $1")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        }
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        rows.into_iter().map(JobRow::into_model).collect()
    }

    async fn list_tasks_by_parent(&self, parent_id: &str) -> QntxResult<Vec<AsyncJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM async_jobs WHERE parent_id = $1 ORDER BY created_at ASC",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        rows.into_iter().map(JobRow::into_model).collect()
    }

    async fn delete_job_with_children(&self, id: &str) -> QntxResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        sqlx::query("DELETE FROM async_jobs WHERE parent_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        sqlx::query("DELETE FROM async_jobs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }
}
