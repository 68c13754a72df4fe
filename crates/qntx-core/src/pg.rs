//! Postgres-backed [`Store`] (spec §4.1, C1).
//!
//! Mirrors the teacher's repository style (`database::crud_service`,
//! `database::cbu_repository`): a thin wrapper around `PgPool`, runtime
//! `sqlx::query`/`query_as` (not compile-time-checked macros, so the crate
//! builds without a live `DATABASE_URL`), `FromRow` row structs translated
//! into the public model types at the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};

use crate::error::{QntxError, QntxResult};
use crate::model::{
    AsyncJob, Attestation, Execution, ExecutionStatus, ScheduledJob, ScheduledJobState,
    TaskLogEntry,
};
use crate::store::Store;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs pending migrations (spec §2a persistence wiring).
    pub async fn migrate(&self) -> QntxResult<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| QntxError::ServiceUnavailable(format!("migration failed: {e}")))
    }
}

fn state_to_str(state: ScheduledJobState) -> &'static str {
    match state {
        ScheduledJobState::Active => "active",
        ScheduledJobState::Paused => "paused",
        ScheduledJobState::Stopping => "stopping",
        ScheduledJobState::Inactive => "inactive",
        ScheduledJobState::Deleted => "deleted",
    }
}

fn str_to_state(s: &str) -> QntxResult<ScheduledJobState> {
    Ok(match s {
        "active" => ScheduledJobState::Active,
        "paused" => ScheduledJobState::Paused,
        "stopping" => ScheduledJobState::Stopping,
        "inactive" => ScheduledJobState::Inactive,
        "deleted" => ScheduledJobState::Deleted,
        other => {
            return Err(QntxError::InvalidRequest(format!(
                "unknown scheduled_job state {other}"
            )))
        }
    })
}

#[derive(FromRow)]
struct ScheduledJobRow {
    id: String,
    handler_name: String,
    payload: Vec<u8>,
    source_url: Option<String>,
    interval_seconds: i64,
    next_run_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    last_execution_id: Option<String>,
    state: String,
    created_from_doc: Option<String>,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ScheduledJobRow {
    fn into_model(self) -> QntxResult<ScheduledJob> {
        Ok(ScheduledJob {
            id: self.id,
            handler_name: self.handler_name,
            payload: self.payload,
            source_url: self.source_url,
            interval_seconds: self.interval_seconds,
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
            last_execution_id: self.last_execution_id,
            state: str_to_state(&self.state)?,
            created_from_doc: self.created_from_doc,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ExecutionRow {
    id: String,
    scheduled_job_id: String,
    async_job_id: Option<String>,
    status: String,
    started_at: DateTime<Utc>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    logs: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn exec_status_to_str(s: ExecutionStatus) -> &'static str {
    match s {
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
    }
}

fn str_to_exec_status(s: &str) -> QntxResult<ExecutionStatus> {
    Ok(match s {
        "running" => ExecutionStatus::Running,
        "completed" => ExecutionStatus::Completed,
        "failed" => ExecutionStatus::Failed,
        other => {
            return Err(QntxError::InvalidRequest(format!(
                "unknown execution status {other}"
            )))
        }
    })
}

impl ExecutionRow {
    fn into_model(self) -> QntxResult<Execution> {
        Ok(Execution {
            id: self.id,
            scheduled_job_id: self.scheduled_job_id,
            async_job_id: self.async_job_id,
            status: str_to_exec_status(&self.status)?,
            started_at: self.started_at,
            duration_ms: self.duration_ms,
            error_message: self.error_message,
            logs: self.logs,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_scheduled_job_by_handler_and_source(
        &self,
        handler_name: &str,
        source_url: Option<&str>,
        state: ScheduledJobState,
    ) -> QntxResult<Option<ScheduledJob>> {
        let row = sqlx::query_as::<_, ScheduledJobRow>(
            "SELECT * FROM scheduled_jobs WHERE handler_name = $1 AND source_url IS NOT DISTINCT FROM $2 AND state = $3",
        )
        .bind(handler_name)
        .bind(source_url)
        .bind(state_to_str(state))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        row.map(ScheduledJobRow::into_model).transpose()
    }

    async fn get_scheduled_job(&self, id: &str) -> QntxResult<Option<ScheduledJob>> {
        let row = sqlx::query_as::<_, ScheduledJobRow>("SELECT * FROM scheduled_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        row.map(ScheduledJobRow::into_model).transpose()
    }

    async fn list_scheduled_jobs_by_state(
        &self,
        state: ScheduledJobState,
    ) -> QntxResult<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduledJobRow>(
            "SELECT * FROM scheduled_jobs WHERE state = $1 AND next_run_at <= now() ORDER BY next_run_at ASC",
        )
        .bind(state_to_str(state))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        rows.into_iter().map(ScheduledJobRow::into_model).collect()
    }

    async fn list_scheduled_jobs(&self, limit: i64) -> QntxResult<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduledJobRow>(
            "SELECT * FROM scheduled_jobs WHERE state != 'deleted' ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        rows.into_iter().map(ScheduledJobRow::into_model).collect()
    }

    async fn upsert_scheduled_job(&self, job: &ScheduledJob) -> QntxResult<()> {
        sqlx::query(
            "INSERT INTO scheduled_jobs
             (id, handler_name, payload, source_url, interval_seconds, next_run_at, last_run_at,
              last_execution_id, state, created_from_doc, metadata, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
             ON CONFLICT (id) DO UPDATE SET
               interval_seconds = EXCLUDED.interval_seconds,
               next_run_at = EXCLUDED.next_run_at,
               state = EXCLUDED.state,
               metadata = EXCLUDED.metadata,
               updated_at = EXCLUDED.updated_at",
        )
        .bind(&job.id)
        .bind(&job.handler_name)
        .bind(&job.payload)
        .bind(&job.source_url)
        .bind(job.interval_seconds)
        .bind(job.next_run_at)
        .bind(job.last_run_at)
        .bind(&job.last_execution_id)
        .bind(state_to_str(job.state))
        .bind(&job.created_from_doc)
        .bind(&job.metadata)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn update_scheduled_job_state(
        &self,
        id: &str,
        state: ScheduledJobState,
    ) -> QntxResult<()> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET state = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(state_to_str(state))
        .execute(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(QntxError::NotFound(format!("scheduled job {id}")));
        }
        Ok(())
    }

    async fn advance_scheduled_job(
        &self,
        id: &str,
        next_run_at: DateTime<Utc>,
        last_run_at: DateTime<Utc>,
        last_execution_id: &str,
    ) -> QntxResult<()> {
        sqlx::query(
            "UPDATE scheduled_jobs SET next_run_at = $2, last_run_at = $3, last_execution_id = $4, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(next_run_at)
        .bind(last_run_at)
        .bind(last_execution_id)
        .execute(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> QntxResult<Option<Execution>> {
        let row = sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        row.map(ExecutionRow::into_model).transpose()
    }

    async fn list_executions_for_schedule(
        &self,
        scheduled_job_id: &str,
        limit: i64,
    ) -> QntxResult<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE scheduled_job_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(scheduled_job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        rows.into_iter().map(ExecutionRow::into_model).collect()
    }

    async fn insert_execution(&self, execution: &Execution) -> QntxResult<()> {
        sqlx::query(
            "INSERT INTO executions
             (id, scheduled_job_id, async_job_id, status, started_at, duration_ms, error_message, logs, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(&execution.id)
        .bind(&execution.scheduled_job_id)
        .bind(&execution.async_job_id)
        .bind(exec_status_to_str(execution.status))
        .bind(execution.started_at)
        .bind(execution.duration_ms)
        .bind(&execution.error_message)
        .bind(&execution.logs)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn complete_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> QntxResult<()> {
        sqlx::query(
            "UPDATE executions SET status = $2, duration_ms = $3, error_message = $4, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(exec_status_to_str(status))
        .bind(duration_ms)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn link_execution_async_job(&self, id: &str, async_job_id: &str) -> QntxResult<()> {
        sqlx::query("UPDATE executions SET async_job_id = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(async_job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn force_trigger_transaction(
        &self,
        handler_name: &str,
        payload: &[u8],
        source_url: Option<&str>,
        async_job_id: &str,
    ) -> QntxResult<(ScheduledJob, Execution)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        // Find-or-create the tracking scheduled job (inactive, never dispatched
        // by the ticker) keyed by handler + source — this is what makes three
        // rapid force triggers share one tracking row (spec §8 round-trip law).
        let existing = sqlx::query_as::<_, ScheduledJobRow>(
            "SELECT * FROM scheduled_jobs WHERE handler_name = $1 AND source_url IS NOT DISTINCT FROM $2
             AND created_from_doc = $3 FOR UPDATE",
        )
        .bind(handler_name)
        .bind(source_url)
        .bind(crate::model::FORCE_TRIGGER_DOC)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        let job = if let Some(row) = existing {
            row.into_model()?
        } else {
            let now = Utc::now();
            let job = ScheduledJob {
                id: ScheduledJob::derive_id(handler_name, source_url),
                handler_name: handler_name.to_string(),
                payload: payload.to_vec(),
                source_url: source_url.map(str::to_string),
                interval_seconds: 0,
                next_run_at: now,
                last_run_at: None,
                last_execution_id: None,
                state: ScheduledJobState::Inactive,
                created_from_doc: Some(crate::model::FORCE_TRIGGER_DOC.to_string()),
                metadata: None,
                created_at: now,
                updated_at: now,
            };
            sqlx::query(
                "INSERT INTO scheduled_jobs
                 (id, handler_name, payload, source_url, interval_seconds, next_run_at, last_run_at,
                  last_execution_id, state, created_from_doc, metadata, created_at, updated_at)
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
            )
            .bind(&job.id)
            .bind(&job.handler_name)
            .bind(&job.payload)
            .bind(&job.source_url)
            .bind(job.interval_seconds)
            .bind(job.next_run_at)
            .bind(job.last_run_at)
            .bind(&job.last_execution_id)
            .bind(state_to_str(job.state))
            .bind(&job.created_from_doc)
            .bind(&job.metadata)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
            job
        };

        let now = Utc::now();
        let execution = Execution {
            id: uuid::Uuid::new_v4().to_string(),
            scheduled_job_id: job.id.clone(),
            async_job_id: Some(async_job_id.to_string()),
            status: ExecutionStatus::Running,
            started_at: now,
            duration_ms: None,
            error_message: None,
            logs: None,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO executions
             (id, scheduled_job_id, async_job_id, status, started_at, duration_ms, error_message, logs, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(&execution.id)
        .bind(&execution.scheduled_job_id)
        .bind(&execution.async_job_id)
        .bind(exec_status_to_str(execution.status))
        .bind(execution.started_at)
        .bind(execution.duration_ms)
        .bind(&execution.error_message)
        .bind(&execution.logs)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        Ok((job, execution))
    }

    async fn dispatch_transaction(
        &self,
        scheduled_job_id: &str,
        async_job_id: &str,
    ) -> QntxResult<Execution> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        let now = Utc::now();
        let execution = Execution {
            id: uuid::Uuid::new_v4().to_string(),
            scheduled_job_id: scheduled_job_id.to_string(),
            async_job_id: Some(async_job_id.to_string()),
            status: ExecutionStatus::Running,
            started_at: now,
            duration_ms: None,
            error_message: None,
            logs: None,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO executions
             (id, scheduled_job_id, async_job_id, status, started_at, duration_ms, error_message, logs, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(&execution.id)
        .bind(&execution.scheduled_job_id)
        .bind(&execution.async_job_id)
        .bind(exec_status_to_str(execution.status))
        .bind(execution.started_at)
        .bind(execution.duration_ms)
        .bind(&execution.error_message)
        .bind(&execution.logs)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(execution)
    }

    async fn append_task_log(&self, entry: &TaskLogEntry) -> QntxResult<()> {
        sqlx::query(
            "INSERT INTO task_logs (job_id, stage, task_id, timestamp, level, message, metadata)
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(&entry.job_id)
        .bind(&entry.stage)
        .bind(&entry.task_id)
        .bind(entry.timestamp)
        .bind(&entry.level)
        .bind(&entry.message)
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_task_logs(
        &self,
        job_id: &str,
        stage: Option<&str>,
        task_id: Option<&str>,
    ) -> QntxResult<Vec<TaskLogEntry>> {
        let rows = sqlx::query(
            "SELECT job_id, stage, task_id, timestamp, level, message, metadata FROM task_logs
             WHERE job_id = $1 AND stage IS NOT DISTINCT FROM $2 AND task_id IS NOT DISTINCT FROM $3
             ORDER BY timestamp ASC",
        )
        .bind(job_id)
        .bind(stage)
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;

        rows.into_iter()
            .map(|r| {
                Ok(TaskLogEntry {
                    job_id: r.try_get("job_id").map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?,
                    stage: r.try_get("stage").map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?,
                    task_id: r.try_get("task_id").map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?,
                    timestamp: r.try_get("timestamp").map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?,
                    level: r.try_get("level").map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?,
                    message: r.try_get("message").map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?,
                    metadata: r.try_get("metadata").map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn insert_attestation_if_absent(&self, attestation: &Attestation) -> QntxResult<bool> {
        let result = sqlx::query(
            "INSERT INTO attestations (id, subjects, predicates, contexts, actors, timestamp, source, attributes)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&attestation.id)
        .bind(serde_json::to_value(&attestation.subjects).unwrap())
        .bind(serde_json::to_value(&attestation.predicates).unwrap())
        .bind(serde_json::to_value(&attestation.contexts).unwrap())
        .bind(serde_json::to_value(&attestation.actors).unwrap())
        .bind(attestation.timestamp)
        .bind(&attestation.source)
        .bind(serde_json::to_value(&attestation.attributes).unwrap())
        .execute(&self.pool)
        .await
        .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_attestation(&self, id: &str) -> QntxResult<Option<Attestation>> {
        let row = sqlx::query("SELECT * FROM attestations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        row.map(row_to_attestation).transpose()
    }

    async fn list_attestations(&self, limit: i64) -> QntxResult<Vec<Attestation>> {
        let rows = sqlx::query("SELECT * FROM attestations ORDER BY timestamp DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QntxError::ServiceUnavailable(e.to_string()))?;
        rows.into_iter().map(row_to_attestation).collect()
    }

    async fn get_async_job_ref(&self, _id: &str) -> QntxResult<Option<AsyncJob>> {
        // Async jobs live in C2's own store (qntx-queue); C1 has no row for
        // them beyond what the execution's `async_job_id` foreign key
        // references. Kept here only to satisfy the trait's read surface for
        // collaborators that hold a `Store` handle without a queue handle.
        Ok(None)
    }
}

fn row_to_attestation(row: sqlx::postgres::PgRow) -> QntxResult<Attestation> {
    let map_err = |e: sqlx::Error| QntxError::ServiceUnavailable(e.to_string());
    let subjects: serde_json::Value = row.try_get("subjects").map_err(map_err)?;
    let predicates: serde_json::Value = row.try_get("predicates").map_err(map_err)?;
    let contexts: serde_json::Value = row.try_get("contexts").map_err(map_err)?;
    let actors: serde_json::Value = row.try_get("actors").map_err(map_err)?;
    let attributes: serde_json::Value = row.try_get("attributes").map_err(map_err)?;
    Ok(Attestation {
        id: row.try_get("id").map_err(map_err)?,
        subjects: serde_json::from_value(subjects).unwrap_or_default(),
        predicates: serde_json::from_value(predicates).unwrap_or_default(),
        contexts: serde_json::from_value(contexts).unwrap_or_default(),
        actors: serde_json::from_value(actors).unwrap_or_default(),
        timestamp: row.try_get("timestamp").map_err(map_err)?,
        source: row.try_get("source").map_err(map_err)?,
        attributes: serde_json::from_value(attributes).unwrap_or_default(),
    })
}
