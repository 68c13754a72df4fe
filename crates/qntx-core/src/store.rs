//! Persistent store obligations (spec §4.1, C1).
//!
//! `Store` is the only component that holds durable state; everything else
//! is reconstructable from it. The trait is intentionally narrow — the
//! force-trigger transaction (spec §4.5) and the dispatch transaction (spec
//! §4.5 step 2) both need atomic multi-row writes, so those are modeled as
//! single trait methods rather than composed from smaller CRUD calls,
//! mirroring the teacher's `database::locks` pattern of exposing
//! transaction-shaped operations directly instead of leaking `Transaction`
//! handles across module boundaries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QntxResult;
use crate::model::{
    AsyncJob, Execution, ExecutionStatus, ScheduledJob, ScheduledJobState, TaskLogEntry,
};

/// Everything C1 promises: atomic multi-row inserts, `(HandlerName, State)`
/// lookups for boot reload, and an append-only task log.
#[async_trait]
pub trait Store: Send + Sync {
    // -- scheduled jobs ----------------------------------------------------

    async fn find_scheduled_job_by_handler_and_source(
        &self,
        handler_name: &str,
        source_url: Option<&str>,
        state: ScheduledJobState,
    ) -> QntxResult<Option<ScheduledJob>>;

    async fn get_scheduled_job(&self, id: &str) -> QntxResult<Option<ScheduledJob>>;

    async fn list_scheduled_jobs_by_state(
        &self,
        state: ScheduledJobState,
    ) -> QntxResult<Vec<ScheduledJob>>;

    async fn list_scheduled_jobs(&self, limit: i64) -> QntxResult<Vec<ScheduledJob>>;

    async fn upsert_scheduled_job(&self, job: &ScheduledJob) -> QntxResult<()>;

    async fn update_scheduled_job_state(
        &self,
        id: &str,
        state: ScheduledJobState,
    ) -> QntxResult<()>;

    /// Dispatch-time update (spec §4.5 step 3): advances `next_run_at`,
    /// records the last run, and links the new execution — one row, one
    /// write, no separate read-modify-write race against the ticker.
    async fn advance_scheduled_job(
        &self,
        id: &str,
        next_run_at: DateTime<Utc>,
        last_run_at: DateTime<Utc>,
        last_execution_id: &str,
    ) -> QntxResult<()>;

    // -- executions ----------------------------------------------------------

    async fn get_execution(&self, id: &str) -> QntxResult<Option<Execution>>;

    async fn list_executions_for_schedule(
        &self,
        scheduled_job_id: &str,
        limit: i64,
    ) -> QntxResult<Vec<Execution>>;

    async fn insert_execution(&self, execution: &Execution) -> QntxResult<()>;

    async fn complete_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> QntxResult<()>;

    async fn link_execution_async_job(&self, id: &str, async_job_id: &str) -> QntxResult<()>;

    /// Atomic: creates (or reuses, per the force-trigger dedup contract) a
    /// tracking scheduled job plus a fresh execution row, in one
    /// transaction, *before* the caller is allowed to enqueue the async job
    /// (spec §4.5 "this order is invariant").
    async fn force_trigger_transaction(
        &self,
        handler_name: &str,
        payload: &[u8],
        source_url: Option<&str>,
        async_job_id: &str,
    ) -> QntxResult<(ScheduledJob, Execution)>;

    /// Atomic: dispatch-time enqueue — execution row created strictly
    /// before the async job becomes visible (spec §4.5 step 2, §5 ordering
    /// guarantees).
    async fn dispatch_transaction(
        &self,
        scheduled_job_id: &str,
        async_job_id: &str,
    ) -> QntxResult<Execution>;

    // -- task logs -----------------------------------------------------------

    async fn append_task_log(&self, entry: &TaskLogEntry) -> QntxResult<()>;

    async fn list_task_logs(
        &self,
        job_id: &str,
        stage: Option<&str>,
        task_id: Option<&str>,
    ) -> QntxResult<Vec<TaskLogEntry>>;

    // -- attestations (for the observer bus + sync hash tree) -----------------

    async fn insert_attestation_if_absent(
        &self,
        attestation: &crate::model::Attestation,
    ) -> QntxResult<bool>;

    async fn get_attestation(&self, id: &str) -> QntxResult<Option<crate::model::Attestation>>;

    async fn list_attestations(&self, limit: i64) -> QntxResult<Vec<crate::model::Attestation>>;

    async fn get_async_job_ref(&self, id: &str) -> QntxResult<Option<AsyncJob>>;
}
