//! Async job queue (spec §4.2, C2).
//!
//! `JobQueue` is deliberately small and durable-store-shaped: every mutating
//! method either succeeds atomically or leaves the row untouched. Contended
//! `UpdateProgress`/`UpdateCost` calls may lose a write under concurrency —
//! that's spec-sanctioned (last-writer-wins, spec §4.2 "Concurrency").

use async_trait::async_trait;
use chrono::Utc;
use qntx_core::error::{QntxError, QntxResult};
use qntx_core::model::{AsyncJob, AsyncJobStatus, Progress};

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: AsyncJob) -> QntxResult<()>;

    /// Returns the oldest `queued` job, atomically transitioned to
    /// `running`, or `None` if the queue is empty or the call was
    /// cancelled mid-wait.
    async fn dequeue(&self) -> QntxResult<Option<AsyncJob>>;

    async fn update_progress(&self, id: &str, current: i64, total: i64) -> QntxResult<()>;

    async fn update_cost(&self, id: &str, actual: f64) -> QntxResult<()>;

    /// Transitions a running job to a terminal status. Fails with
    /// `InvalidTransition` if the job is already terminal (spec §4.2,
    /// §8 "terminal statuses are sinks").
    async fn complete(
        &self,
        id: &str,
        status: AsyncJobStatus,
        error: Option<String>,
        details: Vec<String>,
    ) -> QntxResult<()>;

    /// Requeues a running job back to `queued`, preserving `progress`
    /// (spec §4.3 drain: "re-marked queued with Progress preserved").
    async fn requeue_preserving_progress(&self, id: &str) -> QntxResult<()>;

    async fn get(&self, id: &str) -> QntxResult<Option<AsyncJob>>;

    async fn list_active_jobs(&self, limit: i64) -> QntxResult<Vec<AsyncJob>>;

    async fn list_jobs(&self, status: Option<AsyncJobStatus>, limit: i64) -> QntxResult<Vec<AsyncJob>>;

    async fn list_tasks_by_parent(&self, parent_id: &str) -> QntxResult<Vec<AsyncJob>>;

    async fn delete_job_with_children(&self, id: &str) -> QntxResult<()>;
}

/// Applies the progress update to an in-memory job, used by both the
/// in-memory fake and as the canonical "what counts as an update" reference
/// the Postgres implementation's SQL mirrors.
pub(crate) fn apply_progress(job: &mut AsyncJob, current: i64, total: i64) {
    job.progress = Progress { current, total };
    job.updated_at = Utc::now();
}

pub(crate) fn apply_complete(
    job: &mut AsyncJob,
    status: AsyncJobStatus,
    error: Option<String>,
    details: Vec<String>,
) -> QntxResult<()> {
    if job.status.is_terminal() {
        return Err(QntxError::InvalidTransition(format!(
            "job {} is already {:?}",
            job.id, job.status
        )));
    }
    job.status = status;
    job.error = error;
    job.error_details = details;
    job.completed_at = Some(Utc::now());
    job.updated_at = Utc::now();
    Ok(())
}
