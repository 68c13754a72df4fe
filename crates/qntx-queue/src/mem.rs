//! In-memory [`JobQueue`] fake, used by unit tests and by the scheduler's
//! own test suite (spec §8 scenarios don't all need Postgres).

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use qntx_core::error::{QntxError, QntxResult};
use qntx_core::model::{AsyncJob, AsyncJobStatus};
use tokio::sync::Mutex;

use crate::queue::{apply_complete, apply_progress, JobQueue};

#[derive(Default)]
pub struct InMemoryJobQueue {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, AsyncJob>,
    queued_order: VecDeque<String>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: AsyncJob) -> QntxResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(QntxError::Conflict(format!("job {} already exists", job.id)));
        }
        inner.queued_order.push_back(job.id.clone());
        inner.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn dequeue(&self) -> QntxResult<Option<AsyncJob>> {
        let mut inner = self.inner.lock().await;
        while let Some(id) = inner.queued_order.pop_front() {
            if let Some(job) = inner.jobs.get_mut(&id) {
                if job.status == AsyncJobStatus::Queued {
                    job.status = AsyncJobStatus::Running;
                    job.started_at = Some(chrono::Utc::now());
                    job.updated_at = chrono::Utc::now();
                    return Ok(Some(job.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn update_progress(&self, id: &str, current: i64, total: i64) -> QntxResult<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| QntxError::NotFound(format!("job {id}")))?;
        apply_progress(job, current, total);
        Ok(())
    }

    async fn update_cost(&self, id: &str, actual: f64) -> QntxResult<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| QntxError::NotFound(format!("job {id}")))?;
        job.cost_actual = Some(actual);
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn complete(
        &self,
        id: &str,
        status: AsyncJobStatus,
        error: Option<String>,
        details: Vec<String>,
    ) -> QntxResult<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| QntxError::NotFound(format!("job {id}")))?;
        apply_complete(job, status, error, details)
    }

    async fn requeue_preserving_progress(&self, id: &str) -> QntxResult<()> {
        let mut inner = self.inner.lock().await;
        {
            let job = inner
                .jobs
                .get_mut(id)
                .ok_or_else(|| QntxError::NotFound(format!("job {id}")))?;
            job.status = AsyncJobStatus::Queued;
            job.started_at = None;
            job.updated_at = chrono::Utc::now();
        }
        inner.queued_order.push_back(id.to_string());
        Ok(())
    }

    async fn get(&self, id: &str) -> QntxResult<Option<AsyncJob>> {
        Ok(self.inner.lock().await.jobs.get(id).cloned())
    }

    async fn list_active_jobs(&self, limit: i64) -> QntxResult<Vec<AsyncJob>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_jobs(&self, status: Option<AsyncJobStatus>, limit: i64) -> QntxResult<Vec<AsyncJob>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| status.map(|s| s == j.status).unwrap_or(true))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_tasks_by_parent(&self, parent_id: &str) -> QntxResult<Vec<AsyncJob>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn delete_job_with_children(&self, id: &str) -> QntxResult<()> {
        let mut inner = self.inner.lock().await;
        let children: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| j.parent_id.as_deref() == Some(id))
            .map(|j| j.id.clone())
            .collect();
        for child in children {
            inner.jobs.remove(&child);
        }
        inner.jobs.remove(id);
        inner.queued_order.retain(|qid| qid != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qntx_core::model::AsyncJob;

    fn job(id: &str) -> AsyncJob {
        AsyncJob::new(id.to_string(), "demo".to_string(), vec![], None, None)
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_id() {
        let q = InMemoryJobQueue::new();
        q.enqueue(job("a")).await.unwrap();
        assert!(q.enqueue(job("a")).await.is_err());
    }

    #[tokio::test]
    async fn dequeue_is_fifo() {
        let q = InMemoryJobQueue::new();
        q.enqueue(job("a")).await.unwrap();
        q.enqueue(job("b")).await.unwrap();
        let first = q.dequeue().await.unwrap().unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(first.status, AsyncJobStatus::Running);
    }

    #[tokio::test]
    async fn complete_from_terminal_is_invalid_transition() {
        let q = InMemoryJobQueue::new();
        q.enqueue(job("a")).await.unwrap();
        q.dequeue().await.unwrap();
        q.complete("a", AsyncJobStatus::Completed, None, vec![])
            .await
            .unwrap();
        let err = q
            .complete("a", AsyncJobStatus::Failed, None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, QntxError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn requeue_preserves_progress() {
        let q = InMemoryJobQueue::new();
        q.enqueue(job("a")).await.unwrap();
        q.dequeue().await.unwrap();
        q.update_progress("a", 5, 10).await.unwrap();
        q.requeue_preserving_progress("a").await.unwrap();
        let again = q.dequeue().await.unwrap().unwrap();
        assert_eq!(again.progress.current, 5);
        assert_eq!(again.progress.total, 10);
    }

    #[tokio::test]
    async fn delete_job_with_children_cascades() {
        let q = InMemoryJobQueue::new();
        q.enqueue(job("parent")).await.unwrap();
        let mut child = job("child");
        child.parent_id = Some("parent".into());
        q.enqueue(child).await.unwrap();
        q.delete_job_with_children("parent").await.unwrap();
        assert!(q.get("parent").await.unwrap().is_none());
        assert!(q.get("child").await.unwrap().is_none());
    }
}
