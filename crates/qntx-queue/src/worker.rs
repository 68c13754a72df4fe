//! Fixed-size worker pool (spec §4.3, C3).
//!
//! Each worker dequeues one job, resolves its handler via the registry,
//! runs it under a cancellable child token, and translates the outcome
//! into `queue.complete(...)`. Drain gives running jobs
//! `worker_stop_timeout` (default 20s) to checkpoint and finish on their
//! own; anything still running past that is requeued with its last
//! `Progress` preserved rather than killed mid-write, since the job may
//! hold no transactional state to roll back (spec §4.3, §8 scenario 4).

use std::sync::Arc;
use std::time::Duration;

use qntx_core::error::QntxResult;
use qntx_core::model::AsyncJob;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::handler::HandlerRegistry;
use crate::queue::JobQueue;

/// Handed to a [`crate::handler::Handler`] so it can report progress and
/// read the job it was invoked for without touching the queue directly.
pub struct JobHandle {
    pub job: AsyncJob,
    queue: Arc<dyn JobQueue>,
}

impl JobHandle {
    pub async fn checkpoint(&mut self, current: i64, total: i64) -> QntxResult<()> {
        self.queue.update_progress(&self.job.id, current, total).await?;
        self.job.progress.current = current;
        self.job.progress.total = total;
        Ok(())
    }

    pub async fn report_cost(&mut self, actual: f64) -> QntxResult<()> {
        self.queue.update_cost(&self.job.id, actual).await?;
        self.job.cost_actual = Some(actual);
        Ok(())
    }
}

struct WorkerSlot {
    handle: JoinHandle<()>,
    current_job: Arc<Mutex<Option<String>>>,
}

pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    root_cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawns `size` worker tasks. `root_cancel` should be a child of the
    /// process-wide root token (spec §4.9 "a single root context descended
    /// by each subsystem").
    pub fn spawn(
        size: usize,
        queue: Arc<dyn JobQueue>,
        registry: Arc<HandlerRegistry>,
        root_cancel: CancellationToken,
    ) -> Self {
        let mut slots = Vec::with_capacity(size);
        for worker_id in 0..size {
            let queue = queue.clone();
            let registry = registry.clone();
            let cancel = root_cancel.child_token();
            let current_job = Arc::new(Mutex::new(None));
            let current_job_for_task = current_job.clone();
            let handle = tokio::spawn(worker_loop(worker_id, queue, registry, cancel, current_job_for_task));
            slots.push(WorkerSlot { handle, current_job });
        }
        Self { slots, root_cancel }
    }

    /// Stops the pool (spec §4.3 drain / §4.9 step 2). Workers get
    /// `stop_timeout` to finish their current job; anything still running
    /// past that has its job requeued and its task aborted.
    pub async fn stop(self, stop_timeout: Duration, queue: &dyn JobQueue) {
        self.root_cancel.cancel();
        let deadline = tokio::time::Instant::now() + stop_timeout;

        for slot in self.slots {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, slot.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "worker task panicked during drain"),
                Err(_) => {
                    // Didn't finish in time; whatever job it held gets requeued.
                    if let Some(job_id) = slot.current_job.lock().await.clone() {
                        warn!(job_id, "worker did not stop in time, requeuing its job");
                        if let Err(e) = queue.requeue_preserving_progress(&job_id).await {
                            warn!(job_id, error = %e, "failed to requeue job after forced worker exit");
                        }
                    }
                }
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    registry: Arc<HandlerRegistry>,
    cancel: CancellationToken,
    current_job: Arc<Mutex<Option<String>>>,
) {
    let idle_backoff = Duration::from_millis(250);
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let job = tokio::select! {
            _ = cancel.cancelled() => return,
            result = queue.dequeue() => result,
        };

        let job = match job {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(idle_backoff) => continue,
                }
            }
            Err(e) => {
                warn!(worker_id, error = %e, "dequeue failed");
                tokio::time::sleep(idle_backoff).await;
                continue;
            }
        };

        *current_job.lock().await = Some(job.id.clone());
        run_one(worker_id, &queue, &registry, &cancel, job).await;
        *current_job.lock().await = None;
    }
}

async fn run_one(
    worker_id: usize,
    queue: &Arc<dyn JobQueue>,
    registry: &Arc<HandlerRegistry>,
    cancel: &CancellationToken,
    job: AsyncJob,
) {
    let job_id = job.id.clone();
    let handler_name = job.handler_name.clone();

    let handler = match registry.get(&handler_name).await {
        Ok(h) => h,
        Err(e) => {
            warn!(worker_id, job_id, handler_name, error = %e, "handler unavailable");
            let _ = queue
                .complete(
                    &job_id,
                    qntx_core::model::AsyncJobStatus::Failed,
                    Some(e.to_string()),
                    vec!["handler resolution".to_string()],
                )
                .await;
            return;
        }
    };

    let mut handle = JobHandle {
        job,
        queue: queue.clone(),
    };
    let child_cancel = cancel.child_token();

    let outcome = handler.execute(child_cancel, &mut handle).await;

    match outcome {
        Ok(()) => {
            info!(worker_id, job_id, handler_name, "job completed");
            let _ = queue
                .complete(&job_id, qntx_core::model::AsyncJobStatus::Completed, None, vec![])
                .await;
        }
        Err(e) => {
            warn!(worker_id, job_id, handler_name, error = %e, "job failed");
            let details: Vec<String> = e.chain().skip(1).map(|c| c.to_string()).collect();
            let _ = queue
                .complete(&job_id, qntx_core::model::AsyncJobStatus::Failed, Some(e.to_string()), details)
                .await;
        }
    }
}
