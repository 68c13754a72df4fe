//! Lifecycle controller (spec §4.9, C9).
//!
//! One root [`CancellationToken`] descended by every subsystem; drain is a
//! strictly ordered, one-way sequence (`Running` → `Draining` → `Stopped`),
//! mirroring the teacher's `bpmn_integration/event_bridge.rs` shutdown
//! sequencing but generalized to the full C2-C8 collaborator set.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qntx_queue::{JobQueue, WorkerPool};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Default, Serialize)]
pub struct DrainReport {
    pub worker_pool_forced: bool,
    pub websocket_clients_closed: u64,
    pub forced_exit: bool,
}

/// Tracks the one-way `Running -> Draining -> Stopped` transition with a
/// plain atomic; no transition back is ever offered (spec §4.9 invariant).
pub struct Lifecycle {
    state: AtomicU8,
    pub root_cancel: CancellationToken,
    shutdown_timeout: Duration,
    worker_stop_timeout: Duration,
}

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const STOPPED: u8 = 2;

impl Lifecycle {
    pub fn new(shutdown_timeout: Duration, worker_stop_timeout: Duration) -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
            root_cancel: CancellationToken::new(),
            shutdown_timeout,
            worker_stop_timeout,
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => LifecycleState::Running,
            DRAINING => LifecycleState::Draining,
            _ => LifecycleState::Stopped,
        }
    }

    /// Runs the drain sequence (spec §4.9 steps 1-8). Idempotent: a second
    /// call while already draining or stopped is a no-op. `background_tasks`
    /// are the scheduler/sync-ticker/config-watcher loops descended from
    /// the root token; they're given the remaining shutdown budget to
    /// observe cancellation and return on their own.
    pub async fn drain(
        &self,
        worker_pool: WorkerPool,
        queue: Arc<dyn JobQueue>,
        close_websockets: impl std::future::Future<Output = u64>,
        background_tasks: Vec<tokio::task::JoinHandle<()>>,
    ) -> DrainReport {
        if self
            .state
            .compare_exchange(RUNNING, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("drain already in progress or complete");
            return DrainReport::default();
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        let mut report = DrainReport::default();

        info!("drain: stopping worker pool");
        let pool_deadline = self.worker_stop_timeout.min(deadline.saturating_duration_since(Instant::now()));
        worker_pool.stop(pool_deadline, queue.as_ref()).await;

        info!("drain: closing websocket connections");
        report.websocket_clients_closed = close_websockets.await;

        info!("drain: cancelling root context");
        self.root_cancel.cancel();

        info!("drain: waiting for background tasks to stop");
        let remaining = deadline.saturating_duration_since(Instant::now());
        let joined = tokio::time::timeout(remaining, futures::future::join_all(background_tasks)).await;
        if joined.is_err() {
            warn!("drain: shutdown_timeout elapsed before all background tasks stopped, forcing exit");
            report.forced_exit = true;
        }

        self.state.store(STOPPED, Ordering::Release);
        info!("drain: complete");
        report
    }
}
