//! Pulse scheduler (spec §4.5, C5).
//!
//! Decides *when* work enters C2 — never executes it. The tick loop is
//! single-threaded by construction (one `Scheduler::run` task owns
//! `NextRunAt`/`LastRunAt` mutation, spec §5), polling at a coarse ~1s
//! interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use qntx_core::error::{QntxError, QntxResult};
use qntx_core::model::{AsyncJob, ScheduledJob, ScheduledJobState};
use qntx_core::store::Store;
use qntx_queue::{HandlerRegistry, JobQueue};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ats::AtsParserRegistry;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Scheduler {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<HandlerRegistry>,
    ats: AtsParserRegistry,
}

/// Request to create (or idempotently reconcile) a scheduled job.
pub struct ScheduleRequest {
    pub handler_name: String,
    pub payload: Vec<u8>,
    pub source_url: Option<String>,
    pub interval_seconds: i64,
    pub created_from_doc: Option<String>,
    pub metadata: Option<String>,
    /// Bypasses the `(HandlerName, SourceURL)` active-job dedup (spec §3
    /// invariant "except when created with the force flag").
    pub force: bool,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<HandlerRegistry>,
        ats: AtsParserRegistry,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            ats,
        }
    }

    pub fn ats_registry(&self) -> &AtsParserRegistry {
        &self.ats
    }

    /// Idempotent boot reload (spec §4.5): scans active scheduled jobs and
    /// re-asserts them. Since the ticker re-reads `State = active` from the
    /// store every tick, reload's real job is just logging the restored
    /// count — schedules are already durable rows, never re-created here.
    pub async fn boot_reload(&self) -> QntxResult<usize> {
        let active = self.store.list_scheduled_jobs_by_state(ScheduledJobState::Active).await?;
        info!(count = active.len(), "pulse scheduler boot reload");
        Ok(active.len())
    }

    /// Creates a new scheduled job, or — if an active job already exists
    /// for the same `(handler_name, source_url)` and `force` is not set —
    /// reconciles only its `interval_seconds` and returns it unchanged
    /// otherwise (spec §4.5 "this is the contract that preserves identity
    /// across restarts").
    pub async fn create_schedule(&self, req: ScheduleRequest) -> QntxResult<ScheduledJob> {
        if !self.registry.has(&req.handler_name).await {
            return Err(QntxError::HandlerUnavailable(req.handler_name.clone()));
        }

        if !req.force {
            if let Some(existing) = self
                .store
                .find_scheduled_job_by_handler_and_source(
                    &req.handler_name,
                    req.source_url.as_deref(),
                    ScheduledJobState::Active,
                )
                .await?
            {
                if existing.interval_seconds != req.interval_seconds {
                    let mut reconciled = existing.clone();
                    reconciled.interval_seconds = req.interval_seconds;
                    reconciled.updated_at = Utc::now();
                    self.store.upsert_scheduled_job(&reconciled).await?;
                    return Ok(reconciled);
                }
                return Ok(existing);
            }
        }

        let now = Utc::now();
        let job = ScheduledJob {
            id: ScheduledJob::derive_id(&req.handler_name, req.source_url.as_deref()),
            handler_name: req.handler_name,
            payload: req.payload,
            source_url: req.source_url,
            interval_seconds: req.interval_seconds,
            next_run_at: now,
            last_run_at: None,
            last_execution_id: None,
            state: ScheduledJobState::Active,
            created_from_doc: req.created_from_doc,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_scheduled_job(&job).await?;
        Ok(job)
    }

    pub async fn pause(&self, id: &str) -> QntxResult<()> {
        self.store.update_scheduled_job_state(id, ScheduledJobState::Paused).await
    }

    pub async fn resume(&self, id: &str) -> QntxResult<()> {
        self.store.update_scheduled_job_state(id, ScheduledJobState::Active).await
    }

    pub async fn stop(&self, id: &str) -> QntxResult<()> {
        self.store.update_scheduled_job_state(id, ScheduledJobState::Stopping).await
    }

    pub async fn delete(&self, id: &str) -> QntxResult<()> {
        // Soft delete only — execution history must survive (spec §3).
        self.store.update_scheduled_job_state(id, ScheduledJobState::Deleted).await
    }

    /// Force-trigger path (spec §4.5): parses ATS code, checks handler
    /// availability, creates tracking records in one transaction, and only
    /// after commit enqueues the async job. The ordering is invariant —
    /// reversing it would let a worker complete a job before its execution
    /// row exists.
    pub async fn force_trigger(&self, ats_code: &str) -> QntxResult<(ScheduledJob, AsyncJob)> {
        let parsed = self.ats.parse(ats_code)?;

        if !self.registry.has(&parsed.handler_name).await {
            return Err(QntxError::HandlerUnavailable(parsed.handler_name));
        }

        let async_job_id = Uuid::new_v4().to_string();
        let (job, _execution) = self
            .store
            .force_trigger_transaction(
                &parsed.handler_name,
                &parsed.payload,
                parsed.source_url.as_deref(),
                &async_job_id,
            )
            .await?;

        let async_job = AsyncJob::new(
            async_job_id,
            parsed.handler_name,
            parsed.payload,
            parsed.source_url,
            None,
        );
        self.queue.enqueue(async_job.clone()).await?;

        Ok((job, async_job))
    }

    /// One dispatch tick (spec §4.5 algorithm, steps 1-4).
    pub async fn tick(&self) -> QntxResult<usize> {
        let due = self
            .store
            .list_scheduled_jobs_by_state(ScheduledJobState::Active)
            .await?;
        let mut dispatched = 0usize;

        for job in due {
            if job.next_run_at > Utc::now() {
                continue;
            }
            if let Err(e) = self.dispatch_one(&job).await {
                warn!(job_id = %job.id, error = %e, "dispatch failed");
                continue;
            }
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn dispatch_one(&self, job: &ScheduledJob) -> QntxResult<()> {
        let async_job_id = Uuid::new_v4().to_string();

        // Execution row created strictly before the async job becomes
        // visible (spec §5 ordering guarantee).
        let execution = self.store.dispatch_transaction(&job.id, &async_job_id).await?;

        let async_job = AsyncJob::new(
            async_job_id.clone(),
            job.handler_name.clone(),
            job.payload.clone(),
            job.source_url.clone(),
            None,
        );
        self.queue.enqueue(async_job).await?;

        let now: DateTime<Utc> = Utc::now();
        let next_run_at = now + chrono::Duration::seconds(job.interval_seconds.max(0));
        self.store
            .advance_scheduled_job(&job.id, next_run_at, now, &execution.id)
            .await?;

        if job.is_one_shot() {
            self.store.update_scheduled_job_state(&job.id, ScheduledJobState::Inactive).await?;
        }

        info!(job_id = %job.id, execution_id = %execution.id, async_job_id = %async_job_id, "dispatched");
        Ok(())
    }

    /// The ticker loop (spec §4.5: "single-threaded ticker, coarse tick ~1s").
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("pulse scheduler stopping");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ats::{AtsParser, ParsedAts};
    use async_trait::async_trait;
    use qntx_queue::handler::Handler;
    use qntx_queue::mem::InMemoryJobQueue;
    use qntx_queue::worker::JobHandle;
    use std::sync::Mutex as StdMutex;

    struct DemoHandler;
    #[async_trait]
    impl Handler for DemoHandler {
        fn name(&self) -> &str {
            "demo"
        }
        async fn execute(&self, _cancel: CancellationToken, _job: &mut JobHandle) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct DemoAtsParser;
    impl AtsParser for DemoAtsParser {
        fn parse(&self, tokens: &[String]) -> Result<ParsedAts, crate::ats::AtsError> {
            Ok(ParsedAts {
                handler_name: tokens[0].clone(),
                payload: tokens.get(1..).unwrap_or(&[]).join(" ").into_bytes(),
                source_url: None,
            })
        }
    }

    /// Minimal in-memory `Store` fake — enough for the scheduler tests below
    /// without standing up Postgres.
    #[derive(Default)]
    struct FakeStore {
        jobs: StdMutex<std::collections::HashMap<String, ScheduledJob>>,
        executions: StdMutex<std::collections::HashMap<String, qntx_core::model::Execution>>,
    }

    #[async_trait::async_trait]
    impl Store for FakeStore {
        async fn find_scheduled_job_by_handler_and_source(
            &self,
            handler_name: &str,
            source_url: Option<&str>,
            state: ScheduledJobState,
        ) -> QntxResult<Option<ScheduledJob>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .find(|j| j.handler_name == handler_name && j.source_url.as_deref() == source_url && j.state == state)
                .cloned())
        }

        async fn get_scheduled_job(&self, id: &str) -> QntxResult<Option<ScheduledJob>> {
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn list_scheduled_jobs_by_state(&self, state: ScheduledJobState) -> QntxResult<Vec<ScheduledJob>> {
            Ok(self.jobs.lock().unwrap().values().filter(|j| j.state == state).cloned().collect())
        }

        async fn list_scheduled_jobs(&self, _limit: i64) -> QntxResult<Vec<ScheduledJob>> {
            Ok(self.jobs.lock().unwrap().values().cloned().collect())
        }

        async fn upsert_scheduled_job(&self, job: &ScheduledJob) -> QntxResult<()> {
            self.jobs.lock().unwrap().insert(job.id.clone(), job.clone());
            Ok(())
        }

        async fn update_scheduled_job_state(&self, id: &str, state: ScheduledJobState) -> QntxResult<()> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(id).ok_or_else(|| QntxError::NotFound(id.to_string()))?;
            job.state = state;
            Ok(())
        }

        async fn advance_scheduled_job(
            &self,
            id: &str,
            next_run_at: DateTime<Utc>,
            last_run_at: DateTime<Utc>,
            last_execution_id: &str,
        ) -> QntxResult<()> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(id).ok_or_else(|| QntxError::NotFound(id.to_string()))?;
            job.next_run_at = next_run_at;
            job.last_run_at = Some(last_run_at);
            job.last_execution_id = Some(last_execution_id.to_string());
            Ok(())
        }

        async fn get_execution(&self, id: &str) -> QntxResult<Option<qntx_core::model::Execution>> {
            Ok(self.executions.lock().unwrap().get(id).cloned())
        }

        async fn list_executions_for_schedule(&self, scheduled_job_id: &str, _limit: i64) -> QntxResult<Vec<qntx_core::model::Execution>> {
            Ok(self
                .executions
                .lock()
                .unwrap()
                .values()
                .filter(|e| e.scheduled_job_id == scheduled_job_id)
                .cloned()
                .collect())
        }

        async fn insert_execution(&self, execution: &qntx_core::model::Execution) -> QntxResult<()> {
            self.executions.lock().unwrap().insert(execution.id.clone(), execution.clone());
            Ok(())
        }

        async fn complete_execution(
            &self,
            id: &str,
            status: qntx_core::model::ExecutionStatus,
            duration_ms: i64,
            error_message: Option<&str>,
        ) -> QntxResult<()> {
            let mut execs = self.executions.lock().unwrap();
            let e = execs.get_mut(id).ok_or_else(|| QntxError::NotFound(id.to_string()))?;
            e.status = status;
            e.duration_ms = Some(duration_ms);
            e.error_message = error_message.map(str::to_string);
            Ok(())
        }

        async fn link_execution_async_job(&self, id: &str, async_job_id: &str) -> QntxResult<()> {
            let mut execs = self.executions.lock().unwrap();
            let e = execs.get_mut(id).ok_or_else(|| QntxError::NotFound(id.to_string()))?;
            e.async_job_id = Some(async_job_id.to_string());
            Ok(())
        }

        async fn force_trigger_transaction(
            &self,
            handler_name: &str,
            payload: &[u8],
            source_url: Option<&str>,
            async_job_id: &str,
        ) -> QntxResult<(ScheduledJob, qntx_core::model::Execution)> {
            let mut jobs = self.jobs.lock().unwrap();
            let existing = jobs
                .values()
                .find(|j| {
                    j.handler_name == handler_name
                        && j.source_url.as_deref() == source_url
                        && j.created_from_doc.as_deref() == Some(qntx_core::model::FORCE_TRIGGER_DOC)
                })
                .cloned();

            let job = existing.unwrap_or_else(|| {
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
                    created_from_doc: Some(qntx_core::model::FORCE_TRIGGER_DOC.to_string()),
                    metadata: None,
                    created_at: now,
                    updated_at: now,
                };
                jobs.insert(job.id.clone(), job.clone());
                job
            });
            drop(jobs);

            let now = Utc::now();
            let execution = qntx_core::model::Execution {
                id: Uuid::new_v4().to_string(),
                scheduled_job_id: job.id.clone(),
                async_job_id: Some(async_job_id.to_string()),
                status: qntx_core::model::ExecutionStatus::Running,
                started_at: now,
                duration_ms: None,
                error_message: None,
                logs: None,
                created_at: now,
                updated_at: now,
            };
            self.executions.lock().unwrap().insert(execution.id.clone(), execution.clone());
            Ok((job, execution))
        }

        async fn dispatch_transaction(&self, scheduled_job_id: &str, async_job_id: &str) -> QntxResult<qntx_core::model::Execution> {
            let now = Utc::now();
            let execution = qntx_core::model::Execution {
                id: Uuid::new_v4().to_string(),
                scheduled_job_id: scheduled_job_id.to_string(),
                async_job_id: Some(async_job_id.to_string()),
                status: qntx_core::model::ExecutionStatus::Running,
                started_at: now,
                duration_ms: None,
                error_message: None,
                logs: None,
                created_at: now,
                updated_at: now,
            };
            self.executions.lock().unwrap().insert(execution.id.clone(), execution.clone());
            Ok(execution)
        }

        async fn append_task_log(&self, _entry: &qntx_core::model::TaskLogEntry) -> QntxResult<()> {
            Ok(())
        }

        async fn list_task_logs(&self, _job_id: &str, _stage: Option<&str>, _task_id: Option<&str>) -> QntxResult<Vec<qntx_core::model::TaskLogEntry>> {
            Ok(vec![])
        }

        async fn insert_attestation_if_absent(&self, _attestation: &qntx_core::model::Attestation) -> QntxResult<bool> {
            Ok(true)
        }

        async fn get_attestation(&self, _id: &str) -> QntxResult<Option<qntx_core::model::Attestation>> {
            Ok(None)
        }

        async fn list_attestations(&self, _limit: i64) -> QntxResult<Vec<qntx_core::model::Attestation>> {
            Ok(vec![])
        }

        async fn get_async_job_ref(&self, _id: &str) -> QntxResult<Option<AsyncJob>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn create_schedule_requires_handler() {
        let store = Arc::new(FakeStore::default());
        let queue = Arc::new(InMemoryJobQueue::new());
        let registry = Arc::new(HandlerRegistry::new());
        let mut ats = AtsParserRegistry::new();
        ats.register("demo", Box::new(DemoAtsParser));
        let sched = Scheduler::new(store, queue, registry, ats);

        let err = sched
            .create_schedule(ScheduleRequest {
                handler_name: "demo".into(),
                payload: vec![],
                source_url: None,
                interval_seconds: 60,
                created_from_doc: None,
                metadata: None,
                force: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QntxError::HandlerUnavailable(_)));
    }

    #[tokio::test]
    async fn boot_reload_does_not_duplicate() {
        let store = Arc::new(FakeStore::default());
        let queue = Arc::new(InMemoryJobQueue::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Arc::new(DemoHandler)).await;
        let mut ats = AtsParserRegistry::new();
        ats.register("demo", Box::new(DemoAtsParser));
        let sched = Scheduler::new(store.clone(), queue.clone(), registry, ats);

        let first = sched
            .create_schedule(ScheduleRequest {
                handler_name: "demo".into(),
                payload: b"x".to_vec(),
                source_url: Some("src".into()),
                interval_seconds: 60,
                created_from_doc: None,
                metadata: None,
                force: false,
            })
            .await
            .unwrap();

        let second = sched
            .create_schedule(ScheduleRequest {
                handler_name: "demo".into(),
                payload: b"x".to_vec(),
                source_url: Some("src".into()),
                interval_seconds: 60,
                created_from_doc: None,
                metadata: None,
                force: false,
            })
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn force_trigger_reuses_tracking_job() {
        let store = Arc::new(FakeStore::default());
        let queue = Arc::new(InMemoryJobQueue::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Arc::new(DemoHandler)).await;
        let mut ats = AtsParserRegistry::new();
        ats.register("demo", Box::new(DemoAtsParser));
        let sched = Scheduler::new(store.clone(), queue.clone(), registry, ats);

        for _ in 0..3 {
            sched.force_trigger("demo z").await.unwrap();
        }

        let tracking_jobs: Vec<_> = store
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.created_from_doc.as_deref() == Some(qntx_core::model::FORCE_TRIGGER_DOC))
            .cloned()
            .collect();
        assert_eq!(tracking_jobs.len(), 1);
        assert_eq!(store.executions.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn tick_dispatches_due_jobs_and_advances_next_run() {
        let store = Arc::new(FakeStore::default());
        let queue = Arc::new(InMemoryJobQueue::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Arc::new(DemoHandler)).await;
        let mut ats = AtsParserRegistry::new();
        ats.register("demo", Box::new(DemoAtsParser));
        let sched = Scheduler::new(store.clone(), queue.clone(), registry, ats);

        sched
            .create_schedule(ScheduleRequest {
                handler_name: "demo".into(),
                payload: vec![],
                source_url: None,
                interval_seconds: 60,
                created_from_doc: None,
                metadata: None,
                force: false,
            })
            .await
            .unwrap();

        let dispatched = sched.tick().await.unwrap();
        assert_eq!(dispatched, 1);

        let jobs = store.jobs.lock().unwrap();
        let job = jobs.values().next().unwrap();
        assert!(job.last_run_at.is_some());
        assert!(job.next_run_at > job.last_run_at.unwrap());
    }

    #[tokio::test]
    async fn one_shot_job_goes_inactive_after_dispatch() {
        let store = Arc::new(FakeStore::default());
        let queue = Arc::new(InMemoryJobQueue::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Arc::new(DemoHandler)).await;
        let mut ats = AtsParserRegistry::new();
        ats.register("demo", Box::new(DemoAtsParser));
        let sched = Scheduler::new(store.clone(), queue.clone(), registry, ats);

        sched
            .create_schedule(ScheduleRequest {
                handler_name: "demo".into(),
                payload: vec![],
                source_url: None,
                interval_seconds: 0,
                created_from_doc: None,
                metadata: None,
                force: false,
            })
            .await
            .unwrap();

        sched.tick().await.unwrap();
        let jobs = store.jobs.lock().unwrap();
        let job = jobs.values().next().unwrap();
        assert_eq!(job.state, ScheduledJobState::Inactive);
    }
}
