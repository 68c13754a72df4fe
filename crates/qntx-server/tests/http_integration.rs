//! HTTP-level integration tests over [`qntx_server::build_router`].
//!
//! Runs entirely against in-memory fakes (no Postgres, no real peer
//! sockets) so the full routing + state-extraction + error-mapping stack is
//! exercised without a database, mirroring the request/response style of
//! the teacher's `sem_os_server` HTTP integration tests but dropping their
//! `--ignored`/real-DB requirement since nothing here needs one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use hyper::{Request, StatusCode};
use qntx_broadcast::BroadcastHub;
use qntx_core::config::AppConfig;
use qntx_core::error::{QntxError, QntxResult};
use qntx_core::model::{
    Attestation, AsyncJob, Execution, ExecutionStatus, ScheduledJob, ScheduledJobState, TaskLogEntry,
};
use qntx_core::store::Store;
use qntx_observer::AttestationBus;
use qntx_pulse::{AtsParserRegistry, Scheduler};
use qntx_queue::mem::InMemoryJobQueue;
use qntx_queue::HandlerRegistry;
use qntx_server::state::{AppState, BuildInfo};
use qntx_sync::{PeerSession, PeerTransport, SyncTicker};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

/// Minimal in-memory [`Store`] fake, grounded on the `FakeStore` shapes
/// already used by the pulse/sync unit test suites — attestations and
/// scheduled jobs only, enough for the routes under test here.
#[derive(Default)]
struct FakeStore {
    attestations: AsyncMutex<HashMap<String, Attestation>>,
    jobs: AsyncMutex<HashMap<String, ScheduledJob>>,
    executions: AsyncMutex<HashMap<String, Execution>>,
}

#[async_trait]
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
            .await
            .values()
            .find(|j| j.handler_name == handler_name && j.source_url.as_deref() == source_url && j.state == state)
            .cloned())
    }

    async fn get_scheduled_job(&self, id: &str) -> QntxResult<Option<ScheduledJob>> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn list_scheduled_jobs_by_state(&self, state: ScheduledJobState) -> QntxResult<Vec<ScheduledJob>> {
        Ok(self.jobs.lock().await.values().filter(|j| j.state == state).cloned().collect())
    }

    async fn list_scheduled_jobs(&self, _limit: i64) -> QntxResult<Vec<ScheduledJob>> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }

    async fn upsert_scheduled_job(&self, job: &ScheduledJob) -> QntxResult<()> {
        self.jobs.lock().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_scheduled_job_state(&self, id: &str, state: ScheduledJobState) -> QntxResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(id).ok_or_else(|| QntxError::NotFound(id.to_string()))?;
        job.state = state;
        Ok(())
    }

    async fn advance_scheduled_job(
        &self,
        _id: &str,
        _next_run_at: DateTime<Utc>,
        _last_run_at: DateTime<Utc>,
        _last_execution_id: &str,
    ) -> QntxResult<()> {
        unimplemented!("not exercised by these tests")
    }

    async fn get_execution(&self, id: &str) -> QntxResult<Option<Execution>> {
        Ok(self.executions.lock().await.get(id).cloned())
    }

    async fn list_executions_for_schedule(&self, scheduled_job_id: &str, _limit: i64) -> QntxResult<Vec<Execution>> {
        Ok(self
            .executions
            .lock()
            .await
            .values()
            .filter(|e| e.scheduled_job_id == scheduled_job_id)
            .cloned()
            .collect())
    }

    async fn insert_execution(&self, execution: &Execution) -> QntxResult<()> {
        self.executions.lock().await.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn complete_execution(
        &self,
        _id: &str,
        _status: ExecutionStatus,
        _duration_ms: i64,
        _error_message: Option<&str>,
    ) -> QntxResult<()> {
        unimplemented!("not exercised by these tests")
    }

    async fn link_execution_async_job(&self, _id: &str, _async_job_id: &str) -> QntxResult<()> {
        unimplemented!("not exercised by these tests")
    }

    async fn force_trigger_transaction(
        &self,
        handler_name: &str,
        payload: &[u8],
        source_url: Option<&str>,
        async_job_id: &str,
    ) -> QntxResult<(ScheduledJob, Execution)> {
        let mut jobs = self.jobs.lock().await;
        let existing = jobs
            .values()
            .find(|j| {
                j.handler_name == handler_name
                    && j.source_url.as_deref() == source_url
                    && j.created_from_doc.as_deref() == Some(qntx_core::model::FORCE_TRIGGER_DOC)
            })
            .cloned();

        let job = match existing {
            Some(j) => j,
            None => {
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
            }
        };
        drop(jobs);

        let now = Utc::now();
        let execution = Execution {
            id: Uuid::new_v4().to_string(),
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
        self.executions.lock().await.insert(execution.id.clone(), execution.clone());
        Ok((job, execution))
    }

    async fn dispatch_transaction(&self, _scheduled_job_id: &str, _async_job_id: &str) -> QntxResult<Execution> {
        unimplemented!("not exercised by these tests")
    }

    async fn append_task_log(&self, _entry: &TaskLogEntry) -> QntxResult<()> {
        Ok(())
    }

    async fn list_task_logs(&self, _job_id: &str, _stage: Option<&str>, _task_id: Option<&str>) -> QntxResult<Vec<TaskLogEntry>> {
        Ok(Vec::new())
    }

    async fn insert_attestation_if_absent(&self, attestation: &Attestation) -> QntxResult<bool> {
        let mut map = self.attestations.lock().await;
        if map.contains_key(&attestation.id) {
            Ok(false)
        } else {
            map.insert(attestation.id.clone(), attestation.clone());
            Ok(true)
        }
    }

    async fn get_attestation(&self, id: &str) -> QntxResult<Option<Attestation>> {
        Ok(self.attestations.lock().await.get(id).cloned())
    }

    async fn list_attestations(&self, _limit: i64) -> QntxResult<Vec<Attestation>> {
        Ok(self.attestations.lock().await.values().cloned().collect())
    }

    async fn get_async_job_ref(&self, _id: &str) -> QntxResult<Option<AsyncJob>> {
        Ok(None)
    }
}

/// No peers are configured in these tests, so the transport is never
/// actually dialed; it only needs to type-check as a [`PeerTransport`].
struct UnreachableTransport;

#[async_trait]
impl PeerTransport for UnreachableTransport {
    async fn connect(&self, _peer_url: &str) -> anyhow::Result<Box<dyn PeerSession>> {
        anyhow::bail!("no peers configured in this test app")
    }
}

struct DemoHandler;

#[async_trait]
impl qntx_queue::Handler for DemoHandler {
    fn name(&self) -> &str {
        "demo"
    }

    async fn execute(&self, _cancel: CancellationToken, _job: &mut qntx_queue::JobHandle) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Generic ATS parser: first token is the handler name, the rest is the
/// payload — the same shape as the `"demo"` parser the teacher's own
/// pulse scheduler tests use, registered here under two commands so tests
/// can exercise both a registered handler (`demo`) and an ATS code that
/// parses fine but names a handler nothing registered (`ghost`).
struct GenericAtsParser;

impl qntx_pulse::AtsParser for GenericAtsParser {
    fn parse(&self, tokens: &[String]) -> Result<qntx_pulse::ParsedAts, qntx_pulse::AtsError> {
        Ok(qntx_pulse::ParsedAts {
            handler_name: tokens[0].clone(),
            payload: tokens.get(1..).unwrap_or(&[]).join(" ").into_bytes(),
            source_url: None,
        })
    }
}

async fn test_app() -> axum::Router {
    let store: Arc<dyn Store> = Arc::new(FakeStore::default());
    let queue: Arc<dyn qntx_queue::JobQueue> = Arc::new(InMemoryJobQueue::new());
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(Arc::new(DemoHandler)).await;
    let mut ats = AtsParserRegistry::new();
    ats.register("demo", Box::new(GenericAtsParser));
    ats.register("ghost", Box::new(GenericAtsParser));
    let scheduler = Arc::new(Scheduler::new(store.clone(), queue.clone(), registry.clone(), ats));
    let attestations = Arc::new(AttestationBus::new(store.clone(), Vec::new()));
    let broadcast = BroadcastHub::spawn(CancellationToken::new());
    let (sync_ticker, peer_snapshot) = SyncTicker::new(
        store.clone(),
        broadcast.clone(),
        Arc::new(UnreachableTransport),
        queue.clone(),
        Vec::new(),
        3000,
        std::time::Duration::from_secs(60),
        1000.0,
    );

    let config = AppConfig {
        database_url: "postgresql:///qntx_test".into(),
        server_port: 3000,
        worker_pool_size: 1,
        sync_interval_secs: 60,
        shutdown_timeout_secs: 10,
        worker_stop_timeout_secs: 5,
        peers: HashMap::new(),
        budget_limit: 1000.0,
    };

    let (_filter_layer, tracing_filter): (_, qntx_server::state::FilterHandle) =
        tracing_subscriber::reload::Layer::new(tracing_subscriber::EnvFilter::new("info"));

    let state = AppState {
        store,
        queue,
        registry,
        scheduler,
        attestations,
        broadcast,
        sync_ticker: Arc::new(sync_ticker),
        peer_snapshot,
        config: Arc::new(RwLock::new(config)),
        build_info: BuildInfo::default(),
        tracing_filter,
    };

    qntx_server::build_router(state)
}

fn attestation(id: &str) -> Attestation {
    Attestation {
        id: id.to_string(),
        subjects: vec!["urn:test:subject".into()],
        predicates: vec!["did".into()],
        contexts: vec![],
        actors: vec![],
        timestamp: Utc::now(),
        source: "integration-test".into(),
        attributes: HashMap::new(),
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["clients"], 0);
    assert_eq!(body["verbosity"], "info");
}

#[tokio::test]
async fn attestation_ingest_is_idempotent() {
    let app = test_app().await;
    let payload = serde_json::to_vec(&attestation("a1")).unwrap();

    let first = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/attestations")
                .header("content-type", "application/json")
                .body(Body::from(payload.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_json(first).await;
    assert_eq!(first_body["status"], "created");

    let second = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/attestations")
                .header("content-type", "application/json")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_json(second).await;
    assert_eq!(second_body["status"], "exists");
}

#[tokio::test]
async fn attestation_with_no_subjects_is_rejected() {
    let app = test_app().await;
    let mut bad = attestation("a2");
    bad.subjects.clear();
    let payload = serde_json::to_vec(&bad).unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/attestations")
                .header("content-type", "application/json")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn config_get_then_patch_round_trips() {
    let app = test_app().await;

    let get_response = app
        .clone()
        .oneshot(Request::builder().uri("/api/config").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);
    let config = body_json(get_response).await;
    assert_eq!(config["worker_pool_size"], 1);

    let patch = serde_json::json!({ "key": "worker_pool_size", "value": "8" });
    let patch_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/api/config")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&patch).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(patch_response.status(), StatusCode::OK);
    let patched = body_json(patch_response).await;
    assert_eq!(patched["worker_pool_size"], 8);

    let get_again = app
        .oneshot(Request::builder().uri("/api/config").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let config_again = body_json(get_again).await;
    assert_eq!(config_again["worker_pool_size"], 8);
}

#[tokio::test]
async fn creating_a_schedule_for_an_unregistered_handler_is_rejected() {
    let app = test_app().await;
    // "ghost" parses fine (a parser is registered for it) but names a
    // handler nothing in the registry answers to.
    let body = serde_json::json!({
        "ats_code": "ghost mystery",
        "interval_seconds": 30,
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/pulse/schedules")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn schedule_and_run_creates_an_active_job_from_ats_code() {
    let app = test_app().await;
    let body = serde_json::json!({ "ats_code": "demo x y", "interval_seconds": 60 });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/pulse/schedules")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job = body_json(response).await;
    assert_eq!(job["handler_name"], "demo");
    assert_eq!(job["state"], "active");
    assert_eq!(job["interval_seconds"], 60);
}

#[tokio::test]
async fn force_trigger_dedup_collapses_to_one_tracking_job() {
    let app = test_app().await;
    let body = serde_json::json!({ "ats_code": "demo z", "interval_seconds": 0, "force": true });

    let mut job_ids = std::collections::HashSet::new();
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/pulse/schedules")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job = body_json(response).await;
        assert_eq!(job["state"], "inactive");
        assert_eq!(job["created_from_doc"], "__force_trigger__");
        job_ids.insert(job["id"].as_str().unwrap().to_string());
    }
    assert_eq!(job_ids.len(), 1, "all three force-triggers must share one tracking job");

    let job_id = job_ids.into_iter().next().unwrap();
    let executions_response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/pulse/schedules/{job_id}/executions"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(executions_response.status(), StatusCode::OK);
    let executions = body_json(executions_response).await;
    assert_eq!(executions.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn unknown_job_id_returns_not_found() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/api/pulse/jobs/does-not-exist").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn plugin_list_reflects_pause_and_resume() {
    let app = test_app().await;

    let list_response = app
        .clone()
        .oneshot(Request::builder().uri("/api/plugins").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(list_response.status(), StatusCode::OK);
    let plugins = body_json(list_response).await;
    let plugins = plugins.as_array().unwrap();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0]["name"], "demo");
    assert_eq!(plugins[0]["paused"], false);

    let pause_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/plugins/demo/pause")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(pause_response.status(), StatusCode::OK);

    let after_pause = app
        .clone()
        .oneshot(Request::builder().uri("/api/plugins").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let plugins = body_json(after_pause).await;
    assert_eq!(plugins.as_array().unwrap()[0]["paused"], true);

    let resume_response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/plugins/demo/resume")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resume_response.status(), StatusCode::OK);
}
