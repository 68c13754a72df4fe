//! HTTP API surface (spec §6).
//!
//! Handlers are thin: parse/validate the request, call the relevant
//! collaborator, map the result through [`ApiError`]. No business logic
//! lives here (mirrors the teacher's `ob-poc-web/src/routes/api.rs` split
//! between thin handlers and the crates that actually do the work).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use qntx_core::model::Attestation;
use qntx_pulse::ScheduleRequest;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/pulse/jobs", get(list_jobs))
        .route("/api/pulse/jobs/:id", get(get_job))
        .route("/api/pulse/jobs/:id/children", get(get_job_children))
        .route("/api/pulse/jobs/:id/stages", get(get_job_stages))
        .route("/api/pulse/jobs/:id/tasks/:task_id/logs", get(get_task_logs))
        .route("/api/pulse/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/api/pulse/schedules/:id",
            get(get_schedule).patch(patch_schedule).delete(delete_schedule),
        )
        .route("/api/pulse/schedules/:id/executions", get(list_schedule_executions))
        .route("/api/pulse/executions/:id", get(get_execution))
        .route("/api/pulse/executions/:id/logs", get(get_execution_logs))
        .route("/api/attestations", post(create_attestation))
        .route("/api/sync", post(trigger_sync))
        .route("/api/sync/status", get(sync_status))
        .route("/api/config", get(get_config).post(patch_config).patch(patch_config))
        .route("/api/plugins", get(list_plugins))
        .route("/api/plugins/:name/pause", post(pause_plugin))
        .route("/api/plugins/:name/resume", post(resume_plugin))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

fn default_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(100).clamp(1, 1000)
}

// -- health --------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    commit: &'static str,
    build_time: &'static str,
    clients: u64,
    verbosity: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let clients = state.broadcast.client_count().await;
    let verbosity = state
        .tracing_filter
        .with_current(|filter| filter.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    Json(HealthResponse {
        status: "ok",
        version: state.build_info.version,
        commit: state.build_info.commit,
        build_time: state.build_info.build_time,
        clients,
        verbosity,
    })
}

// -- async jobs ------------------------------------------------------------

async fn list_jobs(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<qntx_core::model::AsyncJob>>, ApiError> {
    let jobs = state.queue.list_jobs(None, default_limit(q.limit)).await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<qntx_core::model::AsyncJob>, ApiError> {
    let job = state
        .queue
        .get(&id)
        .await?
        .ok_or_else(|| qntx_core::error::QntxError::NotFound(format!("job {id}")))?;
    Ok(Json(job))
}

async fn get_job_children(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<qntx_core::model::AsyncJob>>, ApiError> {
    let children = state.queue.list_tasks_by_parent(&id).await?;
    Ok(Json(children))
}

async fn get_job_stages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let logs = state.store.list_task_logs(&id, None, None).await?;
    let mut stages: Vec<String> = logs.into_iter().filter_map(|entry| entry.stage).collect();
    stages.sort();
    stages.dedup();
    Ok(Json(stages))
}

async fn get_task_logs(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, String)>,
) -> Result<Json<Vec<qntx_core::model::TaskLogEntry>>, ApiError> {
    let logs = state.store.list_task_logs(&id, None, Some(&task_id)).await?;
    Ok(Json(logs))
}

// -- scheduled jobs --------------------------------------------------------

async fn list_schedules(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<qntx_core::model::ScheduledJob>>, ApiError> {
    let jobs = state.store.list_scheduled_jobs(default_limit(q.limit)).await?;
    Ok(Json(jobs))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<qntx_core::model::ScheduledJob>, ApiError> {
    let job = state
        .store
        .get_scheduled_job(&id)
        .await?
        .ok_or_else(|| qntx_core::error::QntxError::NotFound(format!("schedule {id}")))?;
    Ok(Json(job))
}

#[derive(Deserialize)]
struct CreateScheduleBody {
    ats_code: String,
    interval_seconds: i64,
    #[serde(default)]
    force: bool,
}

/// Creates (or force-triggers) a scheduled job from ATS code (spec §4.5,
/// §6, §8 scenarios 1 & 2). `force:true` bypasses the active-job dedup
/// entirely and goes straight through `Scheduler::force_trigger`, which
/// does its own ATS parsing and reuses a single `__force_trigger__`
/// tracking job across repeat calls; otherwise the code is parsed once
/// here through the scheduler's ATS registry to build a normal
/// `ScheduleRequest`.
async fn create_schedule(
    State(state): State<AppState>,
    Json(body): Json<CreateScheduleBody>,
) -> Result<Json<qntx_core::model::ScheduledJob>, ApiError> {
    if body.force {
        let (job, _async_job) = state.scheduler.force_trigger(&body.ats_code).await?;
        return Ok(Json(job));
    }

    let parsed = state
        .scheduler
        .ats_registry()
        .parse(&body.ats_code)
        .map_err(qntx_core::error::QntxError::from)?;

    let job = state
        .scheduler
        .create_schedule(ScheduleRequest {
            handler_name: parsed.handler_name,
            payload: parsed.payload,
            source_url: parsed.source_url,
            interval_seconds: body.interval_seconds,
            created_from_doc: None,
            metadata: None,
            force: false,
        })
        .await?;
    Ok(Json(job))
}

#[derive(Deserialize)]
struct PatchScheduleBody {
    state: Option<String>,
}

async fn patch_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchScheduleBody>,
) -> Result<Json<qntx_core::model::ScheduledJob>, ApiError> {
    if let Some(target) = body.state.as_deref() {
        match target {
            "paused" => state.scheduler.pause(&id).await?,
            "active" => state.scheduler.resume(&id).await?,
            "inactive" => state.scheduler.stop(&id).await?,
            other => {
                return Err(qntx_core::error::QntxError::InvalidRequest(format!(
                    "unsupported target state {other}"
                ))
                .into())
            }
        }
    }
    let job = state
        .store
        .get_scheduled_job(&id)
        .await?
        .ok_or_else(|| qntx_core::error::QntxError::NotFound(format!("schedule {id}")))?;
    Ok(Json(job))
}

async fn delete_schedule(State(state): State<AppState>, Path(id): Path<String>) -> Result<(), ApiError> {
    state.scheduler.delete(&id).await?;
    Ok(())
}

async fn list_schedule_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<qntx_core::model::Execution>>, ApiError> {
    let executions = state
        .store
        .list_executions_for_schedule(&id, default_limit(q.limit))
        .await?;
    Ok(Json(executions))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<qntx_core::model::Execution>, ApiError> {
    let execution = state
        .store
        .get_execution(&id)
        .await?
        .ok_or_else(|| qntx_core::error::QntxError::NotFound(format!("execution {id}")))?;
    Ok(Json(execution))
}

async fn get_execution_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Option<String>>, ApiError> {
    let execution = state
        .store
        .get_execution(&id)
        .await?
        .ok_or_else(|| qntx_core::error::QntxError::NotFound(format!("execution {id}")))?;
    Ok(Json(execution.logs))
}

// -- attestations ------------------------------------------------------------

#[derive(Serialize)]
struct IngestResponse {
    id: String,
    status: qntx_observer::IngestStatus,
}

async fn create_attestation(
    State(state): State<AppState>,
    Json(attestation): Json<Attestation>,
) -> Result<Json<IngestResponse>, ApiError> {
    let id = attestation.id.clone();
    let status = state.attestations.create_attestation(attestation).await?;
    Ok(Json(IngestResponse { id, status }))
}

// -- sync --------------------------------------------------------------------

#[derive(Deserialize)]
struct TriggerSyncBody {
    peer: String,
}

#[derive(Serialize)]
struct TriggerSyncResponse {
    sent: usize,
    received: usize,
}

async fn trigger_sync(
    State(state): State<AppState>,
    Json(body): Json<TriggerSyncBody>,
) -> Result<Json<TriggerSyncResponse>, ApiError> {
    let outcome = state
        .sync_ticker
        .reconcile_peer(&body.peer)
        .await
        .map_err(|e| qntx_core::error::QntxError::NotFound(e.to_string()))?;
    Ok(Json(TriggerSyncResponse {
        sent: outcome.sent,
        received: outcome.received,
    }))
}

async fn sync_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let peers = state.peer_snapshot.borrow().clone();
    Json(json!({ "peers": peers }))
}

// -- config --------------------------------------------------------------------

async fn get_config(State(state): State<AppState>) -> Json<qntx_core::config::AppConfig> {
    Json(state.config.read().await.clone())
}

#[derive(Deserialize)]
struct ConfigPatchBody {
    key: String,
    value: String,
}

async fn patch_config(
    State(state): State<AppState>,
    Json(body): Json<ConfigPatchBody>,
) -> Result<Json<qntx_core::config::AppConfig>, ApiError> {
    let mut config = state.config.write().await;
    config.apply(&body.key, &body.value)?;
    Ok(Json(config.clone()))
}

// -- plugins --------------------------------------------------------------------

#[derive(Serialize)]
struct PluginStatus {
    name: String,
    paused: bool,
}

async fn list_plugins(State(state): State<AppState>) -> Json<Vec<PluginStatus>> {
    let names = state.registry.list_names().await;
    Json(
        names
            .into_iter()
            .map(|(name, paused)| PluginStatus { name, paused })
            .collect(),
    )
}

async fn pause_plugin(State(state): State<AppState>, Path(name): Path<String>) -> Result<(), ApiError> {
    state.registry.set_paused(&name, true).await?;
    Ok(())
}

async fn resume_plugin(State(state): State<AppState>, Path(name): Path<String>) -> Result<(), ApiError> {
    state.registry.set_paused(&name, false).await?;
    Ok(())
}
