//! WebSocket endpoints: `/ws` (client graph/log/message stream, spec §4.7)
//! and `/ws/sync` (inbound peer reconciliation, spec §4.8 "either side may
//! initiate; both accept the same message shapes").

use std::collections::{BTreeMap, HashSet};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use qntx_broadcast::{ClientMessage, WsMessage};
use qntx_sync::{HashTree, SyncFrame, SyncSummary};
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(mut socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    let mut channels = state.broadcast.register(client_id.clone()).await;
    info!(client_id, "websocket client connected");

    loop {
        tokio::select! {
            graph = channels.graph_rx.recv() => {
                let Some(graph) = graph else { break };
                if send_json(&mut socket, &graph).await.is_err() {
                    break;
                }
            }
            log = channels.log_rx.recv() => {
                let Some(log) = log else { break };
                if send_json(&mut socket, &log).await.is_err() {
                    break;
                }
            }
            message = channels.message_rx.recv() => {
                let Some(message) = message else { break };
                if send_json(&mut socket, &message).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => handle_client_message(&state, &client_id, msg).await,
                            Err(e) => warn!(client_id, error = %e, "unrecognized client message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(client_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    state.broadcast.unregister(client_id.clone()).await;
    info!(client_id, "websocket client disconnected");
}

async fn handle_client_message(state: &AppState, client_id: &str, msg: ClientMessage) {
    match msg {
        ClientMessage::Ping(_) => {
            state
                .broadcast
                .send_to(client_id.to_string(), WsMessage::DaemonStatus(serde_json::json!({"pong": true})))
                .await;
        }
        ClientMessage::JobControl(payload) => {
            info!(client_id, ?payload, "job control message received");
        }
        other => {
            info!(client_id, ?other, "client message received");
        }
    }
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    socket.send(Message::Text(text)).await
}

// -- inbound sync reconciliation ------------------------------------------

pub async fn ws_sync_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| sync_session(socket, state))
}

async fn sync_session(mut socket: WebSocket, state: AppState) {
    if let Err(e) = accept_reconciliation(&mut socket, &state).await {
        warn!(error = %e, "inbound sync reconciliation failed");
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Acceptor side of the reconciliation protocol (spec §4.8). Structurally
/// the mirror of the outbound ticker's exchange: receive the peer's
/// [`SyncFrame::Summary`] first, answer with our own, then the same for
/// [`SyncFrame::Budget`], then only exchange member IDs and attestations for
/// the groups that actually differ. This side has no durable per-peer
/// state to write the observed budget into — only the initiating ticker's
/// `tick` loop persists `remote_budget`.
async fn accept_reconciliation(socket: &mut WebSocket, state: &AppState) -> anyhow::Result<()> {
    let local_attestations = state.store.list_attestations(i64::MAX).await?;
    let local_tree = HashTree::build(&local_attestations);

    let remote_summary = match recv_frame(socket).await? {
        SyncFrame::Summary(s) => s,
        other => anyhow::bail!("expected Summary, got {other:?}"),
    };
    send_frame(socket, &SyncFrame::Summary(SyncSummary::from(&local_tree))).await?;

    let remote_budget = match recv_frame(socket).await? {
        SyncFrame::Budget { spend, limit } => (spend, limit),
        other => anyhow::bail!("expected Budget, got {other:?}"),
    };
    let local_budget_limit = state.config.read().await.budget_limit;
    send_frame(socket, &SyncFrame::Budget { spend: local_spend(&state.queue).await?, limit: local_budget_limit }).await?;
    info!(spend = remote_budget.0, limit = remote_budget.1, "peer budget received");

    if remote_summary.root_hash == local_tree.root_hash {
        return Ok(());
    }

    let diff_keys: Vec<String> = local_tree
        .groups
        .keys()
        .chain(remote_summary.group_hashes.keys())
        .filter(|k| {
            local_tree.groups.get(*k).map(|g| g.hash.clone()) != remote_summary.group_hashes.get(*k).cloned()
        })
        .cloned()
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let local_group_ids: BTreeMap<String, Vec<String>> = diff_keys
        .iter()
        .filter_map(|k| local_tree.groups.get(k).map(|g| (k.clone(), g.member_ids.clone())))
        .collect();
    send_frame(socket, &SyncFrame::GroupIds(local_group_ids.clone())).await?;

    let remote_group_ids = match recv_frame(socket).await? {
        SyncFrame::GroupIds(ids) => ids,
        other => anyhow::bail!("expected GroupIds, got {other:?}"),
    };

    let mut missing_remote = Vec::new();
    let mut missing_local = Vec::new();
    for key in &diff_keys {
        let local_ids: HashSet<&str> = local_group_ids
            .get(key)
            .map(|ids| ids.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let remote_ids: HashSet<&str> = remote_group_ids
            .get(key)
            .map(|ids| ids.iter().map(String::as_str).collect())
            .unwrap_or_default();
        missing_remote.extend(local_ids.difference(&remote_ids).map(|s| s.to_string()));
        missing_local.extend(remote_ids.difference(&local_ids).map(|s| s.to_string()));
    }

    let items = local_attestations
        .iter()
        .filter(|a| missing_remote.contains(&a.id))
        .cloned()
        .collect();
    send_frame(socket, &SyncFrame::Attestations { items }).await?;

    if !missing_local.is_empty() {
        send_frame(socket, &SyncFrame::Fetch { ids: missing_local }).await?;
        match recv_frame(socket).await? {
            SyncFrame::Attestations { items } => {
                for attestation in items {
                    state.store.insert_attestation_if_absent(&attestation).await?;
                }
            }
            other => anyhow::bail!("expected Attestations, got {other:?}"),
        }
    }

    Ok(())
}

/// Sums `cost_actual` (falling back to `cost_estimate`) across every async
/// job this node knows about, the same computation the outbound sync ticker
/// makes for its half of the budget frame.
async fn local_spend(queue: &std::sync::Arc<dyn qntx_queue::JobQueue>) -> anyhow::Result<f64> {
    let jobs = queue.list_jobs(None, i64::MAX).await?;
    Ok(jobs.iter().filter_map(|j| j.cost_actual.or(j.cost_estimate)).sum())
}

async fn send_frame(socket: &mut WebSocket, frame: &SyncFrame) -> anyhow::Result<()> {
    let text = serde_json::to_string(frame)?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn recv_frame(socket: &mut WebSocket) -> anyhow::Result<SyncFrame> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(other)) => anyhow::bail!("unexpected frame kind: {other:?}"),
            Some(Err(e)) => return Err(e.into()),
            None => anyhow::bail!("peer closed the connection"),
        }
    }
}
