//! Sync ticker + peer reconciliation loop (spec §4.8, C8).
//!
//! Peer state lives only inside this task (spec §9 "global `sync.Map` peer
//! state ⇒ a concurrent mapping confined to the sync task; other tasks
//! receive snapshots on tick boundaries via broadcast"); external readers
//! get a `watch` snapshot published once per tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use qntx_broadcast::{BroadcastHub, WsMessage};
use qntx_core::model::{PeerState, PeerStatus};
use qntx_core::store::Store;
use qntx_queue::JobQueue;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::hashtree::HashTree;
use crate::protocol::{SyncFrame, SyncSummary};
use crate::transport::PeerTransport;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileOutcome {
    pub sent: usize,
    pub received: usize,
    pub remote_budget: Option<f64>,
}

/// Backoff multiplier for the peer's next attempt (spec §4.8 step 6, §8
/// scenario 5): 1 for 1-3 failures, 10 for 4-6, 100 for 7+.
pub fn backoff_multiplier(fail_count: u32) -> u32 {
    match fail_count {
        0 => 0,
        1..=3 => 1,
        4..=6 => 10,
        _ => 100,
    }
}

fn apply_success(state: &mut PeerState, now: DateTime<Utc>) {
    state.fail_count = 0;
    state.next_attempt = None;
    state.status = PeerStatus::Reachable;
    state.last_seen = Some(now);
}

fn apply_failure(state: &mut PeerState, now: DateTime<Utc>, interval: Duration) {
    state.fail_count += 1;
    state.status = PeerStatus::Unreachable;
    let multiplier = backoff_multiplier(state.fail_count);
    state.next_attempt = Some(now + chrono::Duration::seconds((interval.as_secs() * multiplier as u64) as i64));
}

pub struct SyncTicker {
    store: Arc<dyn Store>,
    broadcast: BroadcastHub,
    transport: Arc<dyn PeerTransport>,
    queue: Arc<dyn JobQueue>,
    peers: Vec<PeerConfig>,
    self_port: u16,
    interval: Duration,
    budget_limit: f64,
    snapshot_tx: watch::Sender<Vec<PeerState>>,
}

impl SyncTicker {
    pub fn new(
        store: Arc<dyn Store>,
        broadcast: BroadcastHub,
        transport: Arc<dyn PeerTransport>,
        queue: Arc<dyn JobQueue>,
        peers: Vec<PeerConfig>,
        self_port: u16,
        interval: Duration,
        budget_limit: f64,
    ) -> (Self, watch::Receiver<Vec<PeerState>>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
        (
            Self {
                store,
                broadcast,
                transport,
                queue,
                peers,
                self_port,
                interval,
                budget_limit,
                snapshot_tx,
            },
            snapshot_rx,
        )
    }

    /// Sums `cost_actual` (falling back to `cost_estimate` for jobs still in
    /// flight) across every async job this node knows about — the "spend"
    /// half of the budget frame exchanged during reconciliation.
    async fn local_spend(&self) -> anyhow::Result<f64> {
        let jobs = self.queue.list_jobs(None, i64::MAX).await?;
        Ok(jobs.iter().filter_map(|j| j.cost_actual.or(j.cost_estimate)).sum())
    }

    fn is_self(&self, peer_url: &str) -> bool {
        peer_url
            .rsplit(':')
            .next()
            .and_then(|p| p.trim_end_matches('/').parse::<u16>().ok())
            .map(|port| port == self.self_port)
            .unwrap_or(false)
    }

    /// One full tick over all configured peers (spec §4.8 steps 1-8).
    pub async fn tick(&self, peer_states: &mut HashMap<String, PeerState>) -> anyhow::Result<()> {
        let now = Utc::now();
        let local_attestations = self.store.list_attestations(i64::MAX).await?;
        let local_tree = HashTree::build(&local_attestations);

        let mut first_failures = Vec::new();
        let mut repeat_failures = 0usize;
        let mut successes = 0usize;

        for peer in &self.peers {
            if self.is_self(&peer.url) {
                continue;
            }

            let state = peer_states.entry(peer.name.clone()).or_insert_with(|| PeerState {
                name: peer.name.clone(),
                status: PeerStatus::Unknown,
                last_seen: None,
                fail_count: 0,
                next_attempt: None,
                remote_budget: None,
                advertised_name: None,
            });

            if let Some(next_attempt) = state.next_attempt {
                if now < next_attempt {
                    continue;
                }
            }

            let was_first_failure = state.fail_count == 0;
            match self.reconcile_with(peer, &local_tree, &local_attestations).await {
                Ok(outcome) => {
                    apply_success(state, now);
                    if let Some(remote_budget) = outcome.remote_budget {
                        state.remote_budget = Some(remote_budget);
                    }
                    successes += 1;
                    info!(peer = peer.name, sent = outcome.sent, received = outcome.received, "reconciliation succeeded");
                }
                Err(e) => {
                    apply_failure(state, now, self.interval);
                    if was_first_failure {
                        first_failures.push((peer.name.clone(), e.to_string()));
                    } else {
                        repeat_failures += 1;
                    }
                }
            }
        }

        for (peer, reason) in &first_failures {
            warn!(peer, reason, "peer unreachable");
        }
        info!(
            successes,
            first_failures = first_failures.len(),
            repeat_failures,
            "sync tick summary"
        );

        let snapshot: Vec<PeerState> = peer_states.values().cloned().collect();
        let _ = self.snapshot_tx.send(snapshot.clone());

        self.broadcast
            .broadcast(WsMessage::SyncStatus(json!({
                "root_hash": local_tree.root_hash,
                "group_count": local_tree.groups.len(),
                "peers": snapshot,
            })))
            .await;

        Ok(())
    }

    /// On-demand reconciliation against a single configured peer, bypassing
    /// the backoff schedule (spec §6 `POST /api/sync {peer}`). Returns
    /// `NotFound` if no peer with that name is configured.
    pub async fn reconcile_peer(&self, peer_name: &str) -> anyhow::Result<ReconcileOutcome> {
        let peer = self
            .peers
            .iter()
            .find(|p| p.name == peer_name)
            .ok_or_else(|| anyhow::anyhow!("no peer named {peer_name}"))?;
        let local_attestations = self.store.list_attestations(i64::MAX).await?;
        let local_tree = HashTree::build(&local_attestations);
        self.reconcile_with(peer, &local_tree, &local_attestations).await
    }

    async fn reconcile_with(
        &self,
        peer: &PeerConfig,
        local_tree: &HashTree,
        local_attestations: &[qntx_core::model::Attestation],
    ) -> anyhow::Result<ReconcileOutcome> {
        let mut session = self.transport.connect(&peer.url).await?;

        session.send(&SyncFrame::Summary(SyncSummary::from(local_tree))).await?;
        let remote_summary = match session.recv().await? {
            SyncFrame::Summary(s) => s,
            other => anyhow::bail!("expected Summary, got {other:?}"),
        };

        let local_spend = self.local_spend().await?;
        session.send(&SyncFrame::Budget { spend: local_spend, limit: self.budget_limit }).await?;
        let remote_budget = match session.recv().await? {
            SyncFrame::Budget { spend, .. } => spend,
            other => anyhow::bail!("expected Budget, got {other:?}"),
        };

        let remote_tree_stub = HashTree {
            root_hash: remote_summary.root_hash.clone(),
            groups: remote_summary
                .group_hashes
                .iter()
                .map(|(k, h)| (k.clone(), crate::hashtree::GroupEntry { hash: h.clone(), member_ids: vec![] }))
                .collect(),
        };

        if local_tree.root_hash == remote_tree_stub.root_hash {
            return Ok(ReconcileOutcome {
                remote_budget: Some(remote_budget),
                ..Default::default()
            });
        }

        let diff_keys: Vec<String> = local_tree.differing_groups(&remote_tree_stub).into_iter().map(str::to_string).collect();
        let local_group_ids: std::collections::BTreeMap<String, Vec<String>> = diff_keys
            .iter()
            .filter_map(|k| local_tree.groups.get(k).map(|g| (k.clone(), g.member_ids.clone())))
            .collect();

        session.send(&SyncFrame::GroupIds(local_group_ids.clone())).await?;
        let remote_group_ids = match session.recv().await? {
            SyncFrame::GroupIds(ids) => ids,
            other => anyhow::bail!("expected GroupIds, got {other:?}"),
        };

        let mut missing_local: Vec<String> = Vec::new();
        let mut missing_remote: Vec<String> = Vec::new();
        for key in &diff_keys {
            let local_ids: std::collections::HashSet<&String> = local_group_ids.get(key).into_iter().flatten().collect();
            let remote_ids: std::collections::HashSet<&String> = remote_group_ids.get(key).into_iter().flatten().collect();
            missing_local.extend(remote_ids.difference(&local_ids).map(|s| s.to_string()));
            missing_remote.extend(local_ids.difference(&remote_ids).map(|s| s.to_string()));
        }

        if !missing_remote.is_empty() {
            let by_id: HashMap<&str, &qntx_core::model::Attestation> =
                local_attestations.iter().map(|a| (a.id.as_str(), a)).collect();
            let items = missing_remote.iter().filter_map(|id| by_id.get(id.as_str()).cloned().cloned()).collect();
            session.send(&SyncFrame::Attestations { items }).await?;
        }

        let mut received = 0usize;
        if !missing_local.is_empty() {
            session.send(&SyncFrame::Fetch { ids: missing_local.clone() }).await?;
            if let SyncFrame::Attestations { items } = session.recv().await? {
                for attestation in items {
                    if self.store.insert_attestation_if_absent(&attestation).await? {
                        received += 1;
                    }
                }
            }
        }

        Ok(ReconcileOutcome {
            sent: missing_remote.len(),
            received,
            remote_budget: Some(remote_budget),
        })
    }

    /// The ticker loop (spec §4.8: "every interval, typically 60s").
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut peer_states: HashMap<String, PeerState> = HashMap::new();
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("sync ticker stopping");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick(&mut peer_states).await {
                        warn!(error = %e, "sync tick failed outright");
                    }
                }
            }
        }
    }
}
