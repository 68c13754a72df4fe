//! Broadcast hub (spec §4.7, C7).
//!
//! One task owns the live client set; every mutation and every send is
//! issued from inside its select loop (spec §9 "cyclic ownership of client
//! ↔ hub ⇒ ownership unidirectional: hub owns the set; client references
//! the hub by opaque handle and only submits requests through the hub
//! channel").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::message::WsMessage;

const REQ_CHANNEL_CAPACITY: usize = 1024;
const CLIENT_CHANNEL_CAPACITY: usize = 256;

pub type ClientId = String;

struct ClientHandle {
    graph_tx: mpsc::Sender<Value>,
    log_tx: mpsc::Sender<Value>,
    message_tx: mpsc::Sender<WsMessage>,
}

/// The three receive ends handed back to a freshly registered client's
/// read/write pump.
pub struct ClientChannels {
    pub graph_rx: mpsc::Receiver<Value>,
    pub log_rx: mpsc::Receiver<Value>,
    pub message_rx: mpsc::Receiver<WsMessage>,
}

enum BroadcastReq {
    Register {
        client_id: ClientId,
        graph_tx: mpsc::Sender<Value>,
        log_tx: mpsc::Sender<Value>,
        message_tx: mpsc::Sender<WsMessage>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        client_id: ClientId,
        ack: oneshot::Sender<()>,
    },
    Message {
        message: WsMessage,
        client_id: Option<ClientId>,
    },
    Graph {
        graph: Value,
        client_id: Option<ClientId>,
    },
    ClientCount {
        reply: oneshot::Sender<u64>,
    },
}

/// Handle to the hub task. Cloneable — every sender shares the same
/// request channel, naturally serializing concurrent callers (spec §5).
#[derive(Clone)]
pub struct BroadcastHub {
    req_tx: mpsc::Sender<BroadcastReq>,
    sent_count: Arc<AtomicU64>,
    drop_count: Arc<AtomicU64>,
}

impl BroadcastHub {
    /// Spawns the hub task and returns a handle. `cancel` should descend
    /// from the process root token (spec §4.9).
    pub fn spawn(cancel: CancellationToken) -> Self {
        let (req_tx, req_rx) = mpsc::channel(REQ_CHANNEL_CAPACITY);
        let sent_count = Arc::new(AtomicU64::new(0));
        let drop_count = Arc::new(AtomicU64::new(0));

        tokio::spawn(run(req_rx, sent_count.clone(), drop_count.clone(), cancel));

        Self {
            req_tx,
            sent_count,
            drop_count,
        }
    }

    /// Total messages the hub successfully offered to a client channel.
    pub fn sent_count(&self) -> u64 {
        self.sent_count.load(Ordering::Relaxed)
    }

    /// Total messages dropped because a client (or the request channel
    /// itself) was over-subscribed (spec §4.7, §8 scenario 3).
    pub fn drop_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }

    /// Registers a new client and returns its three receive channels.
    pub async fn register(&self, client_id: ClientId) -> ClientChannels {
        let (graph_tx, graph_rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let (log_tx, log_rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = oneshot::channel();

        let _ = self
            .req_tx
            .send(BroadcastReq::Register {
                client_id,
                graph_tx,
                log_tx,
                message_tx,
                ack: ack_tx,
            })
            .await;
        let _ = ack_rx.await;

        ClientChannels {
            graph_rx,
            log_rx,
            message_rx,
        }
    }

    /// Removes a client. Blocks until the hub has closed its send side, so
    /// the caller's write pump is guaranteed to observe closed channels
    /// before the client object is dropped (spec §4.7 invariant).
    pub async fn unregister(&self, client_id: ClientId) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self
            .req_tx
            .send(BroadcastReq::Unregister { client_id, ack: ack_tx })
            .await;
        let _ = ack_rx.await;
    }

    /// Broadcasts to every registered client, non-blockingly. A full
    /// request channel is itself backpressure (spec §5) — the call drops
    /// silently and the counter still reflects it.
    pub async fn broadcast(&self, message: WsMessage) {
        if self
            .req_tx
            .try_send(BroadcastReq::Message {
                message,
                client_id: None,
            })
            .is_err()
        {
            self.drop_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sends to a single client by ID. Silently a no-op if unknown.
    pub async fn send_to(&self, client_id: ClientId, message: WsMessage) {
        if self
            .req_tx
            .try_send(BroadcastReq::Message {
                message,
                client_id: Some(client_id),
            })
            .is_err()
        {
            self.drop_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Live count of registered clients, as seen by the hub task itself —
    /// unlike [`Self::sent_count`], which only ever grows.
    pub async fn client_count(&self) -> u64 {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.req_tx.send(BroadcastReq::ClientCount { reply: reply_tx }).await.is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Broadcasts a graph payload (spec §4.7 `graph(g)` message kind).
    pub async fn broadcast_graph(&self, graph: Value) {
        if self
            .req_tx
            .try_send(BroadcastReq::Graph {
                graph,
                client_id: None,
            })
            .is_err()
        {
            self.drop_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn run(
    mut req_rx: mpsc::Receiver<BroadcastReq>,
    sent_count: Arc<AtomicU64>,
    drop_count: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut clients: HashMap<ClientId, ClientHandle> = HashMap::new();

    loop {
        let req = tokio::select! {
            _ = cancel.cancelled() => {
                info!(clients = clients.len(), "broadcast hub stopping");
                return;
            }
            req = req_rx.recv() => match req {
                Some(req) => req,
                None => return,
            },
        };

        match req {
            BroadcastReq::Register {
                client_id,
                graph_tx,
                log_tx,
                message_tx,
                ack,
            } => {
                clients.insert(
                    client_id,
                    ClientHandle {
                        graph_tx,
                        log_tx,
                        message_tx,
                    },
                );
                let _ = ack.send(());
            }
            BroadcastReq::Unregister { client_id, ack } => {
                // Dropping the handle closes all three send sides; the
                // client's write pump observes closed channels and exits.
                clients.remove(&client_id);
                let _ = ack.send(());
            }
            BroadcastReq::Message { message, client_id } => match client_id {
                Some(id) => {
                    if let Some(client) = clients.get(&id) {
                        offer(&client.message_tx, message, &sent_count, &drop_count);
                    }
                }
                None => {
                    for client in clients.values() {
                        offer(&client.message_tx, message.clone(), &sent_count, &drop_count);
                    }
                }
            },
            BroadcastReq::Graph { graph, client_id } => match client_id {
                Some(id) => {
                    if let Some(client) = clients.get(&id) {
                        offer(&client.graph_tx, graph, &sent_count, &drop_count);
                    }
                }
                None => {
                    for client in clients.values() {
                        offer(&client.graph_tx, graph.clone(), &sent_count, &drop_count);
                    }
                }
            },
            BroadcastReq::ClientCount { reply } => {
                let _ = reply.send(clients.len() as u64);
            }
        }
    }
}

/// Non-blocking offer to a client channel. A full channel marks the client
/// over-subscribed — the drop counter increments, the client stays
/// registered, and it recovers on the next successful send (spec §4.7).
fn offer<T>(tx: &mpsc::Sender<T>, value: T, sent_count: &AtomicU64, drop_count: &AtomicU64) {
    match tx.try_send(value) {
        Ok(()) => {
            sent_count.fetch_add(1, Ordering::Relaxed);
        }
        Err(_) => {
            drop_count.fetch_add(1, Ordering::Relaxed);
            warn!("client channel over-subscribed, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_broadcast_is_received() {
        let hub = BroadcastHub::spawn(CancellationToken::new());
        let mut channels = hub.register("c1".into()).await;

        hub.broadcast(WsMessage::Version(Value::String("1.0".into()))).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let msg = channels.message_rx.try_recv().unwrap();
        assert!(matches!(msg, WsMessage::Version(_)));
    }

    #[tokio::test]
    async fn unregister_closes_channels() {
        let hub = BroadcastHub::spawn(CancellationToken::new());
        let mut channels = hub.register("c1".into()).await;
        hub.unregister("c1".into()).await;

        assert!(channels.message_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn overload_send_plus_drop_equals_total_and_client_stays_registered() {
        let hub = BroadcastHub::spawn(CancellationToken::new());
        let _channels = hub.register("c1".into()).await;

        for i in 0..1000 {
            hub.broadcast(WsMessage::JobUpdate(Value::from(i))).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(hub.sent_count() + hub.drop_count(), 1000);

        // Client is still registered: a further send either lands or drops,
        // it doesn't error out because the client vanished.
        hub.broadcast(WsMessage::JobUpdate(Value::from(1001))).await;
    }

    #[tokio::test]
    async fn client_count_tracks_register_and_unregister() {
        let hub = BroadcastHub::spawn(CancellationToken::new());
        assert_eq!(hub.client_count().await, 0);

        let _c1 = hub.register("c1".into()).await;
        let _c2 = hub.register("c2".into()).await;
        assert_eq!(hub.client_count().await, 2);

        hub.unregister("c1".into()).await;
        assert_eq!(hub.client_count().await, 1);
    }

    #[tokio::test]
    async fn targeted_message_reaches_only_that_client() {
        let hub = BroadcastHub::spawn(CancellationToken::new());
        let mut c1 = hub.register("c1".into()).await;
        let mut c2 = hub.register("c2".into()).await;

        hub.send_to("c1".into(), WsMessage::DaemonStatus(Value::Null)).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(c1.message_rx.try_recv().is_ok());
        assert!(c2.message_rx.try_recv().is_err());
    }
}
