//! WebSocket transport for the reconciliation protocol (spec §4.8 step 3).
//!
//! Enrichment beyond the teacher: `adamtc007-ob-poc` has no peer-to-peer
//! WebSocket client, so the `tokio-tungstenite` dependency and the
//! connect/send/recv shape below are grounded in the broader example pack's
//! use of that crate for client-side WS connections (see DESIGN.md).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::SyncFrame;

/// One reconciliation session with a peer: an ordered, bidirectional
/// exchange of [`SyncFrame`]s over a single connection.
#[async_trait]
pub trait PeerSession: Send {
    async fn send(&mut self, frame: &SyncFrame) -> anyhow::Result<()>;
    async fn recv(&mut self) -> anyhow::Result<SyncFrame>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn connect(&self, peer_url: &str) -> anyhow::Result<Box<dyn PeerSession>>;
}

pub struct TungsteniteTransport;

#[async_trait]
impl PeerTransport for TungsteniteTransport {
    async fn connect(&self, peer_url: &str) -> anyhow::Result<Box<dyn PeerSession>> {
        let (stream, _response) = tokio_tungstenite::connect_async(peer_url).await?;
        Ok(Box::new(TungsteniteSession { stream }))
    }
}

struct TungsteniteSession {
    stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl PeerSession for TungsteniteSession {
    async fn send(&mut self, frame: &SyncFrame) -> anyhow::Result<()> {
        let text = serde_json::to_string(frame)?;
        self.stream.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<SyncFrame> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(serde_json::from_str(&text)?),
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(other)) => anyhow::bail!("unexpected frame kind: {other:?}"),
                Some(Err(e)) => return Err(e.into()),
                None => anyhow::bail!("peer closed the connection"),
            }
        }
    }
}
