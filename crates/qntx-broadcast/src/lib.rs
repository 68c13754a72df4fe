//! Single-writer WebSocket broadcast hub (spec §4.7, C7).

pub mod hub;
pub mod message;

pub use hub::{BroadcastHub, ClientChannels, ClientId};
pub use message::{ClientMessage, WsMessage};
