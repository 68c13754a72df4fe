//! Sync ticker, rolling hash tree, and peer reconciliation protocol
//! (spec §4.8, C8).

pub mod hashtree;
pub mod protocol;
pub mod ticker;
pub mod transport;

pub use hashtree::HashTree;
pub use protocol::{SyncFrame, SyncSummary};
pub use ticker::{backoff_multiplier, PeerConfig, ReconcileOutcome, SyncTicker, DEFAULT_SYNC_INTERVAL};
pub use transport::{PeerSession, PeerTransport, TungsteniteTransport};
