//! Shared application state (spec §2, grounded on the teacher's
//! `ob-poc-web/src/state.rs` "one `AppState` struct, `Arc`-wrapped
//! collaborators, `Clone` for axum extraction" shape).

use std::sync::Arc;

use qntx_broadcast::BroadcastHub;
use qntx_core::config::AppConfig;
use qntx_core::store::Store;
use qntx_observer::AttestationBus;
use qntx_pulse::Scheduler;
use qntx_queue::{HandlerRegistry, JobQueue};
use qntx_sync::SyncTicker;
use tokio::sync::{watch, RwLock};

/// Handle back into the live `EnvFilter` installed at boot, so the health
/// endpoint can report the running verbosity without re-parsing `RUST_LOG`.
pub type FilterHandle = tracing_subscriber::reload::Handle<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<HandlerRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub attestations: Arc<AttestationBus>,
    pub broadcast: BroadcastHub,
    pub sync_ticker: Arc<SyncTicker>,
    pub peer_snapshot: watch::Receiver<Vec<qntx_core::model::PeerState>>,
    pub config: Arc<RwLock<AppConfig>>,
    pub build_info: BuildInfo,
    pub tracing_filter: FilterHandle,
}

#[derive(Clone)]
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub build_time: &'static str,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            commit: option_env!("QNTX_COMMIT").unwrap_or("unknown"),
            build_time: option_env!("QNTX_BUILD_TIME").unwrap_or("unknown"),
        }
    }
}
