//! QNTX server library: state, routes, WebSocket handlers, and the
//! lifecycle controller. `main.rs` is a thin binary wrapper over
//! [`build_router`] (spec §4.9, §6), mirroring the teacher's split between
//! `sem_os_server::router::build_router` and its own `main.rs`.

pub mod error;
pub mod lifecycle;
pub mod routes;
pub mod state;
pub mod ws;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// Assembles the full HTTP + WebSocket router over a constructed
/// [`AppState`]. Split out from `main` so integration tests can mount it
/// over fakes without going through process boot.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::router())
        .route("/ws", get(ws::ws_handler))
        .route("/ws/sync", get(ws::ws_sync_handler))
        .with_state(state)
}
