//! QNTX server binary: HTTP/WebSocket surface over C1-C8, with the
//! lifecycle controller (C9) owning startup and graceful shutdown.
//!
//! Mirrors the teacher's `ob-poc-web/src/main.rs` boot sequence — init
//! logging, connect the pool, build state, wire the router, serve — with
//! the collaborator set expanded to the pulse scheduler, worker pool,
//! attestation bus, broadcast hub, and sync ticker this system adds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use qntx_core::config::AppConfig;
use qntx_core::pg::PgStore;
use qntx_observer::AttestationBus;
use qntx_pulse::{AtsParserRegistry, Scheduler};
use qntx_queue::{HandlerRegistry, PgJobQueue, WorkerPool};
use qntx_server::lifecycle::Lifecycle;
use qntx_server::state::{AppState, BuildInfo};
use qntx_sync::{PeerConfig, SyncTicker, TungsteniteTransport};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "qntx_server=info,tower_http=info".into());
    let (filter_layer, tracing_filter) = tracing_subscriber::reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _ = dotenvy::dotenv();
    let config = AppConfig::from_env().expect("invalid configuration");

    tracing::info!("starting QNTX server");

    let pool = sqlx::PgPool::connect(&config.database_url)
        .await
        .expect("failed to connect to database");
    let pg_store = PgStore::new(pool.clone());
    pg_store.migrate().await.expect("failed to run migrations");
    tracing::info!("database connection established, migrations applied");
    let store: Arc<dyn qntx_core::store::Store> = Arc::new(pg_store);

    let queue: Arc<dyn qntx_queue::JobQueue> = Arc::new(PgJobQueue::new(pool.clone()));
    let registry = Arc::new(HandlerRegistry::new());

    let lifecycle = Arc::new(Lifecycle::new(
        Duration::from_secs(config.shutdown_timeout_secs),
        Duration::from_secs(config.worker_stop_timeout_secs),
    ));

    let worker_pool = WorkerPool::spawn(
        config.worker_pool_size,
        queue.clone(),
        registry.clone(),
        lifecycle.root_cancel.clone(),
    );

    let ats = AtsParserRegistry::new();
    let scheduler = Arc::new(Scheduler::new(store.clone(), queue.clone(), registry.clone(), ats));
    let reloaded = scheduler.boot_reload().await.expect("boot reload failed");
    tracing::info!(reloaded, "pulse scheduler booted");

    let attestations = Arc::new(AttestationBus::new(store.clone(), Vec::new()));
    // A standalone token rather than a child of root_cancel: drain step 2
    // (close websockets) must run before step 5 (cancel root context).
    let broadcast_cancel = tokio_util::sync::CancellationToken::new();
    let broadcast = qntx_broadcast::BroadcastHub::spawn(broadcast_cancel.clone());
    let broadcast_for_drain = broadcast.clone();

    let peers: Vec<PeerConfig> = config
        .peers
        .iter()
        .map(|(name, url)| PeerConfig {
            name: name.clone(),
            url: url.clone(),
        })
        .collect();
    let (sync_ticker, peer_snapshot) = SyncTicker::new(
        store.clone(),
        broadcast.clone(),
        Arc::new(TungsteniteTransport),
        queue.clone(),
        peers,
        config.server_port,
        Duration::from_secs(config.sync_interval_secs),
        config.budget_limit,
    );
    let sync_ticker = Arc::new(sync_ticker);
    let sync_task = tokio::spawn({
        let sync_ticker = sync_ticker.clone();
        let cancel = lifecycle.root_cancel.child_token();
        async move { sync_ticker.run(cancel).await }
    });

    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = lifecycle.root_cancel.child_token();
        async move { scheduler.run(cancel).await }
    });

    let app_state = AppState {
        store: store.clone(),
        queue: queue.clone(),
        registry: registry.clone(),
        scheduler: scheduler.clone(),
        attestations,
        broadcast: broadcast.clone(),
        sync_ticker: sync_ticker.clone(),
        peer_snapshot,
        config: Arc::new(RwLock::new(config.clone())),
        build_info: BuildInfo::default(),
        tracing_filter,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = qntx_server::build_router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind");
    tracing::info!(%addr, "QNTX server listening");

    let serve_cancel = lifecycle.root_cancel.clone();
    let http_task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            serve_cancel.cancelled().await;
        });
        if let Err(e) = server.await {
            tracing::error!(error = %e, "server error");
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");
    let report = lifecycle
        .drain(
            worker_pool,
            queue.clone(),
            close_all_clients(broadcast_for_drain, broadcast_cancel),
            vec![sync_task, scheduler_task, http_task],
        )
        .await;
    tracing::info!(?report, "drain complete");
}

/// Cancels the broadcast hub's own token, which drops every registered
/// client's channels and lets their write pumps observe closure (spec
/// §4.9 step 3). The count is read just before cancellation so the drain
/// report reflects who was actually connected.
async fn close_all_clients(broadcast: qntx_broadcast::BroadcastHub, broadcast_cancel: tokio_util::sync::CancellationToken) -> u64 {
    let count = broadcast.client_count().await;
    broadcast_cancel.cancel();
    count
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
