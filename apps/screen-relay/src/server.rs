use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{channel::RelayChannel, config::ServerConfig, handlers, websocket};

/// Shared handles for every route. Both channels are reference counted, so
/// cloning the state per request is cheap.
#[derive(Clone)]
pub struct AppState {
    pub main: RelayChannel,
    pub pointer: RelayChannel,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: &ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            main: RelayChannel::new(config.main.clone()),
            pointer: RelayChannel::new(config.pointer.clone()),
            metrics,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::service_info))
        .route("/healthz", get(handlers::health_check))
        .route("/stats", get(handlers::stats))
        .route("/get-stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/register-host", post(handlers::register_host))
        .route("/register-viewer", post(handlers::register_viewer))
        .route("/send-frame", post(handlers::send_frame))
        .route("/get-frame", get(handlers::get_frame))
        .route("/heartbeat", post(handlers::heartbeat))
        .route("/ws", get(websocket::main_ws_handler))
        .route("/ws/pointer", get(websocket::pointer_ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = AppState::new(&config, Some(metrics));

    let main_sweeper = state.main.spawn_sweeper();
    let pointer_sweeper = state.pointer.spawn_sweeper();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!(
        main_timeout_secs = config.main.idle_timeout.as_secs(),
        pointer_timeout_ms = config.pointer.idle_timeout.as_millis() as u64,
        "screen-relay listening on {}",
        config.listen_addr
    );

    let graceful = axum::serve(listener, router(state)).with_graceful_shutdown(shutdown_signal());
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    main_sweeper.abort();
    pointer_sweeper.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
