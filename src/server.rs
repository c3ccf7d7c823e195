use crate::client::metrics::render;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::Registry;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn metrics(State(registry): State<Registry>) -> Result<String, (StatusCode, String)> {
    render(&registry).map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

/// Serve `/metrics` until `shutdown` completes
pub async fn start_metrics_server(
    listen_addr: SocketAddr,
    registry: Registry,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "Serving metrics");
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await
}
