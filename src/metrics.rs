//! Prometheus metrics

use anyhow::Result;
use axum::{Router, extract::State, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to render metrics
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Router exposing `/metrics`
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render))
        .with_state(handle)
        .layer(TraceLayer::new_for_http())
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

/// Serve `/metrics` on its own listener until `shutdown` fires
pub async fn serve_metrics(
    addr: SocketAddr,
    handle: PrometheusHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Serving Prometheus metrics");

    axum::serve(listener, metrics_router(handle))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Record a finished call
pub fn record_call(outcome: &'static str) {
    metrics::counter!("bridge_calls_total", "outcome" => outcome).increment(1);
}

/// Record backend round-trip latency
pub fn record_backend_duration(elapsed: Duration) {
    metrics::histogram!("bridge_backend_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_connection_created() {
    metrics::counter!("bridge_pool_connections_created_total").increment(1);
}

pub fn record_connection_discarded() {
    metrics::counter!("bridge_pool_connections_discarded_total").increment(1);
}

/// Update the gauge of connections currently lent out
pub fn update_pool_in_use(count: usize) {
    metrics::gauge!("bridge_pool_in_use").set(count as f64);
}
