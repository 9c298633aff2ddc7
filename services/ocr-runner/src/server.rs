//! Optional status listener: `/health` and `/metrics` while a batch runs

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use key_pool::{Clock, CredentialPool};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<CredentialPool>,
    pub clock: Clock,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the router. `max_connections` caps concurrent requests.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Serve until `cancel` fires, then drain.
pub fn spawn(
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = listener.local_addr().ok();
        info!(addr = ?addr, "status listener running");
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            error!(error = %e, "status listener failed");
        }
    })
}

/// Pool health JSON. 200 while at least one credential is eligible, 503 when
/// none is.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.pool.health(state.clock.now_millis()).await;
    let status_code = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    body["uptime_seconds"] = state.started_at.elapsed().as_secs().into();

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
