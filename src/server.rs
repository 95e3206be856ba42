//! Operational HTTP endpoints: probes and Prometheus metrics.
//!
//! Probes and metrics are separate routers so they can listen on separate
//! addresses.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;
use crate::health::HealthSignal;
use crate::telemetry::metrics::ControllerMetrics;

/// `/healthz` (liveness) and `/readyz` (readiness): 200 or 503.
pub fn probe_router(health: Arc<HealthSignal>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(health)
}

/// `/metrics` in Prometheus text exposition format.
pub fn metrics_router(metrics: Arc<ControllerMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

fn probe_response(ok: bool) -> Response {
    if ok {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
    }
}

async fn healthz_handler(State(health): State<Arc<HealthSignal>>) -> Response {
    probe_response(health.is_live())
}

async fn readyz_handler(State(health): State<Arc<HealthSignal>>) -> Response {
    probe_response(health.is_ready())
}

async fn metrics_handler(State(metrics): State<Arc<ControllerMetrics>>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

/// Bind separately from [`serve`] so a taken port fails startup.
pub async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    Ok(listener)
}

/// Serve `router` until `cancel` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!(%addr, "http server stopped");
    Ok(())
}
