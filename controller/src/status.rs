use std::future::Future;

use anyhow::Context;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use heatai_common::ControllerStatus;
use tokio::{net::TcpListener, sync::watch};
use tracing::info;

pub fn router(status: watch::Receiver<ControllerStatus>) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/healthz", get(handle_healthz))
        .with_state(status)
}

pub async fn serve(
    bind: &str,
    status: watch::Receiver<ControllerStatus>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind status server at {bind}"))?;
    info!("status endpoint listening on http://{bind}");
    axum::serve(listener, router(status))
        .with_graceful_shutdown(shutdown)
        .await
        .context("status server failed")
}

async fn handle_get_status(State(status): State<watch::Receiver<ControllerStatus>>) -> impl IntoResponse {
    let snapshot = status.borrow().clone();
    Json(snapshot)
}

async fn handle_healthz() -> &'static str {
    "ok"
}
