//! Health endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::stats::RelayStats;

/// State shared with the health route.
#[derive(Clone)]
pub struct HealthState {
    pub queue: String,
    pub stats: Arc<RelayStats>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<HealthState>) -> Json<serde_json::Value> {
    let stats = state.stats.snapshot();

    Json(json!({
        "status": if stats.degraded { "degraded" } else { "ok" },
        "service": "queue-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "queue": state.queue,
        "received": stats.received,
        "completed": stats.completed,
        "failed": stats.failed,
        "lost_locks": stats.lost_locks,
        "faults": stats.faults,
        "last_fault": stats.last_fault,
    }))
}

/// Serve the health endpoint until `shutdown` flips or its sender is dropped.
pub async fn serve(
    addr: SocketAddr,
    state: HealthState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Health endpoint listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}
