use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;

use reporter_broker::HeartbeatRegistry;

/// Readiness probe backed by the heartbeat registry: ready means no
/// known service is stale and no mandatory dependency is unreachable.
#[derive(Clone)]
pub struct ReadinessState {
    pub registry: Arc<HeartbeatRegistry>,
    pub stale_after: chrono::Duration,
}

pub fn router(state: ReadinessState) -> Router {
    Router::new().route("/ready", get(ready)).with_state(state)
}

async fn ready(State(state): State<ReadinessState>) -> impl IntoResponse {
    let now = Utc::now();
    let missing = state
        .registry
        .missing_mandatory_services(now, state.stale_after)
        .await;
    if missing.is_empty() {
        let services = state.registry.services().await;
        (Json(json!({ "status": "ok", "services": services }))).into_response()
    } else {
        let pairs: Vec<_> = missing
            .into_iter()
            .map(|(service, dependency)| json!({ "service": service, "dependency": dependency }))
            .collect();
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "missing": pairs })),
        )
            .into_response()
    }
}

pub async fn serve(
    bind_address: &str,
    state: ReadinessState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!(%bind_address, "readiness endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
