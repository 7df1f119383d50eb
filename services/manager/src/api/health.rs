//! Service identity and liveness.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Always "ok" while the server answers.
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    /// Workers currently registered.
    pub workers: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(service_info))
        .route("/healthz", get(healthz))
}

async fn service_info(State(state): State<AppState>) -> impl IntoResponse {
    let metadata = state.metadata();
    Json(ServiceInfo {
        name: metadata.name.clone(),
        version: metadata.version.clone(),
    })
}

/// Liveness probe. Does not check workers.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let metadata = state.metadata();
    Json(HealthResponse {
        status: "ok".to_string(),
        service: metadata.name.clone(),
        version: metadata.version.clone(),
        timestamp: Utc::now().to_rfc3339(),
        workers: state.brain().registry().count(),
    })
}
