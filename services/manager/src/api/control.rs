//! Read-only views of manager state.

use axum::{extract::State, routing::get, Json, Router};
use lift_networking::PortPoolInfo;
use serde::Serialize;

use crate::brain::ProcessClass;
use crate::registry::AllWorkerInfo;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PortsResponse {
    pub capacity: usize,
    #[serde(flatten)]
    pub info: PortPoolInfo,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/classes", get(classes))
        .route("/workers", get(workers))
        .route("/ports", get(ports))
}

async fn classes(State(state): State<AppState>) -> Json<Vec<ProcessClass>> {
    Json(state.brain().classes().to_vec())
}

async fn workers(State(state): State<AppState>) -> Json<AllWorkerInfo> {
    Json(state.brain().registry().unsorted_info())
}

async fn ports(State(state): State<AppState>) -> Json<PortsResponse> {
    let pool = state.brain().port_pool();
    Json(PortsResponse {
        capacity: pool.capacity(),
        info: pool.info(),
    })
}
