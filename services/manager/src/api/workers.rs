//! Launch, shutdown and backfill endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use lift_id::WorkerId;
use serde::Serialize;
use tracing::instrument;

use crate::brain::{BackfillCandidate, LaunchedWorker};
use crate::state::AppState;

use super::error::ApiError;

#[derive(Debug, Serialize)]
pub struct BackfillResponse {
    pub list: Vec<BackfillCandidate>,
}

#[derive(Debug, Serialize)]
pub struct ShutdownResponse {
    pub id: WorkerId,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/launch/{index}", post(launch))
        .route("/shutdown/{id}", post(shutdown))
        .route("/backfill/{index}", get(backfill))
}

#[instrument(skip(state))]
async fn launch(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<Json<LaunchedWorker>, ApiError> {
    let index = parse_class_index(&state, &index)?;
    Ok(Json(state.brain().launch(index)?))
}

#[instrument(skip(state))]
async fn shutdown(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_worker_id(&id)?;
    state.brain().shutdown(id)?;
    Ok((StatusCode::ACCEPTED, Json(ShutdownResponse { id })))
}

async fn backfill(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<Json<BackfillResponse>, ApiError> {
    let index = parse_class_index(&state, &index)?;
    let list = state.brain().backfill_list(index)?;
    Ok(Json(BackfillResponse { list }))
}

/// Parse a class index. Negative numbers are out of range rather than
/// malformed.
fn parse_class_index(state: &AppState, raw: &str) -> Result<usize, ApiError> {
    let value: i64 = raw.parse().map_err(|_| {
        ApiError::bad_request("invalid_index", format!("invalid class index: {raw}"))
    })?;

    usize::try_from(value).map_err(|_| {
        ApiError::bad_request(
            "index_out_of_range",
            format!(
                "class index {value} out of range ({} classes configured)",
                state.brain().classes().len()
            ),
        )
    })
}

pub(super) fn parse_worker_id(raw: &str) -> Result<WorkerId, ApiError> {
    WorkerId::parse(raw).map_err(|e| {
        ApiError::bad_request("invalid_worker_id", format!("invalid worker id {raw}: {e}"))
    })
}
