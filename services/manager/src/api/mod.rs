//! HTTP API handlers and routing.

mod connect;
mod control;
pub mod error;
mod health;
mod workers;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use connect::WsConnection;

/// Create the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(workers::routes())
        .merge(connect::routes())
        .nest("/control", control::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
