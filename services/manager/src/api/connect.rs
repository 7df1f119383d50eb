//! Heartbeat connection endpoint.
//!
//! - GET /connect/{id} (WebSocket)
//!
//! A worker dials this once after start-up and then streams heartbeat
//! messages as text or binary frames holding the JSON wire form.

use async_trait::async_trait;
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, Path, State},
    response::Response,
    routing::get,
    Router,
};
use lift_proto::HeartbeatMessage;
use tracing::{debug, warn};

use crate::heartbeat::{HeartbeatConnection, HeartbeatError};
use crate::state::AppState;

use super::error::ApiError;
use super::workers::parse_worker_id;

pub fn routes() -> Router<AppState> {
    Router::new().route("/connect/{id}", get(connect))
}

async fn connect(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let id = parse_worker_id(&id)?;
    // Refused with a plain HTTP status, before the upgrade.
    state.brain().ensure_connectable(id)?;

    let brain = state.brain().clone();
    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = brain.connect(id, WsConnection::new(socket)) {
            warn!(worker_id = %id, error = %e, "Heartbeat connection rejected after upgrade");
        }
    }))
}

/// A heartbeat connection over an axum WebSocket.
pub struct WsConnection {
    socket: WebSocket,
}

impl WsConnection {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl HeartbeatConnection for WsConnection {
    async fn recv(&mut self) -> Result<HeartbeatMessage, HeartbeatError> {
        loop {
            let frame = self
                .socket
                .recv()
                .await
                .ok_or(HeartbeatError::Closed)?
                .map_err(|e| HeartbeatError::Transport(e.to_string()))?;

            match frame {
                Message::Text(text) => {
                    return Ok(HeartbeatMessage::decode(text.as_str().as_bytes())?);
                }
                Message::Binary(bytes) => return Ok(HeartbeatMessage::decode(&bytes)?),
                Message::Close(_) => return Err(HeartbeatError::Closed),
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.send(Message::Close(None)).await {
            debug!(error = %e, "Failed to send close frame");
        }
    }
}
