//! Heartbeat connections.
//!
//! A worker dials the manager and streams [`HeartbeatMessage`]s over a
//! persistent connection. The manager only needs to pull messages off it, so
//! the transport is hidden behind [`HeartbeatConnection`]: the HTTP layer
//! provides a WebSocket implementation, and [`ChannelConnection`] serves
//! tests and in-process embedding.

use std::time::Duration;

use async_trait::async_trait;
use lift_proto::{HeartbeatMessage, ProtoError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Why a heartbeat could not be consumed.
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("no heartbeat within {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed heartbeat: {0}")]
    Malformed(#[from] ProtoError),

    #[error("heartbeat for wrong worker: expected {expected}, received {received}")]
    ProtocolViolation { expected: String, received: String },

    #[error("worker reported fatal error: {0}")]
    Fatal(String),
}

/// Source of heartbeat messages from one worker.
#[async_trait]
pub trait HeartbeatConnection: Send + 'static {
    /// Wait for the next message.
    async fn recv(&mut self) -> Result<HeartbeatMessage, HeartbeatError>;

    /// Release the underlying transport.
    async fn close(&mut self) {}
}

/// In-memory connection fed through an mpsc channel.
pub struct ChannelConnection {
    rx: mpsc::Receiver<HeartbeatMessage>,
}

impl ChannelConnection {
    /// Create a connection and the sender that feeds it. Dropping the sender
    /// closes the connection.
    pub fn pair(buffer: usize) -> (mpsc::Sender<HeartbeatMessage>, ChannelConnection) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, ChannelConnection { rx })
    }
}

#[async_trait]
impl HeartbeatConnection for ChannelConnection {
    async fn recv(&mut self) -> Result<HeartbeatMessage, HeartbeatError> {
        self.rx.recv().await.ok_or(HeartbeatError::Closed)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
