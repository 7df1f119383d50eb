//! Error types for the wire protocol.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The payload is not a valid heartbeat message.
    #[error("malformed heartbeat: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The error code is outside the known range.
    #[error("unknown error code: {0}")]
    UnknownErrorCode(u8),
}
