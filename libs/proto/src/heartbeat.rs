//! Heartbeat message sent periodically by every worker.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lift_id::WorkerId;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Health code a worker attaches to a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ErrorCode {
    /// The worker cannot continue and should be reclaimed.
    Fatal,
    /// Something is off but the worker keeps serving.
    Warn,
    /// Healthy.
    #[default]
    None,
}

impl TryFrom<u8> for ErrorCode {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorCode::Fatal),
            1 => Ok(ErrorCode::Warn),
            2 => Ok(ErrorCode::None),
            other => Err(ProtoError::UnknownErrorCode(other)),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Fatal => 0,
            ErrorCode::Warn => 1,
            ErrorCode::None => 2,
        }
    }
}

/// One heartbeat from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Raw id bytes the worker was launched with. Kept as bytes so a
    /// malformed id still decodes and is caught by the id comparison.
    #[serde(with = "raw_id")]
    pub worker_id: Vec<u8>,

    /// Live client connections.
    pub connection_count: i64,

    /// Sessions hosted, active or not.
    pub session_count: i64,

    /// Sessions currently in play.
    pub active_session_count: i64,

    /// Health code.
    #[serde(default)]
    pub error_code: ErrorCode,

    /// Human-readable detail for a warn/fatal code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl HeartbeatMessage {
    /// A healthy report for the given worker.
    pub fn report(
        worker_id: &WorkerId,
        connection_count: i64,
        session_count: i64,
        active_session_count: i64,
    ) -> Self {
        Self {
            worker_id: worker_id.as_bytes().to_vec(),
            connection_count,
            session_count,
            active_session_count,
            error_code: ErrorCode::None,
            error_text: None,
        }
    }

    /// Attach a warn/fatal code and its text.
    pub fn with_error(mut self, code: ErrorCode, text: impl Into<String>) -> Self {
        self.error_code = code;
        self.error_text = match code {
            ErrorCode::None => None,
            _ => Some(text.into()),
        };
        self
    }

    /// True if the embedded raw id is exactly this worker's id.
    pub fn is_from(&self, worker_id: &WorkerId) -> bool {
        self.worker_id.as_slice() == worker_id.as_bytes()
    }

    /// The error text, or an empty string.
    pub fn error_text(&self) -> &str {
        self.error_text.as_deref().unwrap_or_default()
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire form.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

mod raw_id {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
