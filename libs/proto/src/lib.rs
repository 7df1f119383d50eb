//! Wire protocol spoken between workers and the fleet manager.
//!
//! A worker dials the manager once and then sends one [`HeartbeatMessage`]
//! per tick over that connection. Each message is a JSON object:
//!
//! ```text
//! {
//!   "worker_id": "<base64 of the 16 raw id bytes>",
//!   "connection_count": 3,
//!   "session_count": 2,
//!   "active_session_count": 1,
//!   "error_code": 2,            // 0 = fatal, 1 = warn, 2 = none
//!   "error_text": "..."         // only when error_code != 2
//! }
//! ```

mod error;
mod heartbeat;

pub use error::ProtoError;
pub use heartbeat::{ErrorCode, HeartbeatMessage};
