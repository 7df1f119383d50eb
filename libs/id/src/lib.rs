//! # lift-id
//!
//! Typed identifiers for the lift fleet manager.
//!
//! ## Design Principles
//!
//! - IDs are system-generated at launch and never reused
//! - The canonical string form is a hyphenated UUID, which is what a worker
//!   receives on its command line and what the request layer accepts
//! - The raw 16-byte form is what a worker echoes back in every heartbeat
//! - IDs are typed so a worker id cannot be mixed up with any other string
//!
//! ## ID Format
//!
//! `WorkerId` wraps a random (v4) UUID:
//!
//! - `3f0c9a6e-8d1b-4c52-9a57-2c6c1f0e4b7d`
//!
//! Generation only touches the thread-safe OS random source, so there is no
//! shared counter to contend on.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
