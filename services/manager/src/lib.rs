//! lift manager
//!
//! Launches worker processes on demand, gives each a port and an id,
//! consumes their heartbeats, reclaims workers that go silent or idle, and
//! ranks live workers for backfill.
//!
//! ## Architecture
//!
//! - [`brain`]: the orchestrator (launch, shutdown, sweep, backfill)
//! - [`registry`]: concurrent map of live workers
//! - [`worker`]: one worker, its heartbeat loop and monitoring summary
//! - [`process`]: supervision of one OS process
//! - [`heartbeat`]: heartbeat connection seam
//! - [`api`]: HTTP and WebSocket surface

pub mod api;
pub mod brain;
pub mod config;
pub mod heartbeat;
pub mod process;
pub mod registry;
pub mod state;
pub mod task;
pub mod worker;

pub use brain::{Brain, BrainError, BrainParams, ProcessClass};
pub use config::Settings;
pub use registry::Registry;
