//! Networking utilities for the fleet manager.
//!
//! This library provides:
//! - `Port`, a 16-bit port number where zero is the "empty" sentinel
//! - `PortPool`, a fixed range of ports handed out to workers
//!
//! ## Port Pool
//!
//! The pool keeps a FIFO of free ports plus a per-port in-use flag. Every
//! transition goes through a compare-and-swap on that flag, so a concurrent
//! double-issue or double-return is detected and rejected instead of
//! corrupting the pool.
//!
//! ```text
//!   next():    free queue head ──CAS(free→in-use)──► caller
//!   release(): caller ──CAS(in-use→free)──► free queue tail
//! ```
//!
//! Returned ports go to the tail, so reuse spreads across the whole range.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

/// Port pool errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// No free port is left in the pool.
    #[error("port pool exhausted")]
    Exhausted,

    /// The free queue and the in-use flags disagree.
    #[error("port {0} is queued as free but flagged in use")]
    ConsistencyFault(u16),

    /// The zero port was passed where a real port is required.
    #[error("invalid port number zero")]
    InvalidZero,

    /// The port is not currently issued by this pool.
    #[error("port {0} is not in use")]
    NotInUse(u16),

    /// The pool parameters are invalid.
    #[error("invalid port pool parameters: {0}")]
    InvalidParams(String),
}

// ============================================================================
// Port
// ============================================================================

/// A port number. Zero is reserved as the "empty" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Port(u16);

impl Port {
    /// The empty sentinel.
    pub const EMPTY: Port = Port(0);

    /// Wrap a port number.
    pub const fn new(number: u16) -> Self {
        Self(number)
    }

    /// The raw port number.
    pub const fn number(&self) -> u16 {
        self.0
    }

    /// True for the zero sentinel.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

// ============================================================================
// Port Pool
// ============================================================================

/// Parameters for a port pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPoolParams {
    /// First port of the range.
    pub start_from: u16,

    /// Number of sequential ports in the range.
    pub capacity: u16,
}

/// Point-in-time view of a port pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortPoolInfo {
    /// Number of ports currently free.
    pub current_capacity: usize,

    /// Port the next `next()` would hand out, or the empty port.
    pub peek: Port,
}

/// A fixed range of ports handed out in FIFO order.
#[derive(Debug)]
pub struct PortPool {
    params: PortPoolParams,
    free: Mutex<VecDeque<Port>>,
    in_use: Box<[AtomicBool]>,
}

impl PortPool {
    /// Create a pool holding `capacity` sequential ports starting at `start_from`.
    pub fn new(params: PortPoolParams) -> Result<Self, PortError> {
        if params.start_from == 0 {
            return Err(PortError::InvalidZero);
        }
        if params.capacity == 0 {
            return Err(PortError::InvalidParams("zero capacity".to_string()));
        }

        let last = u32::from(params.start_from) + u32::from(params.capacity) - 1;
        if last > u32::from(u16::MAX) {
            return Err(PortError::InvalidParams(format!(
                "range {}..={} exceeds {}",
                params.start_from,
                last,
                u16::MAX
            )));
        }

        let free: VecDeque<Port> = (0..params.capacity)
            .map(|offset| Port(params.start_from + offset))
            .collect();
        let in_use = (0..params.capacity)
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            params,
            free: Mutex::new(free),
            in_use,
        })
    }

    /// Total number of ports managed by the pool.
    pub fn capacity(&self) -> usize {
        self.in_use.len()
    }

    /// Issue the next free port.
    ///
    /// On `ConsistencyFault` the popped port is not queued again. It is
    /// already flagged in use, so the release by its current holder is what
    /// puts it back on the tail.
    pub fn next(&self) -> Result<Port, PortError> {
        let port = self.free.lock().pop_front().ok_or(PortError::Exhausted)?;

        let flag = self
            .flag(port)
            .ok_or(PortError::ConsistencyFault(port.number()))?;
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PortError::ConsistencyFault(port.number()))?;

        Ok(port)
    }

    /// Return an issued port to the tail of the free queue.
    pub fn release(&self, port: Port) -> Result<(), PortError> {
        if port.is_empty() {
            return Err(PortError::InvalidZero);
        }

        let flag = self.flag(port).ok_or(PortError::NotInUse(port.number()))?;
        flag.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PortError::NotInUse(port.number()))?;

        self.free.lock().push_back(port);
        Ok(())
    }

    /// True if the port belongs to this pool and is currently issued.
    pub fn is_in_use(&self, port: Port) -> bool {
        self.flag(port)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Current free count and the port at the head of the queue.
    pub fn info(&self) -> PortPoolInfo {
        let free = self.free.lock();
        PortPoolInfo {
            current_capacity: free.len(),
            peek: free.front().copied().unwrap_or(Port::EMPTY),
        }
    }

    fn flag(&self, port: Port) -> Option<&AtomicBool> {
        let offset = port.number().checked_sub(self.params.start_from)?;
        self.in_use.get(usize::from(offset))
    }
}
