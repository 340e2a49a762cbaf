//! Object caching and all-CPU rendezvous support for per-CPU driver code
//!
//! Two independent components live here:
//!
//! * [pool]: a slab-backed object cache with small per-CPU "magazine"
//!   free-lists on the get/put fast path, a reservation/cap sizing policy,
//!   and a [registry] that periodically resizes every registered pool
//!   toward its reservation.
//! * [rendezvous]: a barrier that captures every logical processor in a
//!   spinning state so that interrupts can be disabled machine-wide and
//!   caller-supplied callbacks run in a known code context (the building
//!   block for suspend/resume-style state transitions).
//!
//! Neither component picks its own execution environment: pools take a
//! [lockops::LockOps] capability from their owner, and the rendezvous takes
//! [rendezvous::Dispatcher] and [rendezvous::InterruptOps] capabilities, so
//! everything is testable in-process with plain threads.

use std::error::Error;
use std::fmt::Display;

pub mod lockops;
pub mod loom_testing;
pub mod mask;
pub mod pool;
pub mod registry;
pub mod rendezvous;
pub mod util;

/// Failure conditions a pool reports to its caller
///
/// All of these are recoverable: the caller decides whether "no object right
/// now" is retry-later or a hard error. Invariant violations inside the pool
/// are never reported this way; those panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Backing allocation failed, or a lazy constructor failed
    NoMemory,
    /// Growing would exceed the pool's configured cap
    InsufficientResources,
    /// Rejected at creation time (e.g. reservation > cap)
    InvalidParameter,
}

impl Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::NoMemory => write!(f, "out of memory"),
            PoolError::InsufficientResources => write!(f, "pool cap reached"),
            PoolError::InvalidParameter => write!(f, "invalid pool parameter"),
        }
    }
}

impl Error for PoolError {}
