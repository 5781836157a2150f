//! # Session Load Balancing
//!
//! - [`slot`]: per-worker load accounting
//! - [`pool`]: the sticky [`SessionLoadBalancer`] and its [`SlotGuard`]
//!
//! A full pool yields [`Assignment::Rejected`], an ordinary value. The
//! blocking [`SessionLoadBalancer::acquire`] turns a rejection that outlives
//! its wait into [`BalancerError::Capacity`], which callers can tell apart
//! from backend failures.

pub mod pool;
pub mod slot;

pub use pool::{Assignment, LoadBalancingMetrics, Rejection, SessionLoadBalancer, SlotGuard};
pub use slot::{SelectionKey, WorkerId, WorkerLoad, WorkerSlot};

use crate::SessionId;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the balancer.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// No slot became available within the allowed wait.
    #[error("no worker slot for session {session} after {waited:?}: {reason}")]
    Capacity {
        /// Session that could not be placed.
        session: SessionId,
        /// Why the last attempt was refused.
        reason: Rejection,
        /// Time spent waiting.
        waited: Duration,
    },

    /// A worker with this id is already registered.
    #[error("worker {0} is already registered")]
    DuplicateWorker(WorkerId),

    /// No worker with this id is registered.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// A worker definition is malformed.
    #[error("invalid worker '{id}': {reason}")]
    InvalidWorker {
        /// Offending worker id.
        id: String,
        /// What is wrong with it.
        reason: String,
    },
}
