//! Domain-specific error types
//!
//! Library operations return these typed errors; binaries and setup code wrap
//! them in `anyhow` with context.

use crate::core::control_fsm::{FlattenReason, PhaseKind};
use crate::core::types::{CorrelationId, Symbol};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failures creating, attaching to, or destroying a shared-memory segment
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory segment '{key}' already exists")]
    AlreadyExists { key: String },

    #[error("shared memory segment '{key}' does not exist")]
    NotFound { key: String },

    #[error("shared memory segment '{key}' is {found} bytes, expected at least {expected}")]
    SizeMismatch {
        key: String,
        expected: usize,
        found: usize,
    },

    /// Destroy refused because another process still holds the segment
    #[error("shared memory segment '{key}' is still attached by another process")]
    StillAttached { key: String },

    #[error("shared memory segment '{key}' is attached, only its creator may destroy it")]
    NotOwner { key: String },

    #[error("invalid ring layout: {0}")]
    InvalidLayout(String),

    #[error("{op} failed for '{key}': {source}")]
    Os {
        op: &'static str,
        key: String,
        #[source]
        source: io::Error,
    },
}

impl ShmError {
    pub(crate) fn os(op: &'static str, key: impl Into<String>, source: io::Error) -> Self {
        ShmError::Os {
            op,
            key: key.into(),
            source,
        }
    }
}

/// A reader's expected sequence number was overtaken by the writers
///
/// `found` is the sequence observed in the reader's slot; `missed` counts the
/// messages skipped when the reader resumed at the oldest retained one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transport gap on {queue}: expected seq {expected}, found {found} ({missed} missed)")]
pub struct TransportGap {
    pub queue: &'static str,
    pub expected: u64,
    pub found: u64,
    pub missed: u64,
}

impl TransportGap {
    pub fn new(queue: &'static str, expected: u64, found: u64, missed: u64) -> Self {
        Self {
            queue,
            expected,
            found,
            missed,
        }
    }
}

/// Rejected control-state transitions; the state is unchanged when returned
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("illegal transition: {action} from {from}")]
    IllegalTransition {
        from: PhaseKind,
        action: &'static str,
    },

    #[error("recovery not ready, {remaining:?} of cooldown remaining")]
    RecoveryNotReady { remaining: Duration },

    #[error("flatten reason {reason} does not auto-recover")]
    NotRecoverable { reason: FlattenReason },

    #[error("position is not flat")]
    PositionNotFlat,

    #[error("{pending} order(s) still pending")]
    OrdersPending { pending: usize },
}

/// Reasons an order intent or cancel was not put on the request queue
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    #[error("order sending blocked (phase={phase}, active={active})")]
    Blocked { phase: PhaseKind, active: bool },

    #[error("invalid quantity {quantity}")]
    InvalidQuantity { quantity: u32 },

    #[error("invalid price {price}")]
    InvalidPrice { price: f64 },

    #[error("unknown instrument {symbol}")]
    UnknownInstrument { symbol: Symbol },

    #[error("position limit on {symbol}: projected {projected} exceeds {limit}")]
    PositionLimit {
        symbol: Symbol,
        projected: i64,
        limit: i64,
    },

    #[error("order {id} is not pending")]
    NotPending { id: CorrelationId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_missed_count() {
        let gap = TransportGap::new("order_response", 10, 14, 4);
        assert_eq!(gap.missed, 4);
        let msg = gap.to_string();
        assert!(msg.contains("expected seq 10"));
        assert!(msg.contains("found 14"));
    }

    #[test]
    fn test_control_error_display() {
        let err = ControlError::IllegalTransition {
            from: PhaseKind::Exiting,
            action: "try_recover",
        };
        assert_eq!(err.to_string(), "illegal transition: try_recover from exiting");
    }

    #[test]
    fn test_shm_error_source() {
        use std::error::Error as _;
        let err = ShmError::os("shmget", "0xf20", io::Error::from_raw_os_error(libc::ENOENT));
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("shmget failed for '0xf20'"));
    }
}
