//! Motion error taxonomy.

use sinter_common::clock::ClockError;
use sinter_common::worker::WorkerError;
use sinter_link::LinkError;
use thiserror::Error;

use crate::sample::Axis;

/// Failure raised by the motion layer.
#[derive(Debug, Error)]
pub enum MotionError {
    /// A caller passed a value outside the documented domain.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal numeric invariant did not hold.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Sample older than the last one queued on the same axis.
    #[error("Non-monotonic sample on {axis}: {time}s is before {last}s")]
    NonMonotonicSample { axis: Axis, time: f64, last: f64 },

    /// The stepper can no longer meet its schedule; host and device
    /// positions must be re-synchronised with a hard reset.
    #[error("Stepper reset necessary on {axis}: {reason}")]
    ResetNecessary { axis: Axis, reason: String },

    /// Flush lock requested by a thread holding the master lock.
    #[error("Flush requested while holding the master lock")]
    LockOrder,

    #[error("Worker stopped: {0}")]
    WorkerStopped(#[from] WorkerError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Clock error: {0}")]
    Clock(#[from] ClockError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// An earlier flush failed fatally; the queue accepts no more work.
    #[error("Movement queue stopped: {0}")]
    Fatal(String),
}

impl MotionError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// True for failures that must terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ResetNecessary { .. } | Self::Fatal(_))
    }
}

/// Result type alias for motion operations.
pub type MotionResult<T> = Result<T, MotionError>;
