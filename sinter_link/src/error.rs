//! Error types for link operations

use sinter_common::catalog::CommandId;
use std::fmt;
use thiserror::Error;

/// Kind discriminator of an exception raised by the MCU side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Any other failure.
    Generic,
    /// The request is not valid in the current MCU state.
    InvalidOperation,
    /// The MCU restarted itself; `reason` is its firmware reason code.
    AutomatedRestart {
        /// Firmware reason code
        reason: u8,
    },
    /// A bounded wait on the MCU side expired.
    Timeout,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "error"),
            Self::InvalidOperation => write!(f, "invalid operation"),
            Self::AutomatedRestart { reason } => write!(f, "automated restart (reason {reason})"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Exception as carried on the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct McuException {
    /// Discriminator
    pub kind: ExceptionKind,
    /// Human readable cause
    pub message: String,
}

impl McuException {
    /// Generic exception with `message`.
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            kind: ExceptionKind::Generic,
            message: message.into(),
        }
    }

    /// Invalid-operation exception with `message`.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self {
            kind: ExceptionKind::InvalidOperation,
            message: message.into(),
        }
    }

    /// Automated-restart exception.
    pub fn automated_restart(reason: u8, message: impl Into<String>) -> Self {
        Self {
            kind: ExceptionKind::AutomatedRestart { reason },
            message: message.into(),
        }
    }
}

/// Errors that can occur during link operations
#[derive(Error, Debug)]
pub enum LinkError {
    /// Malformed frame or payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame carries a message type outside the catalog
    #[error("Unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    /// Command id missing from the command catalog
    #[error("Unknown command id {0}")]
    UnknownCommand(CommandId),

    /// Argument buffer exceeds the single-byte length prefix
    #[error("Argument buffer of {len} bytes exceeds the {max} byte limit")]
    ArgumentTooLarge {
        /// Offending length
        len: usize,
        /// Limit
        max: usize,
    },

    /// Argument slot outside the command's arity
    #[error("Argument slot {slot} out of range for arity {arity}")]
    SlotOutOfRange {
        /// Requested slot
        slot: usize,
        /// Declared arity
        arity: usize,
    },

    /// The MCU connection is closed or broken
    #[error("MCU unreachable: {0}")]
    Unreachable(String),

    /// The MCU side raised an exception
    #[error("MCU exception: {0}")]
    Mcu(McuException),

    /// A bounded wait for a device round trip expired
    #[error("Timed out waiting for MCU response")]
    Timeout,

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The request is not valid in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// No backend registered under this name
    #[error("Backend '{0}' not found")]
    BackendNotFound(String),

    /// Peer closed the stream
    #[error("Stream closed by peer")]
    Closed,

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },
}

impl LinkError {
    /// Whether this error means the byte stream itself is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Closed | Self::Io { .. })
    }

    /// Whether this error is fatal to a stream's read loop.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::UnknownMessageType(_)
                | Self::UnknownCommand(_)
                | Self::ArgumentTooLarge { .. }
                | Self::SlotOutOfRange { .. }
        )
    }

    /// Wire representation of this error for an exception reply.
    pub fn to_exception(&self) -> McuException {
        match self {
            Self::Mcu(exc) => exc.clone(),
            Self::InvalidOperation(message) => McuException::invalid_operation(message.clone()),
            Self::Timeout => McuException {
                kind: ExceptionKind::Timeout,
                message: self.to_string(),
            },
            other => McuException::generic(other.to_string()),
        }
    }
}

impl From<McuException> for LinkError {
    fn from(exc: McuException) -> Self {
        match exc.kind {
            ExceptionKind::InvalidOperation => Self::InvalidOperation(exc.message),
            ExceptionKind::Timeout => Self::Timeout,
            _ => Self::Mcu(exc),
        }
    }
}

/// Result type for link operations
pub type LinkResult<T> = Result<T, LinkError>;
