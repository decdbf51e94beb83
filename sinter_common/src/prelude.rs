//! Prelude module for common re-exports.
//!
//! ```rust
//! use sinter_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, DistributionConfig, HostConfig, LinkConfig, MovementConfig,
    SharedConfig,
};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{AXIS_COUNT, MAX_ARG_BUFFER_LEN};

// ─── Clock ──────────────────────────────────────────────────────────
pub use crate::clock::{ClockError, ClockModel, ClockState, host_time};
pub use crate::mcu::{McuId, McuTimestamp};

// ─── Commands ───────────────────────────────────────────────────────
pub use crate::catalog::{CommandCatalog, CommandFlags, CommandId, CommandPrototype};

// ─── Concurrency ────────────────────────────────────────────────────
pub use crate::cancel::CancelToken;
pub use crate::worker::{DedicatedWorker, FixedPool, Placement, WorkerError, WorkerEvent};
