//! Sinter Common Library
//!
//! Shared building blocks for the Sinter host core: constants, TOML
//! configuration, the host ↔ MCU clock model, MCU scheduling handles, the
//! command catalog, dedicated workers and cooperative cancellation.
//!
//! # Module Structure
//!
//! - [`consts`] - Numeric limits and configuration defaults
//! - [`config`] - Configuration loading traits and typed sections
//! - [`clock`] - Atomically swapped clock snapshots and host time
//! - [`mcu`] - MCU identity and timestamp handles
//! - [`catalog`] - Command id → argument shape table
//! - [`worker`] - Dedicated worker threads and real-time placement
//! - [`cancel`] - Cancellation tokens
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use sinter_common::config::{ConfigLoader, HostConfig};
//! use sinter_common::clock::{ClockModel, ClockState};
//! ```

pub mod cancel;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod consts;
pub mod mcu;
pub mod prelude;
pub mod worker;
