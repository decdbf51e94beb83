//! # Sinter Link
//!
//! Everything between the host's motion code and an MCU: the command values
//! and their pool, the binary wire codec, the [`McuLink`] call surface and
//! the two transport endpoints that carry it across a process boundary.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐  N command streams  ┌──────────────────────┐
//! │ ControllerEndpoint   ├────────────────────►│ DeviceEndpoint       │
//! │  (impl McuLink)      │◄────────────────────┤                      │
//! │                      │   1 event stream    │  backend: McuLink    │
//! └──────────────────────┘                     │  (SimulatedMcu, ...) │
//!                                              └──────────────────────┘
//! ```
//!
//! Every stream is a sequence of `[len u32][type u8][payload]` frames; see
//! [`protocol`] for the catalog.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sinter_link::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = CommandPool::new(Arc::new(CommandCatalog::builtin()));
//! let link = ControllerEndpoint::connect("/run/sinter/link.sock", 4, pool)?;
//! let cmd = link.pool().acquire(ids::GET_CLOCK)?;
//! let reply = link.send_wait(cmd, ids::CLOCK, std::time::Duration::from_secs(1), &CancelToken::none())?;
//! println!("mcu clock: {:?}", reply.scalar(0));
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod command;
pub mod controller;
pub mod device;
pub mod error;
pub mod link;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod simulation;

pub use controller::ControllerEndpoint;
pub use device::DeviceEndpoint;
pub use error::{ExceptionKind, LinkError, LinkResult, McuException};
pub use link::{EventCallback, HandlerHandle, LinkEvent, McuLink, ResponseCallback};
pub use pool::{CommandPool, PooledCommand};
pub use registry::{BackendOptions, BackendRegistry};
pub use simulation::{SimulatedMcu, SimulationOptions};

/// Common imports for link users.
pub mod prelude {
    pub use crate::command::{Command, CommandArg};
    pub use crate::controller::ControllerEndpoint;
    pub use crate::device::DeviceEndpoint;
    pub use crate::error::{LinkError, LinkResult, McuException};
    pub use crate::link::{HandlerHandle, LinkEvent, McuLink};
    pub use crate::pool::{CommandPool, PooledCommand};
    pub use sinter_common::cancel::CancelToken;
    pub use sinter_common::catalog::{CommandCatalog, CommandId, ids};
}

/// Initialize tracing for link diagnostics.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
