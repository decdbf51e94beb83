//! # Sinter Motion
//!
//! Host-side motion planning for the Sinter printer: turns dense X/Y
//! position and laser power samples into a rate-limited stream of MCU
//! instructions.
//!
//! ## Pipeline
//!
//! ```text
//! add_xy / add_l / add_reset
//!         │  (master lock)
//!         ▼
//! MovementQueue ──flush worker──► Compressor ──► TrapezoidCalculator
//!                                                      │
//!                                                      ▼
//!                        McuLink ◄── MinClockDistributor ◄── Stepper
//! ```
//!
//! ## Modules
//!
//! - [`trapezoid`] - Velocity profiles
//! - [`compress`] - Douglas–Peucker and PWM debounce compression
//! - [`distribute`] - Release-floor spreading for scheduled commands
//! - [`stepper`] - Per-axis instruction sinks
//! - [`queue`] / [`flush`] - Sample buffering and the flush worker
//! - [`pacing`] - Script streaming with lead control
//! - [`lock`] - Owner-tracking master lock

pub mod compress;
pub mod distribute;
pub mod error;
pub mod flush;
pub mod lock;
pub mod pacing;
pub mod queue;
pub mod sample;
pub mod stepper;
pub mod trapezoid;

pub use error::{MotionError, MotionResult};
pub use lock::{MasterGuard, MasterLock};
pub use queue::{AxisSteppers, FatalCallback, MovementQueue};
pub use sample::{Axis, SamplePoint};

/// Common imports for motion users.
pub mod prelude {
    pub use crate::compress::{Compressor, compress_moves, compress_pwm};
    pub use crate::distribute::{ClockRequest, MinClockDistributor};
    pub use crate::error::{MotionError, MotionResult};
    pub use crate::flush::{DiagnosticsSnapshot, FlushPhase};
    pub use crate::lock::MasterLock;
    pub use crate::pacing::{ClockLeadOracle, RemainingPrintTime, ScheduledCommand, ScriptStreamer};
    pub use crate::queue::{AxisSteppers, MovementQueue};
    pub use crate::sample::{Axis, SamplePoint};
    pub use crate::stepper::{LinkStepper, RecordingStepper, Stepper, StepperLog, StepperOp};
    pub use crate::trapezoid::{ProfileEntry, TrapezoidCalculator};
}
