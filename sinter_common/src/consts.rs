//! System-wide constants for the Sinter workspace.
//!
//! Single source of truth for numeric limits and configuration defaults.
//! Imported by all crates; no duplication permitted.

/// Number of motion axes handled by the movement queue (X, Y, laser power).
pub const AXIS_COUNT: usize = 3;

/// Maximum byte length of a single buffer-backed command argument.
///
/// The wire format carries the length in one byte.
pub const MAX_ARG_BUFFER_LEN: usize = u8::MAX as usize;

/// Maximum number of declared argument slots for one command prototype.
pub const MAX_COMMAND_ARGS: usize = 16;

/// Maximum encoded frame size accepted by a decoder [bytes].
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Substitute rate multiplier used for "instantaneous" acceleration.
pub const INSTANT_ACCEL_FACTOR: f64 = 1_000_000.0;

// ─── Movement defaults ──────────────────────────────────────────────

/// Default flush period [s].
pub const FLUSH_PERIOD_DEFAULT: f64 = 0.25;
/// Minimum accepted flush period [s].
pub const FLUSH_PERIOD_MIN: f64 = 0.005;
/// Maximum accepted flush period [s].
pub const FLUSH_PERIOD_MAX: f64 = 10.0;

/// Default X/Y move budget [moves/s].
pub const XY_MOVES_PER_SECOND_DEFAULT: f64 = 200.0;
/// Default laser power change budget [changes/s].
pub const L_CHANGES_PER_SECOND_DEFAULT: f64 = 400.0;
/// Upper bound for any per-axis rate [1/s].
pub const AXIS_RATE_MAX: f64 = 100_000.0;

/// Default compression factor (1.0 = use the full budget).
pub const COMPRESSION_FACTOR_DEFAULT: f64 = 1.0;

/// Default minimum position deviation kept by compression [mm].
pub const MIN_POSITION_EPSILON_DEFAULT: f64 = 0.005;
/// Default minimum laser pulse/gap duration kept by compression [s].
pub const MIN_TIME_EPSILON_DEFAULT: f64 = 0.0002;
/// Default minimum laser power change kept by compression [0..1].
pub const MIN_POWER_EPSILON_DEFAULT: f64 = 0.004;

/// Default lower velocity clamp applied to emitted moves [mm/s].
pub const CLAMP_MIN_VELOCITY_DEFAULT: f64 = 0.01;
/// Default upper velocity clamp applied to emitted moves [mm/s].
pub const CLAMP_MAX_VELOCITY_DEFAULT: f64 = 10_000.0;

/// Default interval between flush diagnostic log lines [s].
pub const DIAGNOSTICS_INTERVAL_DEFAULT: f64 = 5.0;

// ─── Link defaults ──────────────────────────────────────────────────

/// Default Unix socket path of the device-side endpoint.
pub const DEFAULT_SOCKET_PATH: &str = "/run/sinter/link.sock";

/// Default number of parallel command channels.
pub const LINK_CHANNELS_DEFAULT: usize = 4;
/// Maximum number of parallel command channels.
pub const LINK_CHANNELS_MAX: usize = 64;

/// Default bounded wait for a `send_wait` round trip [ms].
pub const SEND_WAIT_TIMEOUT_MS_DEFAULT: u32 = 2_000;

/// Outstanding pooled commands above which a leak warning is logged.
pub const OUTSTANDING_WARN_DEFAULT: usize = 10_000;

/// Default simulated clock-sync emission interval [ms].
pub const CLOCK_SYNC_INTERVAL_MS_DEFAULT: u32 = 1_000;

/// Poll slice used by cancellable blocking waits [ms].
pub const CANCEL_POLL_MS: u64 = 10;

// ─── Distribution defaults ──────────────────────────────────────────

/// Default minimum send-ahead [s].
pub const MIN_SEND_AHEAD_DEFAULT: f64 = 0.1;
/// Default maximum send-ahead [s].
pub const MAX_SEND_AHEAD_DEFAULT: f64 = 1.0;
