//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across all Sinter applications, plus the typed sections consumed by the
//! link and motion crates.
//!
//! # Usage
//!
//! ```rust,no_run
//! use sinter_common::config::{ConfigError, HostConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = HostConfig::load_validated(Path::new("sinter.toml"))?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::consts::{
    AXIS_RATE_MAX, CLAMP_MAX_VELOCITY_DEFAULT, CLAMP_MIN_VELOCITY_DEFAULT,
    CLOCK_SYNC_INTERVAL_MS_DEFAULT, COMPRESSION_FACTOR_DEFAULT, DEFAULT_SOCKET_PATH,
    DIAGNOSTICS_INTERVAL_DEFAULT, FLUSH_PERIOD_DEFAULT, FLUSH_PERIOD_MAX, FLUSH_PERIOD_MIN,
    L_CHANGES_PER_SECOND_DEFAULT, LINK_CHANNELS_DEFAULT, LINK_CHANNELS_MAX,
    MAX_SEND_AHEAD_DEFAULT, MIN_POSITION_EPSILON_DEFAULT, MIN_POWER_EPSILON_DEFAULT,
    MIN_SEND_AHEAD_DEFAULT, MIN_TIME_EPSILON_DEFAULT, OUTSTANDING_WARN_DEFAULT,
    SEND_WAIT_TIMEOUT_MS_DEFAULT, XY_MOVES_PER_SECOND_DEFAULT,
};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields shared across all Sinter applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "sinter-link-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: "sinter".to_string(),
        }
    }
}

// ─── Movement ───────────────────────────────────────────────────────

/// Movement queue and compression tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MovementConfig {
    /// Maximum buffered duration per axis before an immediate flush [s].
    pub flush_period: f64,
    /// Budget of emitted X/Y moves per second of motion.
    pub xy_moves_per_second: f64,
    /// Budget of emitted laser power changes per second of motion.
    pub l_changes_per_second: f64,
    /// Divides the per-axis budget; larger values compress harder.
    pub compression_factor: f64,
    /// Position deviation below which points are dropped [mm].
    pub min_position_epsilon: f64,
    /// Laser pulse/gap duration below which it is debounced [s].
    pub min_time_epsilon: f64,
    /// Laser power delta below which changes are coalesced.
    pub min_power_epsilon: f64,
    /// Lower clamp for emitted move velocity [mm/s].
    pub clamp_min_velocity: f64,
    /// Upper clamp for emitted move velocity [mm/s].
    pub clamp_max_velocity: f64,
    /// Run the three axis flush bodies on dedicated parallel workers.
    pub parallel_flush: bool,
    /// Interval between diagnostic log lines from the flush worker [s].
    pub diagnostics_interval: f64,
    /// CPU core the flush worker is pinned to (`rt` feature only).
    pub worker_cpu: Option<usize>,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            flush_period: FLUSH_PERIOD_DEFAULT,
            xy_moves_per_second: XY_MOVES_PER_SECOND_DEFAULT,
            l_changes_per_second: L_CHANGES_PER_SECOND_DEFAULT,
            compression_factor: COMPRESSION_FACTOR_DEFAULT,
            min_position_epsilon: MIN_POSITION_EPSILON_DEFAULT,
            min_time_epsilon: MIN_TIME_EPSILON_DEFAULT,
            min_power_epsilon: MIN_POWER_EPSILON_DEFAULT,
            clamp_min_velocity: CLAMP_MIN_VELOCITY_DEFAULT,
            clamp_max_velocity: CLAMP_MAX_VELOCITY_DEFAULT,
            parallel_flush: false,
            diagnostics_interval: DIAGNOSTICS_INTERVAL_DEFAULT,
            worker_cpu: None,
        }
    }
}

impl MovementConfig {
    /// Validate parameter bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(FLUSH_PERIOD_MIN..=FLUSH_PERIOD_MAX).contains(&self.flush_period) {
            return Err(ConfigError::ValidationError(format!(
                "flush_period {} out of range [{}, {}]",
                self.flush_period, FLUSH_PERIOD_MIN, FLUSH_PERIOD_MAX
            )));
        }
        for (name, rate) in [
            ("xy_moves_per_second", self.xy_moves_per_second),
            ("l_changes_per_second", self.l_changes_per_second),
        ] {
            if !(rate > 0.0 && rate <= AXIS_RATE_MAX) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} {rate} out of range (0, {AXIS_RATE_MAX}]"
                )));
            }
        }
        if !(self.compression_factor > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "compression_factor {} must be positive",
                self.compression_factor
            )));
        }
        for (name, eps) in [
            ("min_position_epsilon", self.min_position_epsilon),
            ("min_time_epsilon", self.min_time_epsilon),
            ("min_power_epsilon", self.min_power_epsilon),
        ] {
            if !(eps >= 0.0 && eps.is_finite()) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} {eps} must be finite and non-negative"
                )));
            }
        }
        if !(self.clamp_min_velocity > 0.0 && self.clamp_min_velocity < self.clamp_max_velocity) {
            return Err(ConfigError::ValidationError(format!(
                "clamp velocities must satisfy 0 < min ({}) < max ({})",
                self.clamp_min_velocity, self.clamp_max_velocity
            )));
        }
        if !(self.diagnostics_interval > 0.0) {
            return Err(ConfigError::ValidationError(
                "diagnostics_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Link ───────────────────────────────────────────────────────────

/// Transport endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Unix socket path of the device-side endpoint.
    pub socket_path: String,
    /// Number of parallel command channels (0 = available parallelism).
    pub channels: usize,
    /// Bounded wait for `send_wait` round trips [ms].
    pub send_wait_timeout_ms: u32,
    /// Outstanding pooled commands above which a leak warning is logged.
    pub outstanding_warn_threshold: usize,
    /// Clock-sync emission interval of the simulated backend [ms].
    pub clock_sync_interval_ms: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            channels: LINK_CHANNELS_DEFAULT,
            send_wait_timeout_ms: SEND_WAIT_TIMEOUT_MS_DEFAULT,
            outstanding_warn_threshold: OUTSTANDING_WARN_DEFAULT,
            clock_sync_interval_ms: CLOCK_SYNC_INTERVAL_MS_DEFAULT,
        }
    }
}

impl LinkConfig {
    /// Validate parameter bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.is_empty() {
            return Err(ConfigError::ValidationError(
                "socket_path cannot be empty".to_string(),
            ));
        }
        if self.channels > LINK_CHANNELS_MAX {
            return Err(ConfigError::ValidationError(format!(
                "channels {} out of range [0, {}]",
                self.channels, LINK_CHANNELS_MAX
            )));
        }
        if self.send_wait_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "send_wait_timeout_ms must be positive".to_string(),
            ));
        }
        if self.clock_sync_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "clock_sync_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective channel count, resolving `0` to the available parallelism.
    pub fn effective_channels(&self) -> usize {
        if self.channels == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(LINK_CHANNELS_DEFAULT)
                .min(LINK_CHANNELS_MAX)
        } else {
            self.channels
        }
    }
}

// ─── Distribution ───────────────────────────────────────────────────

/// Send-ahead window used by the min-clock distributor [s].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributionConfig {
    /// Commands are never released later than `requested - min_send_ahead`.
    pub min_send_ahead: f64,
    /// Commands should not be released earlier than `requested - max_send_ahead`.
    pub max_send_ahead: f64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            min_send_ahead: MIN_SEND_AHEAD_DEFAULT,
            max_send_ahead: MAX_SEND_AHEAD_DEFAULT,
        }
    }
}

impl DistributionConfig {
    /// Validate parameter bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_send_ahead >= 0.0 && self.min_send_ahead <= self.max_send_ahead) {
            return Err(ConfigError::ValidationError(format!(
                "send-ahead window must satisfy 0 <= min ({}) <= max ({})",
                self.min_send_ahead, self.max_send_ahead
            )));
        }
        Ok(())
    }
}

// ─── Host bundle ────────────────────────────────────────────────────

/// Complete host configuration file.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "sinter-host"
///
/// [movement]
/// flush_period = 0.25
/// parallel_flush = true
///
/// [link]
/// channels = 4
///
/// [distribution]
/// min_send_ahead = 0.1
/// max_send_ahead = 1.0
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Common service fields.
    #[serde(default)]
    pub shared: SharedConfig,
    /// Movement queue tuning.
    #[serde(default)]
    pub movement: MovementConfig,
    /// Transport tuning.
    #[serde(default)]
    pub link: LinkConfig,
    /// Send-ahead window.
    #[serde(default)]
    pub distribution: DistributionConfig,
}

impl HostConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.movement.validate()?;
        self.link.validate()?;
        self.distribution.validate()
    }

    /// Load from TOML and validate.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
