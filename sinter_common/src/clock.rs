//! Host ↔ MCU clock model.
//!
//! A background estimator publishes [`ClockState`] snapshots; readers grab
//! one `Arc` per conversion so an update mid-call can never mix two lines.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use thiserror::Error;

/// Clock conversion failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClockError {
    /// No ready snapshot has been published yet.
    #[error("clock model not ready (no synchronisation received yet)")]
    NotReady,

    /// A ready snapshot whose tick rate is zero, negative or not finite.
    #[error("clock snapshot has an unusable frequency")]
    InvalidFrequency,
}

/// Immutable snapshot of the host→MCU clock regression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockState {
    /// Nominal MCU oscillator frequency [Hz].
    pub mcu_freq: f64,
    /// Host time of the regression anchor [s].
    pub sample_time: f64,
    /// MCU clock at `sample_time` [ticks].
    pub clock: f64,
    /// Estimated ticks per host second.
    pub freq: f64,
    /// Conversions are only valid once set.
    pub is_ready: bool,
}

impl ClockState {
    /// Snapshot used before the first synchronisation.
    pub const fn unready() -> Self {
        Self {
            mcu_freq: 0.0,
            sample_time: 0.0,
            clock: 0.0,
            freq: 0.0,
            is_ready: false,
        }
    }

    /// A ready snapshot anchored at `(sample_time, clock)` running at `freq`.
    pub const fn ready(mcu_freq: f64, sample_time: f64, clock: f64, freq: f64) -> Self {
        Self {
            mcu_freq,
            sample_time,
            clock,
            freq,
            is_ready: true,
        }
    }

    /// Fail unless conversions through this snapshot are meaningful.
    #[inline]
    pub fn check(&self) -> Result<(), ClockError> {
        if !self.is_ready {
            return Err(ClockError::NotReady);
        }
        if !(self.freq.is_finite() && self.freq > 0.0) {
            return Err(ClockError::InvalidFrequency);
        }
        Ok(())
    }

    /// MCU clock at host time `timestamp`.
    pub fn clock_of(&self, timestamp: f64) -> Result<f64, ClockError> {
        self.check()?;
        Ok(self.clock + (timestamp - self.sample_time) * self.freq)
    }

    /// Host time at MCU clock `clock`.
    pub fn timestamp_of(&self, clock: f64) -> Result<f64, ClockError> {
        self.check()?;
        Ok(self.sample_time + (clock - self.clock) / self.freq)
    }

    /// Seconds → ticks.
    pub fn duration_in_clock_ticks(&self, seconds: f64) -> Result<f64, ClockError> {
        self.check()?;
        Ok(seconds * self.freq)
    }

    /// Ticks → seconds.
    pub fn duration_in_seconds(&self, ticks: f64) -> Result<f64, ClockError> {
        self.check()?;
        Ok(ticks / self.freq)
    }
}

impl Default for ClockState {
    fn default() -> Self {
        Self::unready()
    }
}

/// Shared, atomically replaced clock snapshot.
#[derive(Debug)]
pub struct ClockModel {
    current: RwLock<Arc<ClockState>>,
}

impl ClockModel {
    /// New model holding an unready snapshot.
    pub fn new() -> Self {
        Self::with_state(ClockState::unready())
    }

    /// New model seeded with `state`.
    pub fn with_state(state: ClockState) -> Self {
        Self {
            current: RwLock::new(Arc::new(state)),
        }
    }

    /// Replace the current snapshot.
    ///
    /// # Errors
    ///
    /// `InvalidFrequency` if `state` is ready but its frequency is unusable;
    /// the previous snapshot stays in effect.
    pub fn update(&self, state: ClockState) -> Result<(), ClockError> {
        if state.is_ready {
            state.check()?;
        }
        let next = Arc::new(state);
        *self.current.write() = next;
        tracing::trace!(
            sample_time = state.sample_time,
            clock = state.clock,
            freq = state.freq,
            ready = state.is_ready,
            "clock snapshot updated"
        );
        Ok(())
    }

    /// The snapshot in effect right now.
    pub fn snapshot(&self) -> Arc<ClockState> {
        Arc::clone(&self.current.read())
    }

    pub fn is_ready(&self) -> bool {
        self.current.read().is_ready
    }

    pub fn clock_of(&self, timestamp: f64) -> Result<f64, ClockError> {
        self.snapshot().clock_of(timestamp)
    }

    pub fn timestamp_of(&self, clock: f64) -> Result<f64, ClockError> {
        self.snapshot().timestamp_of(clock)
    }

    pub fn duration_in_clock_ticks(&self, seconds: f64) -> Result<f64, ClockError> {
        self.snapshot().duration_in_clock_ticks(seconds)
    }

    pub fn duration_in_seconds(&self, ticks: f64) -> Result<f64, ClockError> {
        self.snapshot().duration_in_seconds(ticks)
    }
}

impl Default for ClockModel {
    fn default() -> Self {
        Self::new()
    }
}

static HOST_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Process-wide monotonic host time [s].
pub fn host_time() -> f64 {
    HOST_EPOCH.elapsed().as_secs_f64()
}
