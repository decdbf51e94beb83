//! Per-axis samples.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::fmt;

use sinter_common::consts::AXIS_COUNT;

/// Movement queue axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    /// Laser power.
    L,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::L];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::L => 2,
        }
    }

    /// X and Y carry positions; L carries power.
    #[inline]
    pub const fn is_positional(self) -> bool {
        !matches!(self, Axis::L)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::L => "L",
        };
        f.write_str(name)
    }
}

const_assert_eq!(Axis::ALL.len(), AXIS_COUNT);

/// One axis value at one point in time.
///
/// A time with the sign bit set marks a reset point; `-0.0` is a reset at
/// time zero. [`SamplePoint::true_time`] strips the marker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub time: f64,
    pub value: f64,
}

const_assert_eq!(core::mem::size_of::<SamplePoint>(), 16);

impl SamplePoint {
    #[inline]
    pub const fn new(time: f64, value: f64) -> Self {
        Self { time, value }
    }

    /// Reset marker at `time`.
    #[inline]
    pub fn reset(time: f64, value: f64) -> Self {
        Self {
            time: -time.abs(),
            value,
        }
    }

    #[inline]
    pub fn is_reset(&self) -> bool {
        self.time.is_sign_negative()
    }

    #[inline]
    pub fn true_time(&self) -> f64 {
        self.time.abs()
    }

    /// Same point without the reset marker.
    #[inline]
    #[must_use]
    pub fn unmarked(self) -> Self {
        Self::new(self.true_time(), self.value)
    }
}
