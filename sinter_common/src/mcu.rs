//! MCU identity and scheduling handles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one attached microcontroller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct McuId(pub u8);

impl fmt::Display for McuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mcu{}", self.0)
    }
}

/// "Execute no earlier than this tick" handle.
///
/// Owned by whichever stepper last advanced it; the movement queue keeps
/// one cursor per axis and threads it through flushes by value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct McuTimestamp {
    pub mcu: McuId,
    /// MCU clock tick.
    pub clock: i64,
    /// Width of the scheduling interval [ticks].
    pub precision: u32,
}

impl McuTimestamp {
    pub const fn new(mcu: McuId, clock: i64, precision: u32) -> Self {
        Self {
            mcu,
            clock,
            precision,
        }
    }

    /// Same MCU, different tick.
    #[must_use]
    pub const fn at(self, clock: i64) -> Self {
        Self { clock, ..self }
    }

    /// Move the cursor forward by `ticks` (saturating).
    pub fn advance(&mut self, ticks: i64) {
        self.clock = self.clock.saturating_add(ticks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_and_at() {
        let mut ts = McuTimestamp::new(McuId(1), 100, 4);
        ts.advance(50);
        assert_eq!(ts.clock, 150);
        let moved = ts.at(10);
        assert_eq!(moved.clock, 10);
        assert_eq!(moved.mcu, McuId(1));
        assert_eq!(moved.precision, 4);
    }

    #[test]
    fn advance_saturates() {
        let mut ts = McuTimestamp::new(McuId(0), i64::MAX - 1, 0);
        ts.advance(10);
        assert_eq!(ts.clock, i64::MAX);
    }

    #[test]
    fn display() {
        assert_eq!(McuId(3).to_string(), "mcu3");
    }
}
