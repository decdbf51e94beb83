//! Trapezoidal velocity profiles.
//!
//! A move from `start` to `end` is split into up to three constant-acceleration
//! segments (accelerate, cruise, decelerate). Each segment appends its end
//! points to the calculator's profile; the stepper consumes the profile as a
//! list of `(timestamp, velocity, position)` entries.
//!
//! Zero acceleration or deceleration means "instant": the rate is replaced
//! by `INSTANT_ACCEL_FACTOR × max_velocity` and the matching boundary
//! velocity is pinned to `max_velocity`.

use serde::{Deserialize, Serialize};
use sinter_common::config::MovementConfig;
use sinter_common::consts::INSTANT_ACCEL_FACTOR;

use crate::error::{MotionError, MotionResult};

/// Relative slack allowed on the computed peak velocity.
const PEAK_TOLERANCE: f64 = 1e-9;

/// One point of a velocity profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    /// Host time [s].
    pub timestamp: f64,
    /// Signed by the direction of travel [units/s].
    pub velocity: f64,
    pub position: f64,
}

/// Appends velocity profiles to an internal entry list.
#[derive(Debug, Clone)]
pub struct TrapezoidCalculator {
    clamp_min: f64,
    clamp_max: f64,
    entries: Vec<ProfileEntry>,
}

impl TrapezoidCalculator {
    /// # Arguments
    ///
    /// * `clamp_min` - Lower bound applied to every segment speed
    /// * `clamp_max` - Upper bound applied to every segment speed
    ///
    /// # Errors
    ///
    /// `InvalidArgument` unless `0 <= clamp_min <= clamp_max` and `clamp_max > 0`.
    pub fn new(clamp_min: f64, clamp_max: f64) -> MotionResult<Self> {
        if !(clamp_min >= 0.0 && clamp_max > 0.0 && clamp_min <= clamp_max && clamp_max.is_finite()) {
            return Err(MotionError::invalid(format!(
                "velocity clamps must satisfy 0 <= min ({clamp_min}) <= max ({clamp_max})"
            )));
        }
        Ok(Self {
            clamp_min,
            clamp_max,
            entries: Vec::with_capacity(8),
        })
    }

    pub fn from_config(config: &MovementConfig) -> MotionResult<Self> {
        Self::new(config.clamp_min_velocity, config.clamp_max_velocity)
    }

    pub fn entries(&self) -> &[ProfileEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[inline]
    fn push(&mut self, entry: ProfileEntry) {
        if self.entries.last() != Some(&entry) {
            self.entries.push(entry);
        }
    }

    #[inline]
    fn clamp(&self, v: f64) -> f64 {
        v.clamp(self.clamp_min, self.clamp_max)
    }

    /// Append one constant-acceleration segment.
    ///
    /// Speeds are clamped into the configured range first; the duration is
    /// `|p1 - p0| · 2 / (v0 + v1)`.
    ///
    /// # Returns
    ///
    /// Timestamp at the end of the segment.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for non-finite input, or a non-zero distance with a
    /// zero speed sum.
    pub fn move_segment(&mut self, v0: f64, v1: f64, p0: f64, p1: f64, t: f64) -> MotionResult<f64> {
        if ![v0, v1, p0, p1, t].iter().all(|x| x.is_finite()) {
            return Err(MotionError::invalid("segment arguments must be finite"));
        }
        let distance = (p1 - p0).abs();
        if distance == 0.0 {
            return Ok(t);
        }
        let (v0, v1) = (self.clamp(v0.abs()), self.clamp(v1.abs()));
        let speed_sum = v0 + v1;
        if speed_sum <= 0.0 {
            return Err(MotionError::invalid(format!(
                "zero speed over a distance of {distance}"
            )));
        }

        let sign = if p1 >= p0 { 1.0 } else { -1.0 };
        let end = t + distance * 2.0 / speed_sum;
        self.push(ProfileEntry {
            timestamp: t,
            velocity: sign * v0,
            position: p0,
        });
        self.push(ProfileEntry {
            timestamp: end,
            velocity: sign * v1,
            position: p1,
        });
        Ok(end)
    }

    /// Append a full trapezoidal move.
    ///
    /// # Arguments
    ///
    /// * `vi`, `vf` - Boundary speeds (>= 0), clamped to `vmax`
    /// * `accel`, `decel` - Rates (>= 0); zero means instant
    /// * `vmax` - Cruise speed (> 0)
    /// * `start`, `end` - Positions
    /// * `t` - Start timestamp
    ///
    /// # Returns
    ///
    /// Timestamp at the end of the move.
    #[allow(clippy::too_many_arguments)]
    pub fn move_profile(
        &mut self,
        vi: f64,
        vf: f64,
        accel: f64,
        decel: f64,
        vmax: f64,
        start: f64,
        end: f64,
        t: f64,
    ) -> MotionResult<f64> {
        if ![vi, vf, accel, decel, vmax, start, end, t]
            .iter()
            .all(|x| x.is_finite())
        {
            return Err(MotionError::invalid("move arguments must be finite"));
        }
        if vi < 0.0 || vf < 0.0 || accel < 0.0 || decel < 0.0 {
            return Err(MotionError::invalid(format!(
                "negative velocity or rate (vi={vi}, vf={vf}, a={accel}, d={decel})"
            )));
        }
        if vmax <= 0.0 {
            return Err(MotionError::invalid(format!(
                "max velocity must be positive, got {vmax}"
            )));
        }

        let mut vi = vi.min(vmax);
        let mut vf = vf.min(vmax);
        let a = if accel == 0.0 {
            vi = vmax;
            INSTANT_ACCEL_FACTOR * vmax
        } else {
            accel
        };
        let d = if decel == 0.0 {
            vf = vmax;
            INSTANT_ACCEL_FACTOR * vmax
        } else {
            decel
        };

        let distance = (end - start).abs();
        if distance == 0.0 {
            return Ok(t);
        }
        let sign = if end >= start { 1.0 } else { -1.0 };

        // ── Single segment: cannot reach the other boundary speed in time ──
        if vi >= vf && (vi * vi - vf * vf) / (2.0 * d) >= distance {
            return self.move_segment(vi, vf, start, end, t);
        }
        if vf > vi && (vf * vf - vi * vi) / (2.0 * a) >= distance {
            return self.move_segment(vi, vf, start, end, t);
        }

        // ── Full trapezoid ──
        let accel_distance = (vmax * vmax - vi * vi) / (2.0 * a);
        let decel_distance = (vmax * vmax - vf * vf) / (2.0 * d);
        if accel_distance + decel_distance <= distance {
            let accel_end = start + sign * accel_distance;
            let decel_start = end - sign * decel_distance;
            let t = self.move_segment(vi, vmax, start, accel_end, t)?;
            let t = self.move_segment(vmax, vmax, accel_end, decel_start, t)?;
            return self.move_segment(vmax, vf, decel_start, end, t);
        }

        // ── Triangle: peak below cruise speed ──
        let peak = ((a + d) * (2.0 * a * d * distance + a * vf * vf + d * vi * vi)).sqrt() / (a + d);
        if !(peak > 0.0 && peak <= vmax * (1.0 + PEAK_TOLERANCE)) {
            return Err(MotionError::invariant(format!(
                "peak velocity {peak} outside (0, {vmax}]"
            )));
        }
        let peak = peak.min(vmax);
        let rise = ((peak * peak - vi * vi) / (2.0 * a)).clamp(0.0, distance);
        let peak_position = start + sign * rise;
        let t = self.move_segment(vi, peak, start, peak_position, t)?;
        self.move_segment(peak, vf, peak_position, end, t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn calc() -> TrapezoidCalculator {
        TrapezoidCalculator::new(0.0, 1.0e6).unwrap()
    }

    fn travelled(entries: &[ProfileEntry]) -> f64 {
        entries
            .windows(2)
            .map(|w| (w[1].position - w[0].position).abs())
            .sum()
    }

    #[test]
    fn instant_rates_reduce_to_cruise() {
        let mut c = calc();
        let end = c.move_profile(0.0, 0.0, 0.0, 0.0, 100.0, 0.0, 10.0, 0.0).unwrap();
        assert_eq!(
            c.entries(),
            &[
                ProfileEntry {
                    timestamp: 0.0,
                    velocity: 100.0,
                    position: 0.0
                },
                ProfileEntry {
                    timestamp: 0.1,
                    velocity: 100.0,
                    position: 10.0
                },
            ]
        );
        assert_eq!(end, 0.1);
    }

    #[test]
    fn full_trapezoid_has_three_segments() {
        let mut c = calc();
        // 0 → 10 mm/s at 10 mm/s² needs 5 mm each way; 20 mm leaves 10 mm cruise.
        let end = c.move_profile(0.0, 0.0, 10.0, 10.0, 10.0, 0.0, 20.0, 0.0).unwrap();
        let e = c.entries();
        assert_eq!(e.len(), 4);
        assert!((e[1].position - 5.0).abs() < 1e-12);
        assert!((e[2].position - 15.0).abs() < 1e-12);
        assert!((end - 3.0).abs() < 1e-12);
    }

    #[test]
    fn triangle_peak_below_vmax() {
        let mut c = calc();
        c.move_profile(0.0, 0.0, 10.0, 10.0, 100.0, 0.0, 10.0, 0.0).unwrap();
        let e = c.entries();
        assert_eq!(e.len(), 3);
        assert!((e[1].velocity - 10.0).abs() < 1e-9);
        assert!((e[1].position - 5.0).abs() < 1e-9);
    }

    #[test]
    fn reverse_direction_signs_velocity() {
        let mut c = calc();
        c.move_profile(5.0, 5.0, 0.0, 0.0, 5.0, 10.0, 0.0, 1.0).unwrap();
        assert!(c.entries().iter().all(|e| e.velocity < 0.0));
        assert_eq!(c.entries().last().unwrap().position, 0.0);
    }

    #[test]
    fn decel_only_is_one_segment() {
        let mut c = calc();
        // Stopping from 10 mm/s at 1 mm/s² needs 50 mm; only 1 mm available.
        c.move_profile(10.0, 0.0, 1.0, 1.0, 10.0, 0.0, 1.0, 0.0).unwrap();
        assert_eq!(c.entries().len(), 2);
    }

    #[test]
    fn segment_clamps_speed() {
        let mut c = TrapezoidCalculator::new(1.0, 10.0).unwrap();
        let end = c.move_segment(100.0, 100.0, 0.0, 10.0, 0.0).unwrap();
        assert_eq!(end, 1.0);
        let end = c.move_segment(0.0, 0.0, 10.0, 11.0, end).unwrap();
        assert_eq!(end, 2.0);
    }

    #[test]
    fn zero_distance_has_zero_duration() {
        let mut c = TrapezoidCalculator::new(0.0, 10.0).unwrap();
        assert_eq!(c.move_segment(0.0, 0.0, 3.0, 3.0, 7.0).unwrap(), 7.0);
        assert!(c.entries().is_empty());
    }

    #[test]
    fn zero_speed_over_distance_rejected() {
        let mut c = TrapezoidCalculator::new(0.0, 10.0).unwrap();
        assert!(matches!(
            c.move_segment(0.0, 0.0, 0.0, 1.0, 0.0),
            Err(MotionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn invalid_arguments_rejected() {
        let mut c = calc();
        assert!(c.move_profile(-1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 0.0).is_err());
        assert!(c.move_profile(0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0).is_err());
        assert!(c.move_profile(0.0, 0.0, -1.0, 1.0, 1.0, 0.0, 1.0, 0.0).is_err());
        assert!(TrapezoidCalculator::new(2.0, 1.0).is_err());
    }

    #[test]
    fn consecutive_duplicates_suppressed() {
        let mut c = calc();
        c.move_segment(1.0, 1.0, 0.0, 1.0, 0.0).unwrap();
        c.move_segment(1.0, 1.0, 1.0, 2.0, 1.0).unwrap();
        assert_eq!(c.entries().len(), 3);
    }

    proptest! {
        #[test]
        fn distance_and_speed_bounded(
            vi in 0.0f64..200.0,
            vf in 0.0f64..200.0,
            a in 0.0f64..5000.0,
            d in 0.0f64..5000.0,
            vmax in 1.0f64..500.0,
            start in -500.0f64..500.0,
            end in -500.0f64..500.0,
        ) {
            let mut c = calc();
            let t_end = c.move_profile(vi, vf, a, d, vmax, start, end, 0.0).unwrap();
            let dist = (end - start).abs();
            prop_assert!((travelled(c.entries()) - dist).abs() <= 1e-9 * dist.max(1.0));
            for e in c.entries() {
                prop_assert!(e.velocity.abs() <= vmax * (1.0 + 1e-9));
            }
            prop_assert!(t_end >= 0.0);
        }
    }
}
