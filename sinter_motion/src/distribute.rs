//! Minimum-clock distribution.
//!
//! A batch of commands bound for one MCU queue arrives with requested
//! clocks that may cluster. Releasing each one exactly `min_send_ahead`
//! before it is due would burst the link; the distributor instead spreads
//! the release floors along straight lines through the requested clocks,
//! splitting wherever a line would release a command too late (ahead of the
//! line) or too early (more than `max_send_ahead` behind it).

use sinter_common::clock::ClockModel;
use sinter_common::config::DistributionConfig;
use std::collections::HashMap;
use std::hash::Hash;

use crate::error::{MotionError, MotionResult};

/// Half a tick; smaller deviations are rounding noise.
const LINE_SLACK: f64 = 0.5;

/// Release window of one scheduled command [ticks].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockRequest {
    /// Clock the command should execute at.
    pub requested: u64,
    /// Earliest clock the command may be released to the MCU queue.
    pub min_clock: u64,
}

impl ClockRequest {
    pub const fn new(requested: u64, min_clock: u64) -> Self {
        Self {
            requested,
            min_clock,
        }
    }
}

/// Evens out the release floors of scheduled commands.
#[derive(Debug, Clone)]
pub struct MinClockDistributor {
    min_ahead: u64,
    max_ahead: u64,
    order: Vec<usize>,
    windows: Vec<(usize, usize)>,
}

impl MinClockDistributor {
    /// # Arguments
    ///
    /// * `min_ahead` - Every floor ends at least this many ticks before its request
    /// * `max_ahead` - Lines may fall at most this far behind a request
    pub fn new(min_ahead: u64, max_ahead: u64) -> MotionResult<Self> {
        if min_ahead > max_ahead {
            return Err(MotionError::invalid(format!(
                "min send-ahead {min_ahead} exceeds max send-ahead {max_ahead}"
            )));
        }
        Ok(Self {
            min_ahead,
            max_ahead,
            order: Vec::new(),
            windows: Vec::new(),
        })
    }

    /// Convert the configured send-ahead seconds with the current clock.
    pub fn from_config(clock: &ClockModel, config: &DistributionConfig) -> MotionResult<Self> {
        let min_ahead = clock.duration_in_clock_ticks(config.min_send_ahead)?.round();
        let max_ahead = clock.duration_in_clock_ticks(config.max_send_ahead)?.round();
        Self::new(min_ahead.max(0.0) as u64, max_ahead.max(0.0) as u64)
    }

    pub fn min_ahead(&self) -> u64 {
        self.min_ahead
    }

    pub fn max_ahead(&self) -> u64 {
        self.max_ahead
    }

    /// Recompute `min_clock` for every entry of one group, in place.
    ///
    /// Afterwards `min_clock <= requested - min_ahead` holds for every entry
    /// (saturating at zero). Entries keep their input order.
    pub fn distribute(&mut self, entries: &mut [ClockRequest]) {
        let n = entries.len();
        if n <= 2 || self.min_ahead == self.max_ahead {
            return;
        }

        self.order.clear();
        self.order.extend(0..n);
        self.order.sort_by_key(|&i| entries[i].requested);
        let order = &self.order;
        let requested = |k: usize| entries[order[k]].requested as f64;

        let mut floors = vec![0u64; n];
        let max_behind = self.max_ahead as f64;
        self.windows.clear();
        self.windows.push((0, n - 1));
        while let Some((first, last)) = self.windows.pop() {
            let (r0, r1) = (requested(first), requested(last));
            let slope = if last > first {
                (r1 - r0) / (last - first) as f64
            } else {
                0.0
            };
            let line = |k: usize| r0 + slope * (k - first) as f64;

            let mut ahead = (0.0, first);
            let mut behind = (0.0, first);
            for k in first + 1..last {
                let deviation = line(k) - requested(k);
                if deviation > ahead.0 {
                    ahead = (deviation, k);
                } else if -deviation > behind.0 {
                    behind = (-deviation, k);
                }
            }

            let split = if ahead.0 > LINE_SLACK {
                Some(ahead.1)
            } else if behind.0 > max_behind {
                Some(behind.1)
            } else {
                None
            };
            match split {
                Some(k) => {
                    self.windows.push((first, k));
                    self.windows.push((k, last));
                }
                None => {
                    for (k, floor) in floors.iter_mut().enumerate().take(last + 1).skip(first) {
                        let on_line = line(k).min(requested(k)).max(0.0) as u64;
                        *floor = on_line.saturating_sub(self.min_ahead);
                    }
                }
            }
        }

        for (k, floor) in floors.into_iter().enumerate() {
            entries[self.order[k]].min_clock = floor;
        }
    }

    /// Distribute each group of entries sharing a key independently.
    pub fn distribute_grouped<K: Eq + Hash + Copy>(&mut self, entries: &mut [(K, ClockRequest)]) {
        let mut groups: HashMap<K, Vec<usize>> = HashMap::new();
        for (i, (key, _)) in entries.iter().enumerate() {
            groups.entry(*key).or_default().push(i);
        }
        for indices in groups.into_values() {
            let mut group: Vec<ClockRequest> = indices.iter().map(|&i| entries[i].1).collect();
            self.distribute(&mut group);
            for (slot, request) in indices.into_iter().zip(group) {
                entries[slot].1 = request;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn trivial_inputs_unchanged() {
        let mut d = MinClockDistributor::new(100, 1000).unwrap();
        let mut two = [ClockRequest::new(5000, 1), ClockRequest::new(9000, 2)];
        d.distribute(&mut two);
        assert_eq!(two, [ClockRequest::new(5000, 1), ClockRequest::new(9000, 2)]);

        let mut same = MinClockDistributor::new(500, 500).unwrap();
        let mut many = [
            ClockRequest::new(1000, 0),
            ClockRequest::new(2000, 0),
            ClockRequest::new(3000, 0),
        ];
        same.distribute(&mut many);
        assert!(many.iter().all(|e| e.min_clock == 0));
    }

    #[test]
    fn evenly_spaced_input_unchanged() {
        let mut d = MinClockDistributor::new(100, 1000).unwrap();
        let input: Vec<_> = (1..=8)
            .map(|i| ClockRequest::new(i * 5000, i * 5000 - 100))
            .collect();
        let mut out = input.clone();
        d.distribute(&mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn cluster_is_spread_back() {
        // A burst at the end of an otherwise idle window.
        let mut d = MinClockDistributor::new(10, 100_000).unwrap();
        let mut entries = [
            ClockRequest::new(0, 0),
            ClockRequest::new(99_000, 0),
            ClockRequest::new(99_500, 0),
            ClockRequest::new(100_000, 0),
        ];
        d.distribute(&mut entries);
        for e in &entries {
            assert!(e.min_clock + 10 <= e.requested.max(10));
        }
        // The burst is released earlier than a fixed lead would allow.
        assert!(entries[1].min_clock < 99_000 - 10);
    }

    #[test]
    fn results_in_input_order() {
        let mut d = MinClockDistributor::new(10, 1000).unwrap();
        let mut entries = [
            ClockRequest::new(3000, 0),
            ClockRequest::new(1000, 0),
            ClockRequest::new(2000, 0),
        ];
        d.distribute(&mut entries);
        assert_eq!(entries[0].requested, 3000);
        assert_eq!(entries[0].min_clock, 2990);
        assert_eq!(entries[1].min_clock, 990);
        assert_eq!(entries[2].min_clock, 1990);
    }

    #[test]
    fn grouped_distribution_is_independent() {
        let mut d = MinClockDistributor::new(10, 1000).unwrap();
        let mut entries = [
            (0u8, ClockRequest::new(1000, 0)),
            (1u8, ClockRequest::new(50, 7)),
            (0u8, ClockRequest::new(2000, 0)),
            (0u8, ClockRequest::new(3000, 0)),
        ];
        d.distribute_grouped(&mut entries);
        assert_eq!(entries[1].1, ClockRequest::new(50, 7));
        assert_eq!(entries[0].1.min_clock, 990);
        assert_eq!(entries[3].1.min_clock, 2990);
    }

    #[test]
    fn min_above_max_rejected() {
        assert!(MinClockDistributor::new(10, 5).is_err());
    }

    proptest! {
        #[test]
        fn floor_never_after_request_minus_lead(
            clocks in proptest::collection::vec(0u64..10_000_000, 0..64),
            min_ahead in 0u64..5000,
            extra in 1u64..500_000,
        ) {
            let mut d = MinClockDistributor::new(min_ahead, min_ahead + extra).unwrap();
            let mut entries: Vec<_> = clocks.iter().map(|&c| ClockRequest::new(c, 0)).collect();
            d.distribute(&mut entries);
            for (e, &c) in entries.iter().zip(&clocks) {
                prop_assert_eq!(e.requested, c);
                if entries.len() > 2 {
                    prop_assert!(e.min_clock <= c.saturating_sub(min_ahead));
                }
            }
        }
    }
}
