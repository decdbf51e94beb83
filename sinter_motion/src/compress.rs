//! Point-count reduction for flushed axis samples.
//!
//! [`Compressor::compress_moves`] is a Douglas–Peucker variant that ranks
//! every interior point by the deviation it would leave behind and keeps the
//! top `target_count`. [`Compressor::compress_pwm`] debounces a laser power
//! step signal and, when that is not enough, drops the shortest off-gaps.
//!
//! Both are total: any input, including one or two points, yields a valid
//! output that starts with the first input point and ends with the last.
//! Scratch buffers live in the [`Compressor`] so the flush worker reuses them
//! between flushes.

use crate::sample::SamplePoint;

/// Reusable compression scratch space.
#[derive(Debug, Default)]
pub struct Compressor {
    weights: Vec<f64>,
    windows: Vec<(usize, usize)>,
    ranked: Vec<f64>,
    work: Vec<SamplePoint>,
    blips: Vec<(f64, usize)>,
    dropped: Vec<bool>,
}

/// Append `point` unless it equals the last emitted point.
#[inline]
fn push_last(dst: &mut Vec<SamplePoint>, point: SamplePoint) {
    if dst.last() != Some(&point) {
        dst.push(point);
    }
}

/// Distance of `p` from the chord `a`→`b` in (time, value) space.
fn chord_distance(a: &SamplePoint, b: &SamplePoint, p: &SamplePoint) -> f64 {
    let (dt, dv) = (b.time - a.time, b.value - a.value);
    let length = dt.hypot(dv);
    let (pt, pv) = (p.time - a.time, p.value - a.value);
    if length == 0.0 {
        return pt.hypot(pv);
    }
    (dt * pv - dv * pt).abs() / length
}

#[inline]
fn is_on(p: &SamplePoint) -> bool {
    p.value > 0.0
}

impl Compressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reduce a position trace to roughly `target_count` points.
    ///
    /// # Arguments
    ///
    /// * `points` - Time-ordered samples, reset markers already stripped
    /// * `target_count` - Desired output size, endpoints included
    /// * `min_epsilon` - Deviations at or below this are never kept
    /// * `dst` - Output, appended to
    pub fn compress_moves(
        &mut self,
        points: &[SamplePoint],
        target_count: usize,
        min_epsilon: f64,
        dst: &mut Vec<SamplePoint>,
    ) {
        let n = points.len();
        if n <= 2 {
            pass_through(points, dst);
            return;
        }

        // ── Rank interior points ──
        self.weights.clear();
        self.weights.resize(n, f64::NEG_INFINITY);
        self.weights[0] = f64::INFINITY;
        self.weights[n - 1] = f64::INFINITY;

        self.windows.clear();
        self.windows.push((0, n - 1));
        while let Some((first, last)) = self.windows.pop() {
            if last - first < 2 {
                continue;
            }
            let (a, b) = (&points[first], &points[last]);
            let mut split = first + 1;
            let mut max_distance = f64::NEG_INFINITY;
            for (i, p) in points.iter().enumerate().take(last).skip(first + 1) {
                let d = chord_distance(a, b, p);
                if d > max_distance {
                    max_distance = d;
                    split = i;
                }
            }
            if max_distance <= min_epsilon {
                self.weights[first + 1..last].fill(f64::NEG_INFINITY);
                continue;
            }
            self.weights[split] = max_distance;
            self.windows.push((first, split));
            self.windows.push((split, last));
        }

        // ── Cutoff ──
        self.ranked.clear();
        self.ranked
            .extend(self.weights.iter().copied().filter(|w| *w > min_epsilon));
        let cutoff = if self.ranked.len() <= target_count {
            self.ranked.iter().copied().fold(f64::INFINITY, f64::min)
        } else if target_count <= 2 {
            f64::INFINITY
        } else {
            let nth = target_count - 1;
            let (_, kth, _) = self.ranked.select_nth_unstable_by(nth, |a, b| b.total_cmp(a));
            *kth
        };

        // ── Emit ──
        dst.push(points[0]);
        for (p, w) in points[1..n - 1].iter().zip(&self.weights[1..n - 1]) {
            if *w >= cutoff && *w > min_epsilon {
                dst.push(*p);
            }
        }
        push_last(dst, points[n - 1]);
    }

    /// Reduce a laser power step signal to roughly `target_count` points.
    ///
    /// A value above zero is "on". Pulses and gaps no longer than
    /// `min_time_epsilon` are debounced away; power changes within
    /// `min_power_epsilon` are coalesced.
    pub fn compress_pwm(
        &mut self,
        points: &[SamplePoint],
        target_count: usize,
        min_time_epsilon: f64,
        min_power_epsilon: f64,
        dst: &mut Vec<SamplePoint>,
    ) {
        let n = points.len();
        if n <= 2 {
            pass_through(points, dst);
            return;
        }

        // ── Phase 1: forward debounce ──
        let work = &mut self.work;
        work.clear();
        for p in points {
            let Some(last) = work.last().copied() else {
                work.push(*p);
                continue;
            };
            let len = work.len();
            match (is_on(&last), is_on(p)) {
                (false, false) => {}
                (true, true) => {
                    if (p.value - last.value).abs() > min_power_epsilon {
                        work.push(*p);
                    }
                }
                (true, false) => {
                    let short_pulse = p.time - last.time <= min_time_epsilon
                        && len >= 2
                        && !is_on(&work[len - 2]);
                    if short_pulse {
                        // Drop the pulse; the off before it stays in force.
                        work.pop();
                    } else {
                        work.push(*p);
                    }
                }
                (false, true) => {
                    let short_gap = p.time - last.time <= min_time_epsilon
                        && len >= 2
                        && is_on(&work[len - 2]);
                    if short_gap {
                        work.pop();
                        let before = work[len - 2];
                        if (p.value - before.value).abs() > min_power_epsilon {
                            work.push(*p);
                        }
                    } else {
                        work.push(*p);
                    }
                }
            }
        }

        // ── Phase 2: drop the shortest half of the on→off→on blips ──
        self.dropped.clear();
        self.dropped.resize(work.len(), false);
        if work.len() > target_count {
            self.blips.clear();
            for i in 0..work.len().saturating_sub(2) {
                if is_on(&work[i]) && !is_on(&work[i + 1]) && is_on(&work[i + 2]) {
                    self.blips.push((work[i + 2].time - work[i + 1].time, i + 1));
                }
            }
            self.blips.sort_by(|a, b| a.0.total_cmp(&b.0));
            let remove = self.blips.len().div_ceil(2);
            for &(_, gap) in &self.blips[..remove] {
                self.dropped[gap] = true;
            }
        }

        // ── Emit ──
        let start = dst.len();
        for (p, dropped) in work.iter().zip(&self.dropped) {
            if *dropped {
                continue;
            }
            if dst.len() > start {
                if let Some(prev) = dst.last() {
                    if is_on(prev) && is_on(p) && (p.value - prev.value).abs() <= min_power_epsilon {
                        continue;
                    }
                }
            }
            dst.push(*p);
        }
        push_last(dst, points[n - 1]);
    }
}

fn pass_through(points: &[SamplePoint], dst: &mut Vec<SamplePoint>) {
    if let Some((last, head)) = points.split_last() {
        dst.extend_from_slice(head);
        push_last(dst, *last);
    }
}

/// [`Compressor::compress_moves`] with throwaway scratch space.
pub fn compress_moves(
    points: &[SamplePoint],
    target_count: usize,
    min_epsilon: f64,
    dst: &mut Vec<SamplePoint>,
) {
    Compressor::new().compress_moves(points, target_count, min_epsilon, dst);
}

/// [`Compressor::compress_pwm`] with throwaway scratch space.
pub fn compress_pwm(
    points: &[SamplePoint],
    target_count: usize,
    min_time_epsilon: f64,
    min_power_epsilon: f64,
    dst: &mut Vec<SamplePoint>,
) {
    Compressor::new().compress_pwm(points, target_count, min_time_epsilon, min_power_epsilon, dst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pts(raw: &[(f64, f64)]) -> Vec<SamplePoint> {
        raw.iter().map(|&(t, v)| SamplePoint::new(t, v)).collect()
    }

    fn zigzag(n: usize) -> Vec<SamplePoint> {
        (0..n)
            .map(|i| {
                let t = i as f64 * 0.01;
                let v = if i % 2 == 0 { i as f64 } else { -(i as f64) * 0.5 };
                SamplePoint::new(t, v)
            })
            .collect()
    }

    #[test]
    fn short_inputs_pass_through() {
        let mut dst = Vec::new();
        compress_moves(&pts(&[(0.0, 1.0)]), 10, 0.0, &mut dst);
        assert_eq!(dst, pts(&[(0.0, 1.0)]));

        dst.clear();
        compress_pwm(&pts(&[(0.0, 0.0), (1.0, 0.5)]), 0, 0.1, 0.1, &mut dst);
        assert_eq!(dst, pts(&[(0.0, 0.0), (1.0, 0.5)]));

        dst.clear();
        compress_moves(&[], 10, 0.0, &mut dst);
        assert!(dst.is_empty());
    }

    #[test]
    fn last_point_not_duplicated() {
        let mut dst = pts(&[(1.0, 2.0)]);
        compress_moves(&pts(&[(1.0, 2.0)]), 2, 0.0, &mut dst);
        assert_eq!(dst.len(), 1);
    }

    #[test]
    fn straight_line_reduces_to_endpoints() {
        let line: Vec<_> = (0..100)
            .map(|i| SamplePoint::new(i as f64 * 0.01, i as f64 * 0.5))
            .collect();
        let mut dst = Vec::new();
        compress_moves(&line, 50, 1e-6, &mut dst);
        assert_eq!(dst, vec![line[0], line[99]]);
    }

    #[test]
    fn full_budget_without_epsilon_is_identity() {
        let input = zigzag(41);
        let mut dst = Vec::new();
        compress_moves(&input, input.len(), 0.0, &mut dst);
        assert_eq!(dst, input);
    }

    #[test]
    fn keeps_largest_deviation_first() {
        // Flat line with one tall spike and one small bump.
        let input = pts(&[(0.0, 0.0), (1.0, 0.0), (2.0, 10.0), (3.0, 0.0), (4.0, 1.0), (5.0, 0.0)]);
        let mut dst = Vec::new();
        compress_moves(&input, 3, 0.0, &mut dst);
        assert_eq!(dst, pts(&[(0.0, 0.0), (2.0, 10.0), (5.0, 0.0)]));
    }

    #[test]
    fn target_of_two_keeps_endpoints_only() {
        let input = zigzag(20);
        let mut dst = Vec::new();
        compress_moves(&input, 2, 0.0, &mut dst);
        assert_eq!(dst, vec![input[0], input[19]]);
    }

    #[test]
    fn degenerate_chord_uses_euclidean_distance() {
        let a = SamplePoint::new(1.0, 1.0);
        let p = SamplePoint::new(4.0, 5.0);
        assert_eq!(chord_distance(&a, &a, &p), 5.0);
    }

    #[test]
    fn pwm_short_pulse_between_offs_removed() {
        let input = pts(&[(0.0, 0.0), (0.5, 0.8), (0.5005, 0.0), (1.0, 0.0)]);
        let mut dst = Vec::new();
        compress_pwm(&input, 10, 0.001, 0.01, &mut dst);
        assert_eq!(dst, pts(&[(0.0, 0.0), (1.0, 0.0)]));
    }

    #[test]
    fn pwm_short_gap_between_ons_removed() {
        let input = pts(&[(0.0, 0.5), (0.3, 0.0), (0.3002, 0.5), (1.0, 0.5)]);
        let mut dst = Vec::new();
        compress_pwm(&input, 10, 0.001, 0.01, &mut dst);
        assert_eq!(dst, pts(&[(0.0, 0.5), (1.0, 0.5)]));
    }

    #[test]
    fn pwm_small_power_changes_coalesced() {
        let input = pts(&[(0.0, 0.5), (0.1, 0.505), (0.2, 0.51), (0.3, 0.9)]);
        let mut dst = Vec::new();
        compress_pwm(&input, 10, 0.001, 0.02, &mut dst);
        assert_eq!(dst, pts(&[(0.0, 0.5), (0.3, 0.9)]));
    }

    #[test]
    fn pwm_over_budget_drops_shortest_gaps() {
        // Three gaps of 0.01, 0.02 and 0.2 s; budget forces a blip pass.
        let input = pts(&[
            (0.0, 0.5),
            (0.1, 0.0),
            (0.11, 0.5),
            (0.2, 0.0),
            (0.22, 0.5),
            (0.3, 0.0),
            (0.5, 0.5),
            (0.6, 0.0),
        ]);
        let mut dst = Vec::new();
        compress_pwm(&input, 4, 0.001, 0.01, &mut dst);
        assert_eq!(
            dst,
            pts(&[(0.0, 0.5), (0.3, 0.0), (0.5, 0.5), (0.6, 0.0)])
        );
    }

    #[test]
    fn pwm_is_monotonic_on_a_ramp() {
        let ramp: Vec<_> = (0..=100)
            .map(|i| SamplePoint::new(i as f64 * 0.01, i as f64 / 100.0))
            .collect();
        let mut dst = Vec::new();
        compress_pwm(&ramp, 10, 0.001, 0.05, &mut dst);
        assert!(dst.windows(2).all(|w| w[0].value <= w[1].value));
        assert_eq!(dst.first(), ramp.first());
        assert_eq!(dst.last(), ramp.last());
    }

    proptest! {
        #[test]
        fn moves_keep_endpoints(
            values in proptest::collection::vec(-100.0f64..100.0, 1..200),
            target in 0usize..50,
            eps in 0.0f64..5.0,
        ) {
            let input: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(i, v)| SamplePoint::new(i as f64 * 0.001, *v))
                .collect();
            let mut dst = Vec::new();
            compress_moves(&input, target, eps, &mut dst);
            prop_assert_eq!(dst.first(), input.first());
            prop_assert_eq!(dst.last(), input.last());
            prop_assert!(dst.windows(2).all(|w| w[0].time < w[1].time));
        }

        #[test]
        fn pwm_keeps_endpoints(
            values in proptest::collection::vec(0.0f64..1.0, 1..200),
            target in 0usize..50,
        ) {
            let input: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(i, v)| SamplePoint::new(i as f64 * 0.001, if *v < 0.3 { 0.0 } else { *v }))
                .collect();
            let mut dst = Vec::new();
            compress_pwm(&input, target, 0.002, 0.05, &mut dst);
            prop_assert_eq!(dst.first(), input.first());
            prop_assert_eq!(dst.last(), input.last());
            prop_assert!(dst.windows(2).all(|w| w[0].time <= w[1].time));
        }
    }
}
