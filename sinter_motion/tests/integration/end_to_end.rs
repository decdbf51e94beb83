//! Integration test: producer samples to stepper instructions.
//!
//! 1. A straight X/Y line with a linear power ramp collapses to a handful of
//!    instructions that end exactly on the last sample
//! 2. A dense wave stays within the configured move budget
//! 3. Parallel and sequential flushes emit the same instructions

use sinter_motion::stepper::StepperOp;
use sinter_motion::{Axis, SamplePoint};

use super::{motion_ops, pwm_values, quiet_config, rig};

const SAMPLES: usize = 1000;
const SPAN: f64 = 2.0;

fn sample_time(i: usize) -> f64 {
    SPAN * i as f64 / (SAMPLES - 1) as f64
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn straight_line_with_power_ramp() {
    let config = quiet_config();
    let rig = rig(config.clone());

    for i in 0..SAMPLES {
        let t = sample_time(i);
        rig.queue.add_xy(t, 10.0 * t, 5.0 * t).unwrap();
        rig.queue.add_l(t, i as f64 / (SAMPLES - 1) as f64).unwrap();
    }
    rig.queue.synchronous_flush_outside_master_lock(true).unwrap();

    let budget = (config.xy_moves_per_second * SPAN).ceil() as usize + 1;
    assert!(motion_ops(&rig.x) <= budget, "X emitted {}", motion_ops(&rig.x));
    assert!(motion_ops(&rig.y) <= budget, "Y emitted {}", motion_ops(&rig.y));

    let power = pwm_values(&rig.l);
    assert!(power.len() >= 2);
    assert!(power.windows(2).all(|w| w[0] <= w[1]), "power not monotonic");
    assert_eq!(power.last().copied(), Some(1.0));

    assert_eq!(rig.queue.emitted_cursor(Axis::X), Some(SamplePoint::new(2.0, 20.0)));
    assert_eq!(rig.queue.emitted_cursor(Axis::Y), Some(SamplePoint::new(2.0, 10.0)));
    assert_eq!(rig.queue.emitted_cursor(Axis::L), Some(SamplePoint::new(2.0, 1.0)));
    for axis in Axis::ALL {
        assert_eq!(rig.queue.pending_points(axis), 0);
    }
}

#[test]
fn straight_line_ends_on_target_steps() {
    let rig = rig(quiet_config());
    for i in 0..SAMPLES {
        let t = sample_time(i);
        rig.queue.add_xy(t, 10.0 * t, 0.0).unwrap();
    }
    rig.queue.synchronous_flush_outside_master_lock(true).unwrap();

    let steps: i64 = rig
        .x
        .ops()
        .iter()
        .filter_map(|op| match op {
            StepperOp::Move { steps, .. } => Some(*steps),
            _ => None,
        })
        .sum();
    assert_eq!(steps, 20 * 80);

    // 2s at 16 MHz, from the first sample's clock.
    let ts = rig.queue.axis_timestamp(Axis::X).unwrap();
    assert_eq!(ts.clock, 32_000_000);
    // Y never moved: one baseline reset, then a single dwell.
    assert_eq!(
        rig.y.ops().last(),
        Some(&StepperOp::Dwell {
            clock: 0,
            ticks: 32_000_000
        })
    );
}

#[test]
fn dense_wave_respects_move_budget() {
    let config = quiet_config();
    let rig = rig(config.clone());
    for i in 0..SAMPLES {
        let t = sample_time(i);
        let x = 10.0 * (std::f64::consts::TAU * 7.0 * t).sin();
        let y = 10.0 * (std::f64::consts::TAU * 3.0 * t).cos();
        rig.queue.add_xy(t, x, y).unwrap();
    }
    rig.queue.synchronous_flush_outside_master_lock(true).unwrap();

    let moves = rig
        .x
        .ops()
        .iter()
        .filter(|op| matches!(op, StepperOp::Move { .. }))
        .count();
    let budget = (config.xy_moves_per_second * SPAN).ceil() as usize;
    assert!(moves > 20, "wave over-compressed to {moves} moves");
    assert!(moves <= budget, "{moves} moves over a budget of {budget}");

    let last = sample_time(SAMPLES - 1);
    let x_last = 10.0 * (std::f64::consts::TAU * 7.0 * last).sin();
    assert_eq!(rig.queue.emitted_cursor(Axis::X), Some(SamplePoint::new(last, x_last)));
}

#[test]
fn parallel_flush_matches_sequential() {
    let run = |parallel: bool| {
        let mut config = quiet_config();
        config.parallel_flush = parallel;
        let rig = rig(config);
        for i in 0..200 {
            let t = i as f64 * 0.005;
            rig.queue.add_xy(t, (t * 9.0).sin(), t * t).unwrap();
            rig.queue.add_l(t, if i % 40 < 20 { 0.0 } else { 0.75 }).unwrap();
        }
        rig.queue.synchronous_flush_outside_master_lock(true).unwrap();
        (rig.x.ops(), rig.y.ops(), rig.l.ops())
    };
    assert_eq!(run(true), run(false));
}
