//! Integration test: flush triggers, chunking, resets and failure handling.

use sinter_common::config::MovementConfig;
use sinter_motion::flush::FlushPhase;
use sinter_motion::stepper::StepperOp;
use sinter_motion::{Axis, MotionError, SamplePoint};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{quiet_config, rig, wait_until};

// ── Helpers ─────────────────────────────────────────────────────────

fn reset_clocks(ops: &[StepperOp]) -> Vec<i64> {
    ops.iter()
        .filter_map(|op| match op {
            StepperOp::Reset { clock, .. } => Some(*clock),
            _ => None,
        })
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn flush_all_works_through_period_sized_chunks() {
    let config = MovementConfig {
        flush_period: 0.25,
        ..MovementConfig::default()
    };
    let rig = rig(config);
    for i in 0..=250 {
        let t = i as f64 / 100.0;
        rig.queue.add_xy(t, t, -t).unwrap();
    }
    rig.queue.synchronous_flush_outside_master_lock(true).unwrap();

    let diag = rig.queue.diagnostics();
    assert!(diag.passes >= 8, "only {} passes", diag.passes);
    assert_eq!(diag.failures, 0);
    assert_eq!(diag.phase, FlushPhase::Idle);
    assert!(diag.points_in >= 251);
    for axis in [Axis::X, Axis::Y] {
        assert_eq!(rig.queue.pending_points(axis), 0);
    }
    assert_eq!(rig.queue.emitted_cursor(Axis::X), Some(SamplePoint::new(2.5, 2.5)));
    assert_eq!(rig.queue.emitted_cursor(Axis::Y), Some(SamplePoint::new(2.5, -2.5)));
    assert!(rig.x.commits() >= 8);
}

#[test]
fn reset_necessary_stops_the_queue() {
    let rig = rig(quiet_config());
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    rig.queue.set_fatal_callback(Arc::new(move |err: &MotionError| {
        assert!(err.is_fatal());
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    rig.queue.add_xy(0.0, 0.0, 0.0).unwrap();
    rig.queue.add_xy(0.1, 1.0, 1.0).unwrap();
    rig.x.arm_reset_necessary();

    let err = rig.queue.synchronous_flush_outside_master_lock(true).unwrap_err();
    assert!(matches!(err, MotionError::ResetNecessary { axis: Axis::X, .. }));
    assert!(rig.queue.fatal_error().is_some());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(rig.queue.diagnostics().failures, 1);

    // Everything after the failure is refused.
    assert!(matches!(rig.queue.add_xy(0.2, 2.0, 2.0), Err(MotionError::Fatal(_))));
    assert!(matches!(
        rig.queue.synchronous_flush_outside_master_lock(false),
        Err(MotionError::Fatal(_))
    ));
    assert!(matches!(
        rig.queue.schedule_flush_outside_master_lock(),
        Err(MotionError::Fatal(_))
    ));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn flush_triggers_refuse_master_lock_holders() {
    let rig = rig(quiet_config());
    let master = Arc::clone(rig.queue.master_lock());
    {
        let _guard = master.lock();
        assert!(matches!(
            rig.queue.schedule_flush_outside_master_lock(),
            Err(MotionError::LockOrder)
        ));
        assert!(matches!(
            rig.queue.synchronous_flush_outside_master_lock(true),
            Err(MotionError::LockOrder)
        ));
        // Producers reuse the lock the caller already holds.
        rig.queue.add_xy(0.0, 1.0, 2.0).unwrap();
        rig.queue.add_l(0.0, 0.5).unwrap();
    }
    rig.queue.synchronous_flush_outside_master_lock(true).unwrap();
    assert!(!master.is_locked());
    assert_eq!(rig.x.ops(), vec![StepperOp::Reset { clock: 0, position: 1.0 }]);
    assert_eq!(rig.l.ops(), vec![StepperOp::Pwm { clock: 0, value: 0.5 }]);
}

#[test]
fn producer_rejects_bad_samples() {
    let rig = rig(quiet_config());
    rig.queue.add_xy(1.0, 0.0, 0.0).unwrap();

    assert!(matches!(
        rig.queue.add_xy(0.5, 0.0, 0.0),
        Err(MotionError::NonMonotonicSample { axis: Axis::X, .. })
    ));
    assert!(matches!(
        rig.queue.add_reset(0.5, 0.0, 0.0, false),
        Err(MotionError::NonMonotonicSample { .. })
    ));
    assert!(matches!(rig.queue.add_xy(-1.0, 0.0, 0.0), Err(MotionError::InvalidArgument(_))));
    assert!(matches!(rig.queue.add_xy(2.0, f64::NAN, 0.0), Err(MotionError::InvalidArgument(_))));
    assert!(matches!(rig.queue.add_l(2.0, 1.5), Err(MotionError::InvalidArgument(_))));
    assert!(matches!(rig.queue.add_l(2.0, -0.1), Err(MotionError::InvalidArgument(_))));

    // Equal timestamps are fine; exact repeats are elided.
    rig.queue.add_xy(1.0, 0.0, 0.0).unwrap();
    rig.queue.add_xy(1.0, 0.5, 0.0).unwrap();
    assert_eq!(rig.queue.pending_points(Axis::X), 2);
    assert_eq!(rig.queue.pending_points(Axis::Y), 1);
    assert_eq!(rig.queue.pending_points(Axis::L), 0);
}

#[test]
fn dwelled_reset_rebases_on_the_clock() {
    let rig = rig(quiet_config());
    rig.queue.add_xy(0.0, 0.0, 0.0).unwrap();
    rig.queue.add_xy(0.5, 1.0, 1.0).unwrap();
    rig.queue.synchronous_flush_outside_master_lock(true).unwrap();
    assert_eq!(rig.queue.axis_timestamp(Axis::X).map(|ts| ts.clock), Some(8_000_000));

    rig.queue.add_reset(3.0, 5.0, 5.0, true).unwrap();
    rig.queue.add_xy(3.5, 6.0, 6.0).unwrap();
    rig.queue.synchronous_flush_outside_master_lock(true).unwrap();

    assert_eq!(reset_clocks(&rig.x.ops()), vec![0, 48_000_000]);
    assert_eq!(reset_clocks(&rig.y.ops()), vec![0, 48_000_000]);
    assert_eq!(rig.queue.axis_timestamp(Axis::X).map(|ts| ts.clock), Some(56_000_000));
    assert_eq!(rig.queue.emitted_cursor(Axis::X), Some(SamplePoint::new(3.5, 6.0)));
}

#[test]
fn plain_reset_keeps_axes_on_one_timebase() {
    let rig = rig(quiet_config());
    rig.queue.add_xy(0.0, 0.0, 0.0).unwrap();
    rig.queue.add_l(0.0, 0.0).unwrap();
    rig.queue.add_xy(0.5, 1.0, 1.0).unwrap();
    rig.queue.synchronous_flush_outside_master_lock(true).unwrap();
    assert_eq!(rig.queue.axis_timestamp(Axis::X).map(|ts| ts.clock), Some(8_000_000));

    rig.queue.add_reset(3.0, 5.0, 5.0, false).unwrap();
    rig.queue.add_xy(3.5, 6.0, 6.0).unwrap();
    rig.queue.add_l(3.5, 1.0).unwrap();
    rig.queue.synchronous_flush_outside_master_lock(true).unwrap();

    // The MCU clock idles through the gap before the reset lands.
    let ops = rig.x.ops();
    assert!(ops.contains(&StepperOp::Dwell {
        clock: 8_000_000,
        ticks: 40_000_000
    }));
    assert_eq!(reset_clocks(&ops), vec![0, 48_000_000]);
    assert_eq!(reset_clocks(&rig.y.ops()), vec![0, 48_000_000]);
    let step = ops.iter().rev().find(|op| matches!(op, StepperOp::Move { .. }));
    assert_eq!(step.map(StepperOp::clock), Some(48_000_000));

    // Motion and laser reach the 3.5s sample on the same tick.
    let laser_on = rig
        .l
        .ops()
        .into_iter()
        .find(|op| matches!(op, StepperOp::Pwm { value, .. } if *value == 1.0));
    assert_eq!(laser_on.map(|op| op.clock()), Some(56_000_000));
    for axis in Axis::ALL {
        assert_eq!(rig.queue.axis_timestamp(axis).map(|ts| ts.clock), Some(56_000_000));
    }
    assert_eq!(rig.queue.emitted_cursor(Axis::X), Some(SamplePoint::new(3.5, 6.0)));
}

#[test]
fn link_failure_stops_the_queue() {
    let rig = rig(quiet_config());
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    rig.queue.set_fatal_callback(Arc::new(move |_: &MotionError| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    rig.queue.add_xy(0.0, 0.0, 0.0).unwrap();
    rig.queue.add_xy(0.5, 1.0, 1.0).unwrap();
    rig.queue.synchronous_flush_outside_master_lock(true).unwrap();
    let recorded = rig.x.ops().len();

    rig.queue.add_xy(1.0, 2.0, 2.0).unwrap();
    rig.x.arm_unreachable();
    let err = rig.queue.synchronous_flush_outside_master_lock(true).unwrap_err();
    assert!(matches!(err, MotionError::Link(_)), "{err}");

    assert!(rig.queue.fatal_error().is_some());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(rig.queue.diagnostics().failures, 1);
    // The failed axis keeps its last committed state.
    assert_eq!(rig.queue.emitted_cursor(Axis::X), Some(SamplePoint::new(0.5, 1.0)));
    assert_eq!(rig.queue.axis_timestamp(Axis::X).map(|ts| ts.clock), Some(8_000_000));
    assert_eq!(rig.x.ops().len(), recorded);

    // Nothing is re-emitted from the stale clock.
    assert!(matches!(rig.queue.add_xy(1.5, 3.0, 3.0), Err(MotionError::Fatal(_))));
    assert!(matches!(
        rig.queue.synchronous_flush_outside_master_lock(true),
        Err(MotionError::Fatal(_))
    ));
    assert_eq!(rig.x.ops().len(), recorded);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn timer_flushes_a_quiet_queue() {
    let config = MovementConfig {
        flush_period: 0.05,
        ..MovementConfig::default()
    };
    let rig = rig(config);
    rig.queue.add_xy(0.0, 0.0, 0.0).unwrap();
    rig.queue.add_xy(0.01, 0.1, 0.0).unwrap();

    let last = Some(SamplePoint::new(0.01, 0.1));
    let flushed = wait_until(Duration::from_secs(2), || rig.queue.emitted_cursor(Axis::X) == last);
    assert!(flushed, "timer never flushed");
    assert_eq!(rig.queue.pending_points(Axis::X), 0);
}

#[test]
fn scheduled_flush_runs_in_the_background() {
    let rig = rig(quiet_config());
    for i in 0..20 {
        let t = i as f64 / 20.0;
        rig.queue.add_xy(t, t * 2.0, 0.0).unwrap();
        rig.queue.add_l(t, if i % 4 < 2 { 1.0 } else { 0.0 }).unwrap();
    }
    rig.queue.schedule_flush_outside_master_lock().unwrap();
    // A second trigger while the first is queued or running is absorbed.
    rig.queue.schedule_flush_outside_master_lock().unwrap();

    let expected = [(Axis::X, 0.95 * 2.0), (Axis::Y, 0.0), (Axis::L, 0.0)];
    let flushed = wait_until(Duration::from_secs(2), || {
        expected
            .iter()
            .all(|&(axis, value)| rig.queue.emitted_cursor(axis) == Some(SamplePoint::new(0.95, value)))
    });
    assert!(flushed, "scheduled flush never completed");
    assert!(Axis::ALL.iter().all(|&axis| rig.queue.pending_points(axis) == 0));
    assert!(rig.queue.fatal_error().is_none());
}

#[test]
fn shutdown_stops_synchronous_flushes() {
    let rig = rig(quiet_config());
    rig.queue.add_xy(0.0, 0.0, 0.0).unwrap();
    rig.queue.synchronous_flush_outside_master_lock(true).unwrap();
    rig.queue.shutdown();
    assert!(matches!(
        rig.queue.synchronous_flush_outside_master_lock(true),
        Err(MotionError::WorkerStopped(_))
    ));
}
