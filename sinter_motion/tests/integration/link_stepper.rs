//! Integration test: steppers driving the simulated MCU.
//!
//! 1. A `LinkStepper` turns reset / move / dwell into catalog commands whose
//!    release floors sit at least `min_send_ahead` before their clocks
//! 2. A clock that is already too close fails with `ResetNecessary` and
//!    drops whatever was queued since the last commit
//! 3. A movement queue wired to three link steppers lands every step

use sinter_common::cancel::CancelToken;
use sinter_common::catalog::{CommandCatalog, CommandId, ids};
use sinter_common::clock::host_time;
use sinter_common::config::DistributionConfig;
use sinter_common::mcu::{McuId, McuTimestamp};
use sinter_link::simulation::{ExecutedCommand, SimulationOptions};
use sinter_link::{McuLink, SimulatedMcu};
use sinter_motion::distribute::MinClockDistributor;
use sinter_motion::stepper::{LinkStepper, Stepper};
use sinter_motion::trapezoid::ProfileEntry;
use sinter_motion::{Axis, AxisSteppers, MasterLock, MotionError, MovementQueue};
use std::sync::Arc;

use super::{STEPS_PER_MM, quiet_config};

// ── Helpers ─────────────────────────────────────────────────────────

fn sim() -> Arc<SimulatedMcu> {
    let options = SimulationOptions {
        clock_sync_interval: None,
        ..SimulationOptions::default()
    };
    Arc::new(SimulatedMcu::new(Arc::new(CommandCatalog::builtin()), options).unwrap())
}

fn stepper(sim: &Arc<SimulatedMcu>, axis: Axis, oid: u8, steps_per_unit: f64) -> LinkStepper {
    let distributor = MinClockDistributor::from_config(sim.clock(), &DistributionConfig::default()).unwrap();
    let link: Arc<dyn McuLink> = Arc::clone(sim) as Arc<dyn McuLink>;
    LinkStepper::new(link, axis, oid, steps_per_unit, distributor, CancelToken::none())
}

/// Execute everything and return it in clock order.
fn executed(sim: &SimulatedMcu) -> Vec<ExecutedCommand> {
    sim.drain();
    let mut executed = sim.take_executed();
    executed.sort_by_key(|c| c.req_clock);
    executed
}

fn addressed(executed: &[ExecutedCommand], oid: i64, id: CommandId) -> Vec<&ExecutedCommand> {
    executed
        .iter()
        .filter(|c| c.id == id && c.scalar(0) == Some(oid))
        .collect()
}

fn clock_in(sim: &SimulatedMcu, seconds: f64) -> i64 {
    sim.clock().clock_of(host_time() + seconds).unwrap().round() as i64
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn link_stepper_sends_reset_move_dwell() {
    let sim = sim();
    let mut stepper = stepper(&sim, Axis::X, 0, STEPS_PER_MM);
    let start = clock_in(&sim, 1.0);
    let mut ts = McuTimestamp::new(McuId(0), start, 1);

    stepper.reset(&mut ts, 0.0).unwrap();
    let profile = [
        ProfileEntry {
            timestamp: 0.0,
            velocity: 10.0,
            position: 0.0,
        },
        ProfileEntry {
            timestamp: 0.5,
            velocity: 10.0,
            position: 5.0,
        },
    ];
    stepper.queue_step(&mut ts, &profile).unwrap();
    stepper.queue_dwell(&mut ts, 0.25).unwrap();
    assert_eq!(stepper.pending(), 3);
    assert_eq!(stepper.get_steps(), 400);
    assert_eq!(ts.clock, start + 12_000_000);

    stepper.commit().unwrap();
    assert_eq!(stepper.pending(), 0);
    assert_eq!(sim.pending_count(), 3);

    let executed = executed(&sim);
    let order: Vec<_> = executed.iter().map(|c| c.id).collect();
    assert_eq!(order, vec![ids::RESET_STEP_CLOCK, ids::QUEUE_MOVE, ids::QUEUE_DWELL]);

    let step = &executed[1];
    assert_eq!(step.scalar(0), Some(0));
    assert_eq!(step.scalar(1), Some(start));
    assert_eq!(step.scalar(2), Some(8_000_000));
    assert_eq!(step.scalar(3), Some(400));
    assert_eq!(executed[2].scalar(2), Some(4_000_000));

    // 0.1s of send-ahead at 16 MHz.
    for command in &executed {
        assert!(
            command.min_clock + 1_600_000 <= command.req_clock,
            "{} released at {} for {}",
            command.id,
            command.min_clock,
            command.req_clock
        );
    }
    assert_eq!(sim.pool().outstanding(), 0);
}

#[test]
fn late_clock_needs_a_reset() {
    let sim = sim();
    let mut stepper = stepper(&sim, Axis::Y, 1, STEPS_PER_MM);
    let mut ts = McuTimestamp::new(McuId(0), clock_in(&sim, 0.0), 1);

    let err = stepper.reset(&mut ts, 1.0).unwrap_err();
    assert!(matches!(err, MotionError::ResetNecessary { axis: Axis::Y, .. }));
    assert!(err.is_fatal());
    assert_eq!(stepper.pending(), 0);
    stepper.commit().unwrap();
    assert_eq!(sim.pending_count(), 0);
}

#[test]
fn failed_instruction_discards_the_uncommitted_batch() {
    let sim = sim();
    let mut stepper = stepper(&sim, Axis::X, 0, STEPS_PER_MM);
    let mut ts = McuTimestamp::new(McuId(0), clock_in(&sim, 1.0), 1);
    stepper.reset(&mut ts, 1.0).unwrap();
    stepper.queue_dwell(&mut ts, 0.1).unwrap();
    assert_eq!(stepper.pending(), 2);
    assert_eq!(stepper.get_steps(), 80);

    let mut late = McuTimestamp::new(McuId(0), clock_in(&sim, 0.0), 1);
    let err = stepper.reset(&mut late, 2.0).unwrap_err();
    assert!(matches!(err, MotionError::ResetNecessary { axis: Axis::X, .. }));
    assert_eq!(stepper.pending(), 0);
    assert_eq!(stepper.get_steps(), 0);
    assert_eq!(sim.pool().outstanding(), 0);

    stepper.commit().unwrap();
    assert_eq!(sim.pending_count(), 0);
    assert!(executed(&sim).is_empty());
}

#[test]
fn pwm_scales_to_duty() {
    let sim = sim();
    let mut laser = stepper(&sim, Axis::L, 2, 1.0).with_pwm_scale(1000.0);
    let mut ts = McuTimestamp::new(McuId(0), clock_in(&sim, 1.0), 1);

    laser.queue_pwm(&mut ts, 0.25).unwrap();
    assert!(matches!(laser.queue_pwm(&mut ts, 1.5), Err(MotionError::InvalidArgument(_))));
    laser.commit().unwrap();

    let executed = executed(&sim);
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].id, ids::QUEUE_PWM);
    assert_eq!(executed[0].scalar(2), Some(250));
}

#[test]
fn movement_queue_drives_the_simulated_mcu() {
    let sim = sim();
    let queue = MovementQueue::new(
        quiet_config(),
        McuId(0),
        Arc::clone(sim.clock()),
        Arc::new(MasterLock::new()),
        AxisSteppers {
            x: Box::new(stepper(&sim, Axis::X, 0, STEPS_PER_MM)),
            y: Box::new(stepper(&sim, Axis::Y, 1, STEPS_PER_MM)),
            l: Box::new(stepper(&sim, Axis::L, 2, 1.0)),
        },
    )
    .unwrap();

    let base = host_time() + 1.0;
    for i in 0..=100 {
        let t = base + i as f64 * 0.01;
        queue.add_xy(t, i as f64 * 0.1, 0.0).unwrap();
        queue.add_l(t, if i >= 50 { 1.0 } else { 0.0 }).unwrap();
    }
    queue.synchronous_flush_outside_master_lock(true).unwrap();
    assert!(queue.fatal_error().is_none());

    let executed = executed(&sim);
    let resets = addressed(&executed, 0, ids::RESET_STEP_CLOCK);
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].scalar(2), Some(0));
    let steps: i64 = addressed(&executed, 0, ids::QUEUE_MOVE)
        .iter()
        .filter_map(|c| c.scalar(3))
        .sum();
    assert_eq!(steps, (10.0 * STEPS_PER_MM) as i64);
    assert!(addressed(&executed, 1, ids::QUEUE_MOVE).is_empty());

    let duty: Vec<_> = addressed(&executed, 2, ids::QUEUE_PWM)
        .iter()
        .filter_map(|c| c.scalar(2))
        .collect();
    assert_eq!(duty.first(), Some(&0));
    assert_eq!(duty.last(), Some(&255));

    queue.shutdown();
    assert_eq!(sim.pool().outstanding(), 0);
}
