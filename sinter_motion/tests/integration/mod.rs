//! Shared rigs for the movement queue tests.

mod end_to_end;
mod flush_control;
mod link_stepper;

use sinter_common::clock::{ClockModel, ClockState};
use sinter_common::config::MovementConfig;
use sinter_common::mcu::McuId;
use sinter_motion::stepper::{RecordingStepper, StepperLog, StepperOp};
use sinter_motion::{Axis, AxisSteppers, MasterLock, MovementQueue};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// MCU ticks per second of the test clock; anchored at host time zero.
pub const TICKS_PER_SECOND: f64 = 16_000_000.0;

pub const STEPS_PER_MM: f64 = 80.0;

pub fn ready_clock() -> Arc<ClockModel> {
    Arc::new(ClockModel::with_state(ClockState::ready(
        TICKS_PER_SECOND,
        0.0,
        0.0,
        TICKS_PER_SECOND,
    )))
}

/// Config whose flush period is long enough that nothing flushes on its own.
pub fn quiet_config() -> MovementConfig {
    MovementConfig {
        flush_period: 5.0,
        ..MovementConfig::default()
    }
}

pub struct Rig {
    pub queue: MovementQueue,
    pub x: StepperLog,
    pub y: StepperLog,
    pub l: StepperLog,
}

pub fn rig(config: MovementConfig) -> Rig {
    let x = RecordingStepper::new(Axis::X, TICKS_PER_SECOND, STEPS_PER_MM);
    let y = RecordingStepper::new(Axis::Y, TICKS_PER_SECOND, STEPS_PER_MM);
    let l = RecordingStepper::new(Axis::L, TICKS_PER_SECOND, 1.0);
    let (x_log, y_log, l_log) = (x.log(), y.log(), l.log());
    let queue = MovementQueue::new(
        config,
        McuId(0),
        ready_clock(),
        Arc::new(MasterLock::new()),
        AxisSteppers {
            x: Box::new(x),
            y: Box::new(y),
            l: Box::new(l),
        },
    )
    .unwrap();
    Rig {
        queue,
        x: x_log,
        y: y_log,
        l: l_log,
    }
}

/// Moves and dwells, the instructions a position axis is budgeted for.
pub fn motion_ops(log: &StepperLog) -> usize {
    log.ops()
        .iter()
        .filter(|op| matches!(op, StepperOp::Move { .. } | StepperOp::Dwell { .. }))
        .count()
}

pub fn pwm_values(log: &StepperLog) -> Vec<f64> {
    log.ops()
        .iter()
        .filter_map(|op| match op {
            StepperOp::Pwm { value, .. } => Some(*value),
            _ => None,
        })
        .collect()
}

/// Poll `condition` for up to `timeout`.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
