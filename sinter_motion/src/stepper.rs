//! Stepper abstraction.
//!
//! A [`Stepper`] turns flush output into MCU instructions for one axis. Every
//! call takes the axis's [`McuTimestamp`] cursor, schedules at its current
//! tick and advances it by whatever time the instruction consumes.
//!
//! - [`RecordingStepper`] keeps the instructions in memory (tests, dry runs)
//! - [`LinkStepper`] turns them into catalog commands sent over an [`McuLink`]

use parking_lot::Mutex;
use serde::Serialize;
use sinter_common::cancel::CancelToken;
use sinter_common::catalog::ids;
use sinter_common::clock::host_time;
use sinter_common::mcu::McuTimestamp;
use sinter_link::{LinkError, McuLink, PooledCommand};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

use crate::distribute::{ClockRequest, MinClockDistributor};
use crate::error::{MotionError, MotionResult};
use crate::sample::Axis;
use crate::trapezoid::ProfileEntry;

/// Full-scale PWM duty sent for a power of 1.0.
pub const PWM_FULL_SCALE: f64 = 255.0;

/// Per-axis instruction sink.
pub trait Stepper: Send {
    /// Hold the current position for `seconds`.
    fn queue_dwell(&mut self, timestamp: &mut McuTimestamp, seconds: f64) -> MotionResult<()>;

    /// Follow `profile` (consecutive entries form one move each).
    fn queue_step(&mut self, timestamp: &mut McuTimestamp, profile: &[ProfileEntry]) -> MotionResult<()>;

    /// Set output power (0.0 ..= 1.0) at the current tick.
    fn queue_pwm(&mut self, timestamp: &mut McuTimestamp, value: f64) -> MotionResult<()>;

    /// Hard reset: declare `position` as the axis position at the current tick.
    fn reset(&mut self, timestamp: &mut McuTimestamp, position: f64) -> MotionResult<()>;

    /// Position in steps after everything queued so far.
    fn get_steps(&self) -> i64;

    /// Hand everything queued since the last commit to the MCU.
    fn commit(&mut self) -> MotionResult<()>;
}

#[inline]
fn to_steps(position: f64, steps_per_unit: f64) -> i64 {
    (position * steps_per_unit).round() as i64
}

// ─── Recording stepper ──────────────────────────────────────────────

/// Instruction captured by a [`RecordingStepper`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StepperOp {
    Dwell { clock: i64, ticks: i64 },
    Move { clock: i64, ticks: i64, steps: i64, position: f64 },
    Pwm { clock: i64, value: f64 },
    Reset { clock: i64, position: f64 },
}

impl StepperOp {
    pub fn clock(&self) -> i64 {
        match self {
            Self::Dwell { clock, .. }
            | Self::Move { clock, .. }
            | Self::Pwm { clock, .. }
            | Self::Reset { clock, .. } => *clock,
        }
    }
}

/// Failure a [`StepperLog`] injects into the next recorded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArmedFailure {
    ResetNecessary,
    Unreachable,
}

/// Shared view of a [`RecordingStepper`]'s output, usable after the
/// stepper itself has been handed to a movement queue.
#[derive(Debug, Clone, Default)]
pub struct StepperLog {
    ops: Arc<Mutex<Vec<StepperOp>>>,
    commits: Arc<AtomicUsize>,
    fail: Arc<Mutex<Option<ArmedFailure>>>,
}

impl StepperLog {
    pub fn ops(&self) -> Vec<StepperOp> {
        self.ops.lock().clone()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::Acquire)
    }

    /// Make the next queued instruction fail with `ResetNecessary`.
    pub fn arm_reset_necessary(&self) {
        *self.fail.lock() = Some(ArmedFailure::ResetNecessary);
    }

    /// Make the next queued instruction fail as if the MCU went away.
    pub fn arm_unreachable(&self) {
        *self.fail.lock() = Some(ArmedFailure::Unreachable);
    }

    pub fn clear(&self) {
        self.ops.lock().clear();
    }
}

/// In-memory stepper.
#[derive(Debug)]
pub struct RecordingStepper {
    axis: Axis,
    ticks_per_second: f64,
    steps_per_unit: f64,
    steps: i64,
    log: StepperLog,
}

impl RecordingStepper {
    pub fn new(axis: Axis, ticks_per_second: f64, steps_per_unit: f64) -> Self {
        Self {
            axis,
            ticks_per_second,
            steps_per_unit,
            steps: 0,
            log: StepperLog::default(),
        }
    }

    pub fn log(&self) -> StepperLog {
        self.log.clone()
    }

    fn record(&self, op: StepperOp) -> MotionResult<()> {
        match self.log.fail.lock().take() {
            Some(ArmedFailure::ResetNecessary) => {
                return Err(MotionError::ResetNecessary {
                    axis: self.axis,
                    reason: format!("armed failure at clock {}", op.clock()),
                });
            }
            Some(ArmedFailure::Unreachable) => {
                return Err(LinkError::Unreachable(format!("armed failure at clock {}", op.clock())).into());
            }
            None => {}
        }
        self.log.ops.lock().push(op);
        Ok(())
    }

    #[inline]
    fn ticks(&self, seconds: f64) -> i64 {
        (seconds * self.ticks_per_second).round() as i64
    }
}

impl Stepper for RecordingStepper {
    fn queue_dwell(&mut self, timestamp: &mut McuTimestamp, seconds: f64) -> MotionResult<()> {
        let ticks = self.ticks(seconds);
        if ticks <= 0 {
            return Ok(());
        }
        self.record(StepperOp::Dwell {
            clock: timestamp.clock,
            ticks,
        })?;
        timestamp.advance(ticks);
        Ok(())
    }

    fn queue_step(&mut self, timestamp: &mut McuTimestamp, profile: &[ProfileEntry]) -> MotionResult<()> {
        for pair in profile.windows(2) {
            let ticks = self.ticks(pair[1].timestamp - pair[0].timestamp);
            let target = to_steps(pair[1].position, self.steps_per_unit);
            self.record(StepperOp::Move {
                clock: timestamp.clock,
                ticks,
                steps: target - self.steps,
                position: pair[1].position,
            })?;
            self.steps = target;
            timestamp.advance(ticks);
        }
        Ok(())
    }

    fn queue_pwm(&mut self, timestamp: &mut McuTimestamp, value: f64) -> MotionResult<()> {
        self.record(StepperOp::Pwm {
            clock: timestamp.clock,
            value,
        })
    }

    fn reset(&mut self, timestamp: &mut McuTimestamp, position: f64) -> MotionResult<()> {
        self.record(StepperOp::Reset {
            clock: timestamp.clock,
            position,
        })?;
        self.steps = to_steps(position, self.steps_per_unit);
        Ok(())
    }

    fn get_steps(&self) -> i64 {
        self.steps
    }

    fn commit(&mut self) -> MotionResult<()> {
        self.log.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

// ─── Link stepper ───────────────────────────────────────────────────

/// Stepper driving one MCU object (`oid`) through an [`McuLink`].
pub struct LinkStepper {
    link: Arc<dyn McuLink>,
    axis: Axis,
    oid: u8,
    steps_per_unit: f64,
    pwm_scale: f64,
    steps: i64,
    /// Step position as of the last commit.
    committed_steps: i64,
    distributor: MinClockDistributor,
    batch: Vec<PooledCommand>,
    requests: Vec<ClockRequest>,
    cancel: CancelToken,
}

impl LinkStepper {
    /// # Arguments
    ///
    /// * `link` - Where commands are sent
    /// * `axis` - Axis this stepper serves (for error reports)
    /// * `oid` - MCU object id the commands address
    /// * `steps_per_unit` - Steps per mm (ignored for PWM outputs)
    /// * `distributor` - Spreads release floors on commit
    /// * `cancel` - Aborts blocking sends
    pub fn new(
        link: Arc<dyn McuLink>,
        axis: Axis,
        oid: u8,
        steps_per_unit: f64,
        distributor: MinClockDistributor,
        cancel: CancelToken,
    ) -> Self {
        Self {
            link,
            axis,
            oid,
            steps_per_unit,
            pwm_scale: PWM_FULL_SCALE,
            steps: 0,
            committed_steps: 0,
            distributor,
            batch: Vec::new(),
            requests: Vec::new(),
            cancel,
        }
    }

    #[must_use]
    pub fn with_pwm_scale(mut self, scale: f64) -> Self {
        self.pwm_scale = scale;
        self
    }

    /// Commands queued since the last commit.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Fail if `clock` can no longer be released `min_send_ahead` early.
    fn check_schedule(&self, clock: i64) -> MotionResult<()> {
        let now = self.link.clock().clock_of(host_time())?;
        let earliest = now + self.distributor.min_ahead() as f64;
        if (clock as f64) < earliest {
            return Err(MotionError::ResetNecessary {
                axis: self.axis,
                reason: format!("clock {clock} is behind the earliest schedulable clock {earliest:.0}"),
            });
        }
        Ok(())
    }

    fn enqueue(&mut self, id: sinter_common::catalog::CommandId, clock: i64, values: &[i64]) -> MotionResult<()> {
        self.check_schedule(clock)?;
        let command = self.link.pool().command(id, values)?;
        self.batch.push(command);
        self.requests.push(ClockRequest::new(clock.max(0) as u64, 0));
        Ok(())
    }

    fn ticks(&self, seconds: f64) -> MotionResult<i64> {
        Ok(self.link.clock().duration_in_clock_ticks(seconds)?.round() as i64)
    }

    /// Run `op`, dropping everything queued since the last commit if it fails.
    fn guarded(&mut self, op: impl FnOnce(&mut Self) -> MotionResult<()>) -> MotionResult<()> {
        let result = op(self);
        if result.is_err() {
            let dropped = self.batch.len();
            self.batch.clear();
            self.requests.clear();
            self.steps = self.committed_steps;
            if dropped > 0 {
                debug!(axis = %self.axis, dropped, "uncommitted batch discarded");
            }
        }
        result
    }
}

impl Stepper for LinkStepper {
    fn queue_dwell(&mut self, timestamp: &mut McuTimestamp, seconds: f64) -> MotionResult<()> {
        self.guarded(|s| {
            let ticks = s.ticks(seconds)?;
            if ticks <= 0 {
                return Ok(());
            }
            let oid = i64::from(s.oid);
            s.enqueue(ids::QUEUE_DWELL, timestamp.clock, &[oid, timestamp.clock, ticks])?;
            timestamp.advance(ticks);
            Ok(())
        })
    }

    fn queue_step(&mut self, timestamp: &mut McuTimestamp, profile: &[ProfileEntry]) -> MotionResult<()> {
        self.guarded(|s| {
            let oid = i64::from(s.oid);
            for pair in profile.windows(2) {
                let ticks = s.ticks(pair[1].timestamp - pair[0].timestamp)?;
                let target = to_steps(pair[1].position, s.steps_per_unit);
                let steps = target - s.steps;
                s.enqueue(ids::QUEUE_MOVE, timestamp.clock, &[oid, timestamp.clock, ticks, steps])?;
                s.steps = target;
                timestamp.advance(ticks);
            }
            Ok(())
        })
    }

    fn queue_pwm(&mut self, timestamp: &mut McuTimestamp, value: f64) -> MotionResult<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(MotionError::invalid(format!("power {value} outside [0, 1]")));
        }
        self.guarded(|s| {
            let duty = (value * s.pwm_scale).round() as i64;
            s.enqueue(
                ids::QUEUE_PWM,
                timestamp.clock,
                &[i64::from(s.oid), timestamp.clock, duty],
            )
        })
    }

    fn reset(&mut self, timestamp: &mut McuTimestamp, position: f64) -> MotionResult<()> {
        self.guarded(|s| {
            let steps = to_steps(position, s.steps_per_unit);
            s.enqueue(
                ids::RESET_STEP_CLOCK,
                timestamp.clock,
                &[i64::from(s.oid), timestamp.clock, steps],
            )?;
            s.steps = steps;
            Ok(())
        })
    }

    fn get_steps(&self) -> i64 {
        self.steps
    }

    fn commit(&mut self) -> MotionResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.distributor.distribute(&mut self.requests);
        self.committed_steps = self.steps;
        let count = self.batch.len();
        let mut result = Ok(());
        for (command, request) in self.batch.drain(..).zip(self.requests.drain(..)) {
            if result.is_err() {
                // Remaining commands go straight back to the pool.
                continue;
            }
            trace!(axis = %self.axis, req = request.requested, min = request.min_clock, "send");
            result = self
                .link
                .send(command, request.min_clock, request.requested, &self.cancel)
                .map_err(MotionError::from);
        }
        debug!(axis = %self.axis, count, "stepper batch committed");
        result
    }
}
