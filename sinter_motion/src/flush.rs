//! Flush worker.
//!
//! Runs on the movement queue's dedicated worker thread and owns every piece
//! of per-axis scratch state: steppers, compressors, trapezoid calculators
//! and the running `(time, value)` cursors. One flush pass:
//!
//! 1. under the master lock, claim at most one flush period of samples per axis
//! 2. unlocked, per axis: strip a leading reset marker, compress toward the
//!    axis rate budget, emit dwell / move / set-power instructions, commit
//! 3. under the master lock, write the axis timestamps back
//!
//! Step 2 optionally runs the three axes on a pool of three workers.

use crossbeam::channel::Sender;
use serde::Serialize;
use sinter_common::clock::ClockModel;
use sinter_common::mcu::{McuId, McuTimestamp};
use sinter_common::worker::{FixedPool, WorkerEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, trace};

use crate::compress::Compressor;
use crate::error::{MotionError, MotionResult};
use crate::queue::{AxisSteppers, Claim, QueueShared};
use crate::sample::{Axis, SamplePoint};
use crate::stepper::Stepper;
use crate::trapezoid::TrapezoidCalculator;

/// Clamped moves that end earlier than this before their sample get no dwell [s].
const REMAINDER_SLACK: f64 = 1e-9;

/// Work submitted to the flush worker.
pub(crate) enum FlushJob {
    /// Producer or scheduler trigger; result is logged.
    Scheduled,
    /// Caller waits for the result.
    Sync {
        all: bool,
        reply: Sender<MotionResult<()>>,
    },
}

// ─── Diagnostics ────────────────────────────────────────────────────

/// What the flush worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum FlushPhase {
    Idle = 0,
    Claiming = 1,
    Emitting = 2,
    Committing = 3,
}

impl FlushPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Claiming,
            2 => Self::Emitting,
            3 => Self::Committing,
            _ => Self::Idle,
        }
    }
}

/// Counters shared between the flush worker and observers.
#[derive(Debug, Default)]
pub struct FlushDiagnostics {
    phase: AtomicU8,
    flushes: AtomicU64,
    passes: AtomicU64,
    points_in: AtomicU64,
    points_out: AtomicU64,
    instructions: AtomicU64,
    failures: AtomicU64,
    last_pass_us: AtomicU64,
}

/// Point-in-time copy of [`FlushDiagnostics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub phase: FlushPhase,
    pub flushes: u64,
    pub passes: u64,
    pub points_in: u64,
    pub points_out: u64,
    pub instructions: u64,
    pub failures: u64,
    pub last_pass_us: u64,
}

impl FlushDiagnostics {
    fn set_phase(&self, phase: FlushPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    pub fn phase(&self) -> FlushPhase {
        FlushPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            phase: self.phase(),
            flushes: self.flushes.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            points_in: self.points_in.load(Ordering::Relaxed),
            points_out: self.points_out.load(Ordering::Relaxed),
            instructions: self.instructions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_pass_us: self.last_pass_us.load(Ordering::Relaxed),
        }
    }
}

// ─── Per-axis flush ─────────────────────────────────────────────────

/// Result of one axis pass.
#[derive(Debug, Default)]
pub(crate) struct AxisOutcome {
    pub timestamp: Option<McuTimestamp>,
    pub cursor: Option<SamplePoint>,
    pub points_in: usize,
    pub points_out: usize,
    pub instructions: usize,
}

/// Axis state dumped when a stepper demands a reset.
#[derive(Serialize)]
struct AxisPostmortem<'a> {
    axis: Axis,
    initial_timestamp: Option<McuTimestamp>,
    cursor: Option<SamplePoint>,
    carry: f64,
    compressed: &'a [SamplePoint],
    previous_compressed: &'a [SamplePoint],
}

/// Scratch state of one axis; touched by one thread at a time.
pub(crate) struct AxisFlush {
    axis: Axis,
    stepper: Box<dyn Stepper>,
    compressor: Compressor,
    calc: TrapezoidCalculator,
    clock: Arc<ClockModel>,
    mcu: McuId,
    rate: f64,
    compression_factor: f64,
    position_epsilon: f64,
    time_epsilon: f64,
    power_epsilon: f64,
    input: Vec<SamplePoint>,
    compressed: Vec<SamplePoint>,
    previous: Vec<SamplePoint>,
    carry: f64,
    cursor: Option<SamplePoint>,
}

impl AxisFlush {
    fn new(axis: Axis, stepper: Box<dyn Stepper>, shared: &QueueShared) -> MotionResult<Self> {
        let config = &shared.config;
        let rate = if axis.is_positional() {
            config.xy_moves_per_second
        } else {
            config.l_changes_per_second
        };
        Ok(Self {
            axis,
            stepper,
            compressor: Compressor::new(),
            calc: TrapezoidCalculator::from_config(config)?,
            clock: Arc::clone(&shared.clock),
            mcu: shared.mcu,
            rate,
            compression_factor: config.compression_factor,
            position_epsilon: config.min_position_epsilon,
            time_epsilon: config.min_time_epsilon,
            power_epsilon: config.min_power_epsilon,
            input: Vec::new(),
            compressed: Vec::new(),
            previous: Vec::new(),
            carry: 0.0,
            cursor: None,
        })
    }

    fn timestamp_at(&self, time: f64) -> MotionResult<McuTimestamp> {
        let clock = self.clock.clock_of(time)?.round() as i64;
        Ok(McuTimestamp::new(self.mcu, clock, 1))
    }

    pub fn run(&mut self, claim: Claim) -> MotionResult<AxisOutcome> {
        let initial = claim.timestamp;
        let result = self.flush_claim(claim);
        if let Err(err @ MotionError::ResetNecessary { .. }) = &result {
            self.log_postmortem(initial, err);
        }
        result
    }

    fn log_postmortem(&self, initial: Option<McuTimestamp>, err: &MotionError) {
        let state = AxisPostmortem {
            axis: self.axis,
            initial_timestamp: initial,
            cursor: self.cursor,
            carry: self.carry,
            compressed: &self.compressed,
            previous_compressed: &self.previous,
        };
        match serde_json::to_string(&state) {
            Ok(json) => error!(axis = %self.axis, error = %err, state = %json, "stepper reset necessary"),
            Err(e) => error!(axis = %self.axis, error = %err, "stepper reset necessary (state unavailable: {})", e),
        }
    }

    fn flush_claim(&mut self, claim: Claim) -> MotionResult<AxisOutcome> {
        let mut points = claim.points.as_slice();
        let mut timestamp = claim.timestamp;
        let mut outcome = AxisOutcome {
            timestamp,
            cursor: self.cursor,
            points_in: points.len(),
            ..AxisOutcome::default()
        };
        if points.is_empty() {
            return Ok(outcome);
        }

        // ── Baseline: reset marker, or the very first sample ──
        if let Some(marker) = points.first().filter(|p| p.is_reset()) {
            let baseline = marker.unmarked();
            let mut ts = match timestamp {
                Some(ts) if claim.dwelled != Some(true) => ts,
                _ => self.timestamp_at(baseline.time)?,
            };
            // A plain reset keeps the MCU clock; idle until the reset time.
            if claim.dwelled != Some(true) && timestamp.is_some() {
                if let Some(cursor) = self.cursor.filter(|c| baseline.time > c.time) {
                    self.stepper.queue_dwell(&mut ts, baseline.time - cursor.time)?;
                    outcome.instructions += 1;
                }
            }
            self.stepper.reset(&mut ts, baseline.value)?;
            debug!(axis = %self.axis, time = baseline.time, value = baseline.value, "axis reset");
            timestamp = Some(ts);
            self.cursor = Some(baseline);
            self.carry = 0.0;
            outcome.instructions += 1;
            points = &points[1..];
        }
        let mut ts = match timestamp {
            Some(ts) => ts,
            None => self.timestamp_at(points[0].time)?,
        };
        let cursor = match self.cursor {
            Some(cursor) => cursor,
            None => {
                let first = points[0];
                if self.axis.is_positional() {
                    self.stepper.reset(&mut ts, first.value)?;
                } else {
                    self.stepper.queue_pwm(&mut ts, first.value)?;
                }
                outcome.instructions += 1;
                points = &points[1..];
                self.cursor = Some(first);
                first
            }
        };

        if !points.is_empty() {
            // ── Compress toward the rate budget ──
            self.input.clear();
            self.input.push(cursor);
            self.input.extend_from_slice(points);
            let elapsed = points[points.len() - 1].time - cursor.time;
            let budget = self.rate * elapsed / self.compression_factor + self.carry;
            let moves = budget.floor().max(1.0);
            self.carry = budget - moves;
            let target = moves as usize + 1;

            std::mem::swap(&mut self.previous, &mut self.compressed);
            self.compressed.clear();
            if self.axis.is_positional() {
                self.compressor
                    .compress_moves(&self.input, target, self.position_epsilon, &mut self.compressed);
            } else {
                self.compressor.compress_pwm(
                    &self.input,
                    target,
                    self.time_epsilon,
                    self.power_epsilon,
                    &mut self.compressed,
                );
            }
            outcome.points_out = self.compressed.len().saturating_sub(1);
            trace!(
                axis = %self.axis,
                points = self.input.len(),
                target,
                kept = self.compressed.len(),
                carry = self.carry,
                "compressed"
            );

            // ── Emit ──
            for i in 1..self.compressed.len() {
                let point = self.compressed[i];
                outcome.instructions += self.emit(&mut ts, point)?;
            }
        }

        self.stepper.commit()?;
        outcome.timestamp = Some(ts);
        outcome.cursor = self.cursor;
        Ok(outcome)
    }

    /// Emit the instructions that carry the cursor to `point`.
    fn emit(&mut self, ts: &mut McuTimestamp, point: SamplePoint) -> MotionResult<usize> {
        let cursor = self.cursor.unwrap_or(point);
        let dt = point.time - cursor.time;
        let mut count = 0;

        if self.axis.is_positional() {
            if point.value == cursor.value {
                if dt > 0.0 {
                    self.stepper.queue_dwell(ts, dt)?;
                    count += 1;
                }
            } else {
                let speed = if dt > 0.0 {
                    (point.value - cursor.value).abs() / dt
                } else {
                    f64::MAX
                };
                self.calc.clear();
                let end = self
                    .calc
                    .move_segment(speed, speed, cursor.value, point.value, cursor.time)?;
                self.stepper.queue_step(ts, self.calc.entries())?;
                count += 1;
                let remainder = point.time - end;
                if remainder > REMAINDER_SLACK {
                    self.stepper.queue_dwell(ts, remainder)?;
                    count += 1;
                }
            }
        } else {
            if dt > 0.0 {
                self.stepper.queue_dwell(ts, dt)?;
                count += 1;
            }
            if point.value != cursor.value {
                self.stepper.queue_pwm(ts, point.value)?;
                count += 1;
            }
        }

        self.cursor = Some(point);
        Ok(count)
    }
}

// ─── Flusher ────────────────────────────────────────────────────────

/// Worker-side flush driver.
pub(crate) struct Flusher {
    shared: Arc<QueueShared>,
    axes: Vec<AxisFlush>,
    pool: Option<FixedPool>,
    last_report: Instant,
}

impl Flusher {
    pub fn new(shared: Arc<QueueShared>, steppers: AxisSteppers) -> MotionResult<Self> {
        let axes = vec![
            AxisFlush::new(Axis::X, steppers.x, &shared)?,
            AxisFlush::new(Axis::Y, steppers.y, &shared)?,
            AxisFlush::new(Axis::L, steppers.l, &shared)?,
        ];
        let pool = if shared.config.parallel_flush {
            Some(FixedPool::new("motion-axis", Axis::ALL.len())?)
        } else {
            None
        };
        Ok(Self {
            shared,
            axes,
            pool,
            last_report: Instant::now(),
        })
    }

    pub fn handle(&mut self, event: WorkerEvent<FlushJob>) {
        match event {
            WorkerEvent::Job(FlushJob::Scheduled) => {
                self.shared.flush_queued.store(false, Ordering::Release);
                self.flush_logged(false);
            }
            WorkerEvent::Job(FlushJob::Sync { all, reply }) => {
                let result = self.flush(all);
                let _ = reply.send(result);
            }
            WorkerEvent::Tick => {
                if self.timer_due() {
                    self.flush_logged(false);
                }
            }
        }
        self.report_diagnostics();
    }

    fn timer_due(&self) -> bool {
        let pending = self.shared.pending.lock();
        pending.any_pending()
            && pending.last_flush_start.elapsed().as_secs_f64() >= self.shared.config.flush_period
    }

    fn flush_logged(&mut self, all: bool) {
        match self.flush(all) {
            Ok(()) => {}
            Err(MotionError::Fatal(_)) => {}
            Err(e) => error!(error = %e, "scheduled flush failed"),
        }
    }

    fn report_diagnostics(&mut self) {
        if self.last_report.elapsed().as_secs_f64() < self.shared.config.diagnostics_interval {
            return;
        }
        self.last_report = Instant::now();
        if let Ok(json) = serde_json::to_string(&self.shared.diagnostics.snapshot()) {
            debug!(diagnostics = %json, "flush diagnostics");
        }
    }

    /// Flush until nothing new arrived (or, with `all`, until every axis is empty).
    pub fn flush(&mut self, all: bool) -> MotionResult<()> {
        if let Some(msg) = self.shared.fatal_error() {
            return Err(MotionError::Fatal(msg));
        }
        let shared = Arc::clone(&self.shared);
        let _flush = shared.flush_lock.lock();
        shared.diagnostics.flushes.fetch_add(1, Ordering::Relaxed);

        let result = loop {
            let started = Instant::now();
            shared.diagnostics.set_phase(FlushPhase::Claiming);
            let arrivals = shared.arrivals.load(Ordering::Acquire);
            let claims: Vec<Claim> = {
                let _master = shared.master.lock();
                let mut pending = shared.pending.lock();
                pending.last_flush_start = started;
                let period = shared.config.flush_period;
                pending.axes.iter_mut().map(|a| a.claim(period)).collect()
            };
            if claims.iter().all(|c| c.points.is_empty()) {
                break Ok(());
            }

            shared.diagnostics.set_phase(FlushPhase::Emitting);
            let outcomes = match self.run_axes(claims) {
                Ok(outcomes) => outcomes,
                Err(e) => break Err(e),
            };

            shared.diagnostics.set_phase(FlushPhase::Committing);
            let mut first_error = None;
            {
                let _master = shared.master.lock();
                let mut pending = shared.pending.lock();
                for (slot, outcome) in pending.axes.iter_mut().zip(outcomes) {
                    match outcome {
                        Ok(outcome) => {
                            slot.timestamp = outcome.timestamp;
                            slot.emitted = outcome.cursor;
                            let d = &shared.diagnostics;
                            d.points_in.fetch_add(outcome.points_in as u64, Ordering::Relaxed);
                            d.points_out.fetch_add(outcome.points_out as u64, Ordering::Relaxed);
                            d.instructions
                                .fetch_add(outcome.instructions as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                        }
                    }
                }
            }
            let elapsed_us = started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
            shared.diagnostics.passes.fetch_add(1, Ordering::Relaxed);
            shared.diagnostics.last_pass_us.store(elapsed_us, Ordering::Relaxed);
            if let Some(e) = first_error {
                break Err(e);
            }

            let again = {
                let pending = shared.pending.lock();
                let arrived = shared.arrivals.load(Ordering::Acquire) != arrivals;
                pending.any_pending()
                    && (all || arrived || pending.is_full(shared.config.flush_period))
            };
            if !again {
                break Ok(());
            }
            trace!("re-flushing");
        };

        shared.diagnostics.set_phase(FlushPhase::Idle);
        // Claimed samples are gone and cursors have moved, so any failure
        // leaves host and MCU out of step.
        if let Err(e) = &result {
            shared.diagnostics.failures.fetch_add(1, Ordering::Relaxed);
            shared.set_fatal(e);
        }
        result
    }

    /// Run every axis on its claim, in parallel when a pool is configured.
    fn run_axes(&mut self, claims: Vec<Claim>) -> MotionResult<Vec<MotionResult<AxisOutcome>>> {
        let Some(pool) = &self.pool else {
            return Ok(self
                .axes
                .iter_mut()
                .zip(claims)
                .map(|(axis, claim)| axis.run(claim))
                .collect());
        };

        let jobs: Vec<_> = std::mem::take(&mut self.axes)
            .into_iter()
            .zip(claims)
            .map(|(mut axis, claim)| {
                move || {
                    let outcome = axis.run(claim);
                    (axis, outcome)
                }
            })
            .collect();
        match pool.run_all(jobs) {
            Ok(results) => {
                let mut outcomes = Vec::with_capacity(results.len());
                for (axis, outcome) in results {
                    self.axes.push(axis);
                    outcomes.push(outcome);
                }
                Ok(outcomes)
            }
            Err(e) => {
                let err = MotionError::Fatal(format!("axis worker lost: {e}"));
                self.shared.set_fatal(&err);
                Err(err)
            }
        }
    }
}
