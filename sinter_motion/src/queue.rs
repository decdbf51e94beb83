//! Movement queue: per-axis sample buffering and flush scheduling.
//!
//! Producers append X/Y positions and L (laser power) samples under the
//! master lock; nothing on that path blocks on I/O. A dedicated flush worker
//! claims buffered samples, compresses them and drives the axis steppers
//! (see [`crate::flush`]).
//!
//! ## Locking
//!
//! ```text
//! producer:  master ──► pending
//! flush:     flush ──► master ──► pending   (claim)
//!                      ... compress + emit, unlocked ...
//!                      master ──► pending   (commit timestamps)
//! ```
//!
//! The flush lock is never taken under the master lock. Producer-side flush
//! triggers only peek at it; a trigger dropped because a flush is running
//! is picked up by that flush's re-check before it exits.

use crossbeam::channel;
use parking_lot::Mutex;
use sinter_common::clock::ClockModel;
use sinter_common::config::MovementConfig;
use sinter_common::mcu::{McuId, McuTimestamp};
use sinter_common::worker::{DedicatedWorker, Placement, WorkerError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{MotionError, MotionResult};
use crate::flush::{DiagnosticsSnapshot, FlushDiagnostics, FlushJob, Flusher};
use crate::lock::MasterLock;
use crate::sample::{Axis, SamplePoint};
use crate::stepper::Stepper;

/// Invoked once with the error that stopped the queue.
pub type FatalCallback = Arc<dyn Fn(&MotionError) + Send + Sync>;

/// Flush worker queue depth.
const FLUSH_QUEUE_CAPACITY: usize = 16;

/// One stepper per axis.
pub struct AxisSteppers {
    pub x: Box<dyn Stepper>,
    pub y: Box<dyn Stepper>,
    pub l: Box<dyn Stepper>,
}

// ─── Pending state (master lock) ────────────────────────────────────

/// Samples claimed by one flush pass for one axis.
#[derive(Debug, Default)]
pub(crate) struct Claim {
    pub points: Vec<SamplePoint>,
    /// Set when `points` starts with a reset marker.
    pub dwelled: Option<bool>,
    pub timestamp: Option<McuTimestamp>,
}

#[derive(Debug, Default)]
pub(crate) struct AxisPending {
    points: VecDeque<SamplePoint>,
    /// `dwelled` flag of every queued reset marker, oldest first.
    resets: VecDeque<bool>,
    last: Option<SamplePoint>,
    /// Authoritative MCU cursor; `None` until the first flush.
    pub timestamp: Option<McuTimestamp>,
    /// Last point emitted by a committed flush.
    pub emitted: Option<SamplePoint>,
}

impl AxisPending {
    fn check(&self, axis: Axis, time: f64) -> MotionResult<()> {
        match self.last {
            Some(last) if time < last.true_time() => Err(MotionError::NonMonotonicSample {
                axis,
                time,
                last: last.true_time(),
            }),
            _ => Ok(()),
        }
    }

    fn push(&mut self, point: SamplePoint) {
        if !point.is_reset() && self.last == Some(point) {
            return;
        }
        self.points.push_back(point);
        self.last = Some(point);
    }

    fn push_reset(&mut self, point: SamplePoint, dwelled: bool) {
        self.points.push_back(point);
        self.resets.push_back(dwelled);
        self.last = Some(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn buffered_duration(&self) -> f64 {
        match (self.points.front(), self.points.back()) {
            (Some(first), Some(last)) => last.true_time() - first.true_time(),
            _ => 0.0,
        }
    }

    /// Split off at most `period` seconds of samples.
    ///
    /// A reset marker only ever leads a claim.
    pub fn claim(&mut self, period: f64) -> Claim {
        let mut claim = Claim {
            timestamp: self.timestamp,
            ..Claim::default()
        };
        let Some(limit) = self.points.front().map(|p| p.true_time() + period) else {
            return claim;
        };
        while let Some(&point) = self.points.front() {
            if !claim.points.is_empty() && (point.is_reset() || point.true_time() > limit) {
                break;
            }
            if point.is_reset() {
                claim.dwelled = self.resets.pop_front();
            }
            claim.points.push(point);
            self.points.pop_front();
        }
        claim
    }
}

#[derive(Debug)]
pub(crate) struct PendingState {
    pub axes: [AxisPending; 3],
    pub last_flush_start: Instant,
}

impl PendingState {
    pub fn any_pending(&self) -> bool {
        self.axes.iter().any(|a| !a.is_empty())
    }

    /// Some axis is due for an immediate flush.
    pub fn is_full(&self, period: f64) -> bool {
        let aged = self.last_flush_start.elapsed().as_secs_f64() >= period;
        self.axes
            .iter()
            .any(|a| !a.is_empty() && (aged || a.buffered_duration() >= period))
    }
}

// ─── Shared state ───────────────────────────────────────────────────

pub(crate) struct QueueShared {
    pub config: MovementConfig,
    pub mcu: McuId,
    pub clock: Arc<ClockModel>,
    pub master: Arc<MasterLock>,
    pub pending: Mutex<PendingState>,
    pub flush_lock: Mutex<()>,
    /// A `Scheduled` job is waiting in the worker queue.
    pub flush_queued: AtomicBool,
    /// Bumped by every producer insert.
    pub arrivals: AtomicU64,
    pub diagnostics: FlushDiagnostics,
    pub fatal: Mutex<Option<String>>,
    pub on_fatal: Mutex<Option<FatalCallback>>,
}

impl QueueShared {
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    /// Record `err` as the queue's fatal error and notify the callback.
    pub fn set_fatal(&self, err: &MotionError) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_some() {
                return;
            }
            *fatal = Some(err.to_string());
        }
        let callback = self.on_fatal.lock().clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }
}

// ─── Movement queue ─────────────────────────────────────────────────

/// Three-axis movement queue with its flush worker.
pub struct MovementQueue {
    shared: Arc<QueueShared>,
    worker: Mutex<Option<DedicatedWorker<FlushJob>>>,
}

impl MovementQueue {
    /// Validate `config` and start the flush worker.
    ///
    /// # Arguments
    ///
    /// * `config` - Flush period, axis rates, epsilons and clamps
    /// * `mcu` - MCU the axis timestamps belong to
    /// * `clock` - Converts sample times to MCU clocks
    /// * `master` - Lock shared with the rest of the device subsystem
    /// * `steppers` - Instruction sinks, one per axis
    pub fn new(
        config: MovementConfig,
        mcu: McuId,
        clock: Arc<ClockModel>,
        master: Arc<MasterLock>,
        steppers: AxisSteppers,
    ) -> MotionResult<Self> {
        config
            .validate()
            .map_err(|e| MotionError::invalid(e.to_string()))?;

        let tick = Duration::from_secs_f64(config.flush_period / 4.0);
        let placement = Placement {
            cpu: config.worker_cpu,
            rt_priority: None,
        };
        let shared = Arc::new(QueueShared {
            config,
            mcu,
            clock,
            master,
            pending: Mutex::new(PendingState {
                axes: Default::default(),
                last_flush_start: Instant::now(),
            }),
            flush_lock: Mutex::new(()),
            flush_queued: AtomicBool::new(false),
            arrivals: AtomicU64::new(0),
            diagnostics: FlushDiagnostics::default(),
            fatal: Mutex::new(None),
            on_fatal: Mutex::new(None),
        });

        let mut flusher = Flusher::new(Arc::clone(&shared), steppers)?;
        let worker = DedicatedWorker::spawn(
            "motion-flush",
            FLUSH_QUEUE_CAPACITY,
            Some(tick),
            placement,
            move |event| flusher.handle(event),
        )?;
        info!(
            flush_period = shared.config.flush_period,
            parallel = shared.config.parallel_flush,
            "movement queue started"
        );
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Called once with the error that stops the queue.
    pub fn set_fatal_callback(&self, callback: FatalCallback) {
        *self.shared.on_fatal.lock() = Some(callback);
    }

    pub fn master_lock(&self) -> &Arc<MasterLock> {
        &self.shared.master
    }

    fn check_fatal(&self) -> MotionResult<()> {
        match self.shared.fatal_error() {
            Some(msg) => Err(MotionError::Fatal(msg)),
            None => Ok(()),
        }
    }

    // ── Producer ──

    /// Queue an X/Y position sample.
    pub fn add_xy(&self, time: f64, x: f64, y: f64) -> MotionResult<()> {
        let time = sample_time(time)?;
        finite("x", x)?;
        finite("y", y)?;
        self.insert(|pending| {
            pending.axes[Axis::X.index()].check(Axis::X, time)?;
            pending.axes[Axis::Y.index()].check(Axis::Y, time)?;
            pending.axes[Axis::X.index()].push(SamplePoint::new(time, x));
            pending.axes[Axis::Y.index()].push(SamplePoint::new(time, y));
            Ok(())
        })
    }

    /// Queue a laser power sample (0.0 ..= 1.0).
    pub fn add_l(&self, time: f64, power: f64) -> MotionResult<()> {
        let time = sample_time(time)?;
        if !(0.0..=1.0).contains(&power) {
            return Err(MotionError::invalid(format!("power {power} outside [0, 1]")));
        }
        self.insert(|pending| {
            let axis = &mut pending.axes[Axis::L.index()];
            axis.check(Axis::L, time)?;
            axis.push(SamplePoint::new(time, power));
            Ok(())
        })
    }

    /// Declare the X/Y position at `time`, forcing a hard stepper reset.
    ///
    /// With `dwelled`, the axis timestamps are re-derived from the clock
    /// model at `time` rather than continued from the previous flush.
    pub fn add_reset(&self, time: f64, x: f64, y: f64, dwelled: bool) -> MotionResult<()> {
        let time = sample_time(time)?;
        finite("x", x)?;
        finite("y", y)?;
        self.insert(|pending| {
            pending.axes[Axis::X.index()].check(Axis::X, time)?;
            pending.axes[Axis::Y.index()].check(Axis::Y, time)?;
            pending.axes[Axis::X.index()].push_reset(SamplePoint::reset(time, x), dwelled);
            pending.axes[Axis::Y.index()].push_reset(SamplePoint::reset(time, y), dwelled);
            Ok(())
        })
    }

    fn insert<F>(&self, apply: F) -> MotionResult<()>
    where
        F: FnOnce(&mut PendingState) -> MotionResult<()>,
    {
        self.check_fatal()?;
        let _master = self.shared.master.lock_unless_held();
        let full = {
            let mut pending = self.shared.pending.lock();
            apply(&mut pending)?;
            pending.is_full(self.shared.config.flush_period)
        };
        self.shared.arrivals.fetch_add(1, Ordering::AcqRel);
        if full {
            self.request_flush();
        }
        Ok(())
    }

    /// Producer-side trigger; may run under the master lock.
    fn request_flush(&self) {
        if self.shared.flush_lock.is_locked() {
            return;
        }
        if self.shared.flush_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let submitted = match self.worker.try_lock() {
            Some(worker) => worker.as_ref().map(|w| w.try_submit(FlushJob::Scheduled)),
            None => None,
        };
        if !matches!(submitted, Some(Ok(()))) {
            self.shared.flush_queued.store(false, Ordering::Release);
        }
    }

    // ── Flush triggers ──

    /// Ask the worker for a flush and return immediately.
    ///
    /// # Errors
    ///
    /// `LockOrder` if the calling thread holds the master lock.
    pub fn schedule_flush_outside_master_lock(&self) -> MotionResult<()> {
        if self.shared.master.is_held_by_current_thread() {
            return Err(MotionError::LockOrder);
        }
        self.check_fatal()?;
        match self.shared.flush_lock.try_lock() {
            // A running flush re-checks for new samples before it exits.
            None => return Ok(()),
            Some(guard) => drop(guard),
        }
        if self.shared.flush_queued.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let worker = self.worker.lock();
        let result = match worker.as_ref() {
            Some(w) => w.try_submit(FlushJob::Scheduled),
            None => Err(WorkerError::Stopped("motion-flush".to_string())),
        };
        match result {
            Ok(()) => Ok(()),
            Err(WorkerError::Full(_)) => {
                self.shared.flush_queued.store(false, Ordering::Release);
                debug!("flush queue full, trigger dropped");
                Ok(())
            }
            Err(e) => {
                self.shared.flush_queued.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Flush on the worker and wait for the result.
    ///
    /// With `flush_all`, keeps flushing until every axis is empty.
    ///
    /// # Errors
    ///
    /// `LockOrder` if the calling thread holds the master lock; otherwise
    /// whatever the flush itself failed with.
    pub fn synchronous_flush_outside_master_lock(&self, flush_all: bool) -> MotionResult<()> {
        if self.shared.master.is_held_by_current_thread() {
            return Err(MotionError::LockOrder);
        }
        self.check_fatal()?;
        let (reply, result) = channel::bounded(1);
        {
            let worker = self.worker.lock();
            let worker = worker
                .as_ref()
                .ok_or_else(|| WorkerError::Stopped("motion-flush".to_string()))?;
            worker.submit(FlushJob::Sync {
                all: flush_all,
                reply,
            })?;
        }
        result
            .recv()
            .map_err(|_| MotionError::WorkerStopped(WorkerError::Stopped("motion-flush".to_string())))?
    }

    // ── Inspection ──

    /// Samples waiting on `axis`.
    pub fn pending_points(&self, axis: Axis) -> usize {
        self.shared.pending.lock().axes[axis.index()].len()
    }

    /// Last point emitted on `axis` by a committed flush.
    pub fn emitted_cursor(&self, axis: Axis) -> Option<SamplePoint> {
        self.shared.pending.lock().axes[axis.index()].emitted
    }

    /// Committed MCU timestamp cursor of `axis`.
    pub fn axis_timestamp(&self, axis: Axis) -> Option<McuTimestamp> {
        self.shared.pending.lock().axes[axis.index()].timestamp
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal_error()
    }

    /// Stop the flush worker after it drains queued jobs.
    pub fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.shutdown();
            info!("movement queue stopped");
        }
    }
}

impl Drop for MovementQueue {
    fn drop(&mut self) {
        if self.shared.pending.lock().any_pending() {
            warn!("movement queue dropped with unflushed samples");
        }
        self.shutdown();
    }
}

fn sample_time(time: f64) -> MotionResult<f64> {
    if !(time.is_finite() && time >= 0.0) {
        return Err(MotionError::invalid(format!(
            "sample time {time} must be finite and non-negative"
        )));
    }
    // -0.0 would read as a reset marker.
    Ok(time.abs())
}

fn finite(name: &str, value: f64) -> MotionResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(MotionError::invalid(format!("{name} must be finite, got {value}")))
    }
}
