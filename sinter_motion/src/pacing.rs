//! Paced streaming of pre-built command scripts.
//!
//! A script is a list of commands already scheduled to MCU clocks. Sending
//! it all at once would queue minutes of work on the MCU; the streamer
//! instead waits whenever the queued print time exceeds `max_lead` until
//! only `target_lead` is left.

use sinter_common::cancel::CancelToken;
use sinter_common::clock::{ClockModel, host_time};
use sinter_link::{LinkError, McuLink, PooledCommand};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{MotionError, MotionResult};

/// Reports how much already-queued work the MCU has left [s].
pub trait RemainingPrintTime: Send + Sync {
    fn remaining_print_time(&self) -> f64;

    /// Called after each command is handed to the link.
    fn on_sent(&self, _req_clock: u64) {}
}

/// Oracle measuring the lead of the latest sent clock over the MCU's
/// current clock.
#[derive(Debug)]
pub struct ClockLeadOracle {
    clock: Arc<ClockModel>,
    last_clock: AtomicU64,
}

impl ClockLeadOracle {
    pub fn new(clock: Arc<ClockModel>) -> Self {
        Self {
            clock,
            last_clock: AtomicU64::new(0),
        }
    }
}

impl RemainingPrintTime for ClockLeadOracle {
    fn remaining_print_time(&self) -> f64 {
        let last = self.last_clock.load(Ordering::Acquire) as f64;
        let snapshot = self.clock.snapshot();
        match (snapshot.clock_of(host_time()), snapshot.duration_in_seconds(1.0)) {
            (Ok(now), Ok(tick)) => ((last - now) * tick).max(0.0),
            _ => 0.0,
        }
    }

    fn on_sent(&self, req_clock: u64) {
        self.last_clock.fetch_max(req_clock, Ordering::AcqRel);
    }
}

/// Command with its release window.
pub struct ScheduledCommand {
    pub command: PooledCommand,
    pub min_clock: u64,
    pub req_clock: u64,
}

/// Sends a script through an [`McuLink`] without running too far ahead.
pub struct ScriptStreamer {
    link: Arc<dyn McuLink>,
    oracle: Arc<dyn RemainingPrintTime>,
    max_lead: f64,
    target_lead: f64,
}

impl ScriptStreamer {
    /// # Arguments
    ///
    /// * `max_lead` - Queued print time that triggers a pause [s]
    /// * `target_lead` - Queued print time to resume at [s]
    ///
    /// # Errors
    ///
    /// `InvalidArgument` unless `0 <= target_lead <= max_lead`.
    pub fn new(
        link: Arc<dyn McuLink>,
        oracle: Arc<dyn RemainingPrintTime>,
        max_lead: f64,
        target_lead: f64,
    ) -> MotionResult<Self> {
        if !(target_lead >= 0.0 && target_lead <= max_lead && max_lead.is_finite()) {
            return Err(MotionError::invalid(format!(
                "leads must satisfy 0 <= target ({target_lead}) <= max ({max_lead})"
            )));
        }
        Ok(Self {
            link,
            oracle,
            max_lead,
            target_lead,
        })
    }

    /// Send every command of `script` in order.
    ///
    /// # Returns
    ///
    /// Number of commands sent.
    ///
    /// # Errors
    ///
    /// `Cancelled` once `cancel` fires; link failures as `Link`. Unsent
    /// commands go back to their pool either way.
    pub fn stream(&self, script: Vec<ScheduledCommand>, cancel: &CancelToken) -> MotionResult<usize> {
        let total = script.len();
        let mut sent = 0;
        for item in script {
            if cancel.is_cancelled() {
                return Err(MotionError::Cancelled);
            }
            let remaining = self.oracle.remaining_print_time();
            if remaining > self.max_lead {
                let wait = remaining - self.target_lead;
                debug!(remaining, wait, "script ahead of the MCU, pausing");
                if !cancel.sleep(Duration::from_secs_f64(wait)) {
                    return Err(MotionError::Cancelled);
                }
            }
            let req_clock = item.req_clock;
            self.link
                .send(item.command, item.min_clock, req_clock, cancel)
                .map_err(|e| match e {
                    LinkError::Cancelled => MotionError::Cancelled,
                    e => MotionError::Link(e),
                })?;
            self.oracle.on_sent(req_clock);
            sent += 1;
        }
        info!(sent, total, "script streamed");
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sinter_common::catalog::ids;
    use sinter_link::SimulatedMcu;
    use sinter_link::simulation::SimulationOptions;
    use sinter_common::catalog::CommandCatalog;

    /// Oracle replaying a fixed sequence of readings.
    struct Scripted(Mutex<Vec<f64>>);

    impl RemainingPrintTime for Scripted {
        fn remaining_print_time(&self) -> f64 {
            self.0.lock().pop().unwrap_or(0.0)
        }
    }

    fn sim() -> Arc<SimulatedMcu> {
        let options = SimulationOptions {
            clock_sync_interval: None,
            ..SimulationOptions::default()
        };
        Arc::new(SimulatedMcu::new(Arc::new(CommandCatalog::builtin()), options).unwrap())
    }

    fn script(sim: &SimulatedMcu, n: usize) -> Vec<ScheduledCommand> {
        (0..n)
            .map(|i| ScheduledCommand {
                command: sim
                    .pool()
                    .command(ids::QUEUE_PWM, &[2, i as i64 * 1000, 128])
                    .unwrap(),
                min_clock: 0,
                req_clock: u64::MAX / 2 + i as u64,
            })
            .collect()
    }

    #[test]
    fn streams_everything_when_not_ahead() {
        let sim = sim();
        let streamer = ScriptStreamer::new(
            sim.clone(),
            Arc::new(Scripted(Mutex::new(Vec::new()))),
            1.0,
            0.5,
        )
        .unwrap();
        let sent = streamer.stream(script(&sim, 5), &CancelToken::none()).unwrap();
        assert_eq!(sent, 5);
        assert_eq!(sim.pending_count(), 5);
    }

    #[test]
    fn pauses_when_ahead() {
        let sim = sim();
        // Popped from the back: the second command sees 1.05s queued.
        let oracle = Arc::new(Scripted(Mutex::new(vec![0.0, 1.05, 0.0])));
        let streamer = ScriptStreamer::new(sim.clone(), oracle, 1.0, 1.0).unwrap();
        let started = std::time::Instant::now();
        streamer.stream(script(&sim, 3), &CancelToken::none()).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn cancellation_returns_commands() {
        let sim = sim();
        let oracle = Arc::new(Scripted(Mutex::new(vec![30.0])));
        let streamer = ScriptStreamer::new(sim.clone(), oracle, 1.0, 0.0).unwrap();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });
        let err = streamer.stream(script(&sim, 4), &cancel).unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, MotionError::Cancelled));
        assert_eq!(sim.pending_count(), 0);
        assert_eq!(sim.pool().outstanding(), 0);
    }

    #[test]
    fn clock_lead_oracle_tracks_latest_clock() {
        let sim = sim();
        let oracle = ClockLeadOracle::new(Arc::clone(sim.clock()));
        assert_eq!(oracle.remaining_print_time(), 0.0);
        let ahead = sim.clock().clock_of(host_time() + 2.0).unwrap() as u64;
        oracle.on_sent(ahead);
        oracle.on_sent(10);
        let remaining = oracle.remaining_print_time();
        assert!(remaining > 1.5 && remaining <= 2.0, "remaining {remaining}");
    }

    #[test]
    fn invalid_leads_rejected() {
        let sim = sim();
        let oracle = Arc::new(ClockLeadOracle::new(Arc::clone(sim.clock())));
        assert!(ScriptStreamer::new(sim, oracle, 1.0, 2.0).is_err());
    }
}
