//! Simulated MCU backend.
//!
//! Keeps a schedule of sent commands ordered by `(min_clock, req_clock)` and
//! executes them once its clock passes `req_clock`. The clock runs at a fixed
//! frequency from host time, so the published regression is exact.
//! Used as the device-side backend when no hardware is attached and as the
//! in-process test double.

use parking_lot::{Mutex, RwLock};
use sinter_common::cancel::CancelToken;
use sinter_common::catalog::{CommandCatalog, CommandId, ids};
use sinter_common::clock::{ClockModel, ClockState, host_time};
use sinter_common::consts::{CLOCK_SYNC_INTERVAL_MS_DEFAULT, MAX_ARG_BUFFER_LEN, OUTSTANDING_WARN_DEFAULT};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::command::CommandArg;
use crate::error::{LinkError, LinkResult, McuException};
use crate::link::{EventCallback, HandlerHandle, LinkEvent, McuLink, ResponseCallback};
use crate::pool::{CommandPool, PooledCommand};

/// Nominal oscillator frequency of the simulated MCU [Hz].
pub const SIM_MCU_FREQ: f64 = 16_000_000.0;

/// Executed-command log entries kept for inspection.
const EXECUTED_LOG_CAP: usize = 65_536;

/// Simulation tuning.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Oscillator frequency [Hz].
    pub freq: f64,
    /// Background clock-sync period; `None` disables the sync thread.
    pub clock_sync_interval: Option<Duration>,
    /// Fault the MCU when a timing-critical command arrives after its clock.
    pub strict_timing: bool,
    /// Leak warning threshold for the command pool.
    pub warn_threshold: usize,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            freq: SIM_MCU_FREQ,
            clock_sync_interval: Some(Duration::from_millis(u64::from(
                CLOCK_SYNC_INTERVAL_MS_DEFAULT,
            ))),
            strict_timing: false,
            warn_threshold: OUTSTANDING_WARN_DEFAULT,
        }
    }
}

/// Record of one executed command.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedCommand {
    pub id: CommandId,
    pub args: Vec<CommandArg>,
    pub min_clock: u64,
    pub req_clock: u64,
    /// Simulated clock when it ran.
    pub executed_at: u64,
}

impl ExecutedCommand {
    pub fn scalar(&self, slot: usize) -> Option<i64> {
        match self.args.get(slot) {
            Some(CommandArg::Scalar(v)) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Default)]
struct SimState {
    pending: BTreeMap<(u64, u64, u64), PooledCommand>,
    seq: u64,
    executed: VecDeque<ExecutedCommand>,
    printing: bool,
    current_error: Option<McuException>,
    lost: bool,
}

struct SimInner {
    pool: CommandPool,
    clock: Arc<ClockModel>,
    freq: f64,
    epoch: f64,
    strict_timing: bool,
    identify: Vec<u8>,
    state: Mutex<SimState>,
    subscribers: RwLock<Vec<EventCallback>>,
    handlers: RwLock<HashMap<u64, (CommandId, ResponseCallback)>>,
    next_handle: AtomicU64,
}

impl SimInner {
    fn clock_now(&self) -> u64 {
        ((host_time() - self.epoch).max(0.0) * self.freq) as u64
    }

    fn emit(&self, event: LinkEvent) {
        let subscribers = self.subscribers.read().clone();
        for callback in subscribers {
            callback(&event);
        }
    }

    fn publish_clock_sync(&self) {
        let now = host_time();
        let clock = (now - self.epoch).max(0.0) * self.freq;
        let state = ClockState::ready(self.freq, now, clock, self.freq);
        if let Err(e) = self.clock.update(state) {
            warn!(error = %e, "clock sync not published");
            return;
        }
        self.emit(LinkEvent::ClockSync(state));
    }

    fn check_reachable(&self) -> LinkResult<()> {
        if self.state.lock().lost {
            Err(LinkError::Unreachable("lost communication with MCU".to_string()))
        } else {
            Ok(())
        }
    }

    /// Run every pending command whose `req_clock` has passed.
    fn advance(&self) {
        self.advance_to(self.clock_now());
    }

    fn advance_to(&self, now: u64) {
        let mut clock_requests = 0usize;
        {
            let mut state = self.state.lock();
            let due: Vec<_> = state
                .pending
                .iter()
                .filter(|(key, _)| key.1 <= now)
                .map(|(key, _)| *key)
                .collect();
            for key in due {
                if let Some(cmd) = state.pending.remove(&key) {
                    if cmd.id == ids::GET_CLOCK {
                        clock_requests += 1;
                    }
                    if state.executed.len() == EXECUTED_LOG_CAP {
                        state.executed.pop_front();
                    }
                    state.executed.push_back(ExecutedCommand {
                        id: cmd.id,
                        args: cmd.args().to_vec(),
                        min_clock: key.0,
                        req_clock: key.1,
                        executed_at: now,
                    });
                }
            }
        }
        for _ in 0..clock_requests {
            self.dispatch_response(ids::CLOCK, &[now as i64]);
        }
    }

    fn dispatch_response(&self, id: CommandId, values: &[i64]) {
        let targets: Vec<ResponseCallback> = self
            .handlers
            .read()
            .values()
            .filter(|(response, _)| *response == id)
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        if targets.is_empty() {
            return;
        }
        match self.pool.command(id, values) {
            Ok(mut response) => {
                response.sent_at = host_time();
                for callback in targets {
                    callback(&response);
                }
            }
            Err(e) => warn!(error = %e, "failed to build response command"),
        }
    }

    fn respond(&self, command: &PooledCommand, response: CommandId) -> Option<LinkResult<PooledCommand>> {
        let build = || -> LinkResult<PooledCommand> {
            match (command.id, response) {
                (ids::GET_CLOCK, ids::CLOCK) => self.pool.command(ids::CLOCK, &[self.clock_now() as i64]),
                (ids::IDENTIFY, ids::IDENTIFY_RESPONSE) => {
                    let offset = command.scalar(0).unwrap_or(0).max(0) as usize;
                    let count = (command.scalar(1).unwrap_or(0).max(0) as usize).min(MAX_ARG_BUFFER_LEN);
                    let start = offset.min(self.identify.len());
                    let end = (start + count).min(self.identify.len());
                    let mut reply = self.pool.command(ids::IDENTIFY_RESPONSE, &[offset as i64])?;
                    reply.set_buffer(1, self.pool.buffer(&self.identify[start..end])?)?;
                    Ok(reply)
                }
                _ => Err(LinkError::Timeout),
            }
        };
        match (command.id, response) {
            (ids::GET_CLOCK, ids::CLOCK) | (ids::IDENTIFY, ids::IDENTIFY_RESPONSE) => Some(build()),
            _ => None,
        }
    }
}

/// In-process simulated MCU.
pub struct SimulatedMcu {
    inner: Arc<SimInner>,
    stop: CancelToken,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedMcu {
    pub fn new(catalog: Arc<CommandCatalog>, options: SimulationOptions) -> LinkResult<Self> {
        if !(options.freq.is_finite() && options.freq > 0.0) {
            return Err(LinkError::InvalidOperation(format!(
                "simulated MCU frequency {} must be positive",
                options.freq
            )));
        }
        let identify = serde_json::to_vec(&serde_json::json!({
            "mcu": "sinter-sim",
            "freq": options.freq,
            "commands": catalog
                .iter()
                .map(|p| (p.name.clone(), p.id.0))
                .collect::<BTreeMap<_, _>>(),
        }))
        .map_err(|e| LinkError::Protocol(format!("identify encoding failed: {e}")))?;

        let inner = Arc::new(SimInner {
            pool: CommandPool::with_warn_threshold(catalog, options.warn_threshold),
            clock: Arc::new(ClockModel::new()),
            freq: options.freq,
            epoch: host_time(),
            strict_timing: options.strict_timing,
            identify,
            state: Mutex::new(SimState::default()),
            subscribers: RwLock::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        });
        inner.publish_clock_sync();

        let stop = CancelToken::new();
        let sync_thread = match options.clock_sync_interval {
            Some(interval) => {
                let inner = Arc::clone(&inner);
                let stop = stop.clone();
                let handle = std::thread::Builder::new()
                    .name("sim-clock-sync".to_string())
                    .spawn(move || {
                        while stop.sleep(interval) {
                            if inner.state.lock().lost {
                                inner.emit(LinkEvent::ClockSyncUnreachable);
                                continue;
                            }
                            inner.advance();
                            inner.publish_clock_sync();
                        }
                    })?;
                Some(handle)
            }
            None => None,
        };
        info!(freq = options.freq, "simulated MCU started");
        Ok(Self {
            inner,
            stop,
            sync_thread: Mutex::new(sync_thread),
        })
    }

    /// Simulation with default options and the builtin catalog.
    pub fn with_defaults() -> LinkResult<Self> {
        Self::new(Arc::new(CommandCatalog::builtin()), SimulationOptions::default())
    }

    /// Current simulated clock [ticks].
    pub fn clock_now(&self) -> u64 {
        self.inner.clock_now()
    }

    /// Execute everything due at the current clock.
    pub fn advance(&self) {
        self.inner.advance();
    }

    /// Execute everything due at `clock`, even if the simulated clock is not there yet.
    pub fn advance_to(&self, clock: u64) {
        self.inner.advance_to(clock.max(self.inner.clock_now()));
    }

    /// Execute every pending command regardless of its clock.
    pub fn drain(&self) {
        self.inner.advance_to(u64::MAX);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Remove and return the executed-command log.
    pub fn take_executed(&self) -> Vec<ExecutedCommand> {
        self.inner.state.lock().executed.drain(..).collect()
    }

    pub fn is_printing(&self) -> bool {
        self.inner.state.lock().printing
    }

    /// Publish a clock-sync snapshot now.
    pub fn publish_clock_sync(&self) {
        self.inner.publish_clock_sync();
    }

    // ─── Fault injection ────────────────────────────────────────────

    /// Latch `exc` as the current error and raise it as an event.
    pub fn inject_exception(&self, exc: McuException) {
        warn!(exception = %exc, "injecting MCU exception");
        self.inner.state.lock().current_error = Some(exc.clone());
        self.inner.emit(LinkEvent::Exception(exc));
    }

    /// Stop answering; every call fails as unreachable until [`Self::recover`].
    pub fn inject_lost_communication(&self) {
        warn!("injecting lost communication");
        self.inner.state.lock().lost = true;
        self.inner.emit(LinkEvent::LostCommunication);
    }

    /// Raise a clock-sync failure event.
    pub fn inject_clock_sync_exception(&self, exc: McuException) {
        self.inner.emit(LinkEvent::ClockSyncException(exc));
    }

    /// Clear injected faults.
    pub fn recover(&self) {
        let mut state = self.inner.state.lock();
        state.lost = false;
        state.current_error = None;
    }

    /// Stop the clock-sync thread.
    pub fn shutdown(&self) {
        self.stop.cancel();
        if let Some(handle) = self.sync_thread.lock().take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("clock-sync thread panicked");
            }
        }
    }
}

impl Drop for SimulatedMcu {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl McuLink for SimulatedMcu {
    fn pool(&self) -> &CommandPool {
        &self.inner.pool
    }

    fn clock(&self) -> &Arc<ClockModel> {
        &self.inner.clock
    }

    fn send(
        &self,
        mut command: PooledCommand,
        min_clock: u64,
        req_clock: u64,
        _cancel: &CancelToken,
    ) -> LinkResult<()> {
        self.inner.check_reachable()?;
        let now = self.inner.clock_now();
        if let Some(exc) = self.inner.state.lock().current_error.clone() {
            return Err(LinkError::Mcu(exc));
        }
        if self.inner.strict_timing && command.is_timing_critical() && req_clock < now {
            let exc = McuException::generic(format!(
                "timer too close: command {} for clock {req_clock} arrived at {now}",
                command.id
            ));
            self.inject_exception(exc.clone());
            return Err(LinkError::Mcu(exc));
        }
        command.received_at = host_time();
        {
            let mut state = self.inner.state.lock();
            let seq = state.seq;
            state.seq += 1;
            state.pending.insert((min_clock, req_clock, seq), command);
        }
        self.inner.advance_to(now);
        Ok(())
    }

    fn send_wait(
        &self,
        command: PooledCommand,
        response: CommandId,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> LinkResult<PooledCommand> {
        self.inner.check_reachable()?;
        match self.inner.respond(&command, response) {
            Some(result) => result,
            None => {
                debug!(command = %command.id, response = %response, "no responder, waiting for timeout");
                drop(command);
                if cancel.sleep(timeout) {
                    Err(LinkError::Timeout)
                } else {
                    Err(LinkError::Cancelled)
                }
            }
        }
    }

    fn try_replace(
        &self,
        original: PooledCommand,
        replacement: PooledCommand,
        _cancel: &CancelToken,
    ) -> LinkResult<bool> {
        self.inner.check_reachable()?;
        self.inner.advance();
        let mut state = self.inner.state.lock();
        let key = state
            .pending
            .iter()
            .find(|(_, cmd)| cmd.same_payload(&original))
            .map(|(key, _)| *key);
        match key {
            Some(key) => {
                state.pending.insert(key, replacement);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn send_cancel(&self, command: PooledCommand, _cancel: &CancelToken) -> LinkResult<()> {
        self.inner.check_reachable()?;
        self.inner
            .state
            .lock()
            .pending
            .retain(|_, pending| !pending.same_payload(&command));
        Ok(())
    }

    fn send_cancel_many(&self, commands: Vec<PooledCommand>, _cancel: &CancelToken) -> LinkResult<()> {
        self.inner.check_reachable()?;
        self.inner
            .state
            .lock()
            .pending
            .retain(|_, pending| !commands.iter().any(|c| pending.same_payload(c)));
        Ok(())
    }

    fn register_response_handler(
        &self,
        response: CommandId,
        callback: ResponseCallback,
        _cancel: &CancelToken,
    ) -> LinkResult<HandlerHandle> {
        self.inner.check_reachable()?;
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().insert(handle, (response, callback));
        Ok(HandlerHandle(handle))
    }

    fn unregister_response_handler(&self, handle: HandlerHandle, _cancel: &CancelToken) -> LinkResult<()> {
        self.inner.handlers.write().remove(&handle.0);
        Ok(())
    }

    fn current_error(&self, _cancel: &CancelToken) -> LinkResult<Option<McuException>> {
        Ok(self.inner.state.lock().current_error.clone())
    }

    fn has_timing_critical_commands_scheduled(&self, _cancel: &CancelToken) -> LinkResult<bool> {
        self.inner.check_reachable()?;
        self.inner.advance();
        Ok(self
            .inner
            .state
            .lock()
            .pending
            .values()
            .any(|cmd| cmd.is_timing_critical()))
    }

    fn collect_garbage(&self, _cancel: &CancelToken) -> LinkResult<usize> {
        Ok(self.inner.pool.collect_garbage())
    }

    fn enter_printing_mode(&self, _cancel: &CancelToken) -> LinkResult<()> {
        self.inner.check_reachable()?;
        let mut state = self.inner.state.lock();
        if state.printing {
            return Err(LinkError::InvalidOperation("already in printing mode".to_string()));
        }
        state.printing = true;
        Ok(())
    }

    fn exit_printing_mode(&self, _cancel: &CancelToken) -> LinkResult<()> {
        self.inner.check_reachable()?;
        let mut state = self.inner.state.lock();
        if !state.printing {
            return Err(LinkError::InvalidOperation("not in printing mode".to_string()));
        }
        state.printing = false;
        Ok(())
    }

    fn subscribe(&self, callback: EventCallback) {
        self.inner.subscribers.write().push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExceptionKind;
    use crate::command::Command;

    fn sim() -> SimulatedMcu {
        SimulatedMcu::new(
            Arc::new(CommandCatalog::builtin()),
            SimulationOptions {
                clock_sync_interval: None,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn clock_is_ready_after_start() {
        let sim = sim();
        assert!(sim.clock().is_ready());
        let now = sim.clock().clock_of(host_time()).unwrap();
        assert!((now - sim.clock_now() as f64).abs() < SIM_MCU_FREQ * 0.1);
    }

    #[test]
    fn commands_execute_in_clock_order() {
        let sim = sim();
        let cancel = CancelToken::none();
        let far = sim.clock_now() + 1_000_000_000;
        for (i, req) in [far + 30, far + 10, far + 20].into_iter().enumerate() {
            let cmd = sim.pool().command(ids::QUEUE_DWELL, &[0, req as i64, i as i64]).unwrap();
            sim.send(cmd, 0, req, &cancel).unwrap();
        }
        assert_eq!(sim.pending_count(), 3);
        assert!(sim.has_timing_critical_commands_scheduled(&cancel).unwrap());
        sim.drain();
        let order: Vec<_> = sim.take_executed().iter().map(|e| e.req_clock).collect();
        assert_eq!(order, vec![far + 10, far + 20, far + 30]);
        assert_eq!(sim.pool().outstanding(), 0);
    }

    #[test]
    fn past_commands_run_immediately() {
        let sim = sim();
        let cmd = sim.pool().command(ids::QUEUE_PWM, &[1, 0, 100]).unwrap();
        sim.send(cmd, 0, 0, &CancelToken::none()).unwrap();
        assert_eq!(sim.pending_count(), 0);
        assert_eq!(sim.take_executed().len(), 1);
    }

    #[test]
    fn strict_timing_faults_on_late_command() {
        let sim = SimulatedMcu::new(
            Arc::new(CommandCatalog::builtin()),
            SimulationOptions {
                clock_sync_interval: None,
                strict_timing: true,
                ..Default::default()
            },
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let cmd = sim.pool().command(ids::QUEUE_MOVE, &[0, 0, 10, 10]).unwrap();
        let err = sim.send(cmd, 0, 0, &CancelToken::none()).unwrap_err();
        assert!(matches!(err, LinkError::Mcu(_)));
        assert!(sim.current_error(&CancelToken::none()).unwrap().is_some());
    }

    #[test]
    fn send_wait_get_clock() {
        let sim = sim();
        let cmd = sim.pool().acquire(ids::GET_CLOCK).unwrap();
        let reply = sim
            .send_wait(cmd, ids::CLOCK, Duration::from_millis(100), &CancelToken::none())
            .unwrap();
        assert_eq!(reply.id, ids::CLOCK);
        assert!(reply.scalar(0).unwrap() >= 0);
    }

    #[test]
    fn send_wait_identify_returns_json_chunk() {
        let sim = sim();
        let cmd = sim.pool().command(ids::IDENTIFY, &[0, 40]).unwrap();
        let reply = sim
            .send_wait(cmd, ids::IDENTIFY_RESPONSE, Duration::from_millis(100), &CancelToken::none())
            .unwrap();
        let chunk = reply.buffer(1).unwrap();
        assert_eq!(chunk.len(), 40);
        assert!(chunk.starts_with(b"{"));
    }

    #[test]
    fn send_wait_without_responder_times_out() {
        let sim = sim();
        let cmd = sim.pool().command(ids::QUEUE_DWELL, &[0, 0, 0]).unwrap();
        let err = sim
            .send_wait(cmd, ids::CLOCK, Duration::from_millis(20), &CancelToken::none())
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout));
    }

    #[test]
    fn try_replace_and_cancel() {
        let sim = sim();
        let cancel = CancelToken::none();
        let far = sim.clock_now() + 1_000_000_000;
        let pool = sim.pool().clone();
        sim.send(pool.command(ids::QUEUE_DWELL, &[0, far as i64, 1]).unwrap(), 0, far, &cancel)
            .unwrap();
        sim.send(pool.command(ids::QUEUE_DWELL, &[0, far as i64, 2]).unwrap(), 0, far + 1, &cancel)
            .unwrap();

        let replaced = sim
            .try_replace(
                pool.command(ids::QUEUE_DWELL, &[0, far as i64, 1]).unwrap(),
                pool.command(ids::QUEUE_DWELL, &[0, far as i64, 9]).unwrap(),
                &cancel,
            )
            .unwrap();
        assert!(replaced);
        let missing = sim
            .try_replace(
                pool.command(ids::QUEUE_DWELL, &[0, 0, 77]).unwrap(),
                pool.command(ids::QUEUE_DWELL, &[0, 0, 78]).unwrap(),
                &cancel,
            )
            .unwrap();
        assert!(!missing);

        sim.send_cancel(pool.command(ids::QUEUE_DWELL, &[0, far as i64, 2]).unwrap(), &cancel)
            .unwrap();
        assert_eq!(sim.pending_count(), 1);
        sim.drain();
        let executed = sim.take_executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].scalar(2), Some(9));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn response_handler_receives_clock() {
        let sim = sim();
        let cancel = CancelToken::none();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = sim
            .register_response_handler(
                ids::CLOCK,
                Arc::new(move |cmd: &Command| sink.lock().push(cmd.scalar(0))),
                &cancel,
            )
            .unwrap();
        sim.send(sim.pool().acquire(ids::GET_CLOCK).unwrap(), 0, 0, &cancel).unwrap();
        assert_eq!(seen.lock().len(), 1);

        sim.unregister_response_handler(handle, &cancel).unwrap();
        sim.send(sim.pool().acquire(ids::GET_CLOCK).unwrap(), 0, 0, &cancel).unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn printing_mode_transitions() {
        let sim = sim();
        let cancel = CancelToken::none();
        sim.enter_printing_mode(&cancel).unwrap();
        assert!(sim.is_printing());
        assert!(matches!(
            sim.enter_printing_mode(&cancel),
            Err(LinkError::InvalidOperation(_))
        ));
        sim.exit_printing_mode(&cancel).unwrap();
        assert!(sim.exit_printing_mode(&cancel).is_err());
    }

    #[test]
    fn fault_injection_reaches_subscribers() {
        let sim = sim();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        sim.subscribe(Arc::new(move |ev: &LinkEvent| sink.lock().push(ev.clone())));

        sim.inject_exception(McuException::automated_restart(4, "brownout"));
        sim.inject_lost_communication();
        let err = sim
            .send(sim.pool().acquire(ids::GET_CLOCK).unwrap(), 0, 0, &CancelToken::none())
            .unwrap_err();
        assert!(matches!(err, LinkError::Unreachable(_)));

        let events = events.lock();
        assert!(matches!(
            &events[0],
            LinkEvent::Exception(exc) if exc.kind == ExceptionKind::AutomatedRestart { reason: 4 }
        ));
        assert_eq!(events[1], LinkEvent::LostCommunication);

        sim.recover();
        assert!(sim.current_error(&CancelToken::none()).unwrap().is_none());
    }

    #[test]
    fn clock_sync_thread_publishes() {
        let sim = SimulatedMcu::new(
            Arc::new(CommandCatalog::builtin()),
            SimulationOptions {
                clock_sync_interval: Some(Duration::from_millis(5)),
                ..Default::default()
            },
        )
        .unwrap();
        let syncs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&syncs);
        sim.subscribe(Arc::new(move |ev: &LinkEvent| {
            if matches!(ev, LinkEvent::ClockSync(_)) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }));
        std::thread::sleep(Duration::from_millis(60));
        sim.shutdown();
        assert!(syncs.load(Ordering::Relaxed) >= 2);
    }
}
