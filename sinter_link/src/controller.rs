//! Controller-side transport endpoint.
//!
//! Presents the [`McuLink`] call surface over a set of command channels to
//! a device-side endpoint. Each call borrows a free channel, writes its
//! request, reads the inline reply and returns the channel. Completions and
//! signals arrive on a single event stream, read by one thread and
//! correlated by the handle the device issued in its reply.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use sinter_common::cancel::CancelToken;
use sinter_common::catalog::CommandId;
use sinter_common::clock::{ClockModel, host_time};
use sinter_common::consts::CANCEL_POLL_MS;
use std::collections::HashMap;
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{LinkError, LinkResult, McuException};
use crate::link::{EventCallback, HandlerHandle, LinkEvent, McuLink, ResponseCallback};
use crate::pool::{CommandPool, PooledCommand};
use crate::protocol::{
    EventMessage, Frame, FrameReader, MessageType, Request, decode_reply_bool, decode_reply_count,
    decode_reply_empty, decode_reply_error, decode_reply_handle, write_frame,
};

/// Grace period on top of a `send_wait` timeout for the device to report it.
const SEND_WAIT_SLACK: Duration = Duration::from_secs(1);

fn poll_slice() -> Duration {
    Duration::from_millis(CANCEL_POLL_MS)
}

// ─── Channels ───────────────────────────────────────────────────────

struct Channel {
    reader: FrameReader<UnixStream>,
    writer: UnixStream,
    /// Replies owed to callers that gave up reading them.
    stale: usize,
    broken: bool,
}

impl Channel {
    fn open(stream: UnixStream) -> LinkResult<Self> {
        let mut writer = stream;
        write_frame(&mut writer, MessageType::AttachCommandStream, &[])?;
        writer.set_read_timeout(Some(poll_slice()))?;
        Ok(Self {
            reader: FrameReader::new(writer.try_clone()?),
            writer,
            stale: 0,
            broken: false,
        })
    }

    fn drain_stale(&mut self, cancel: &CancelToken) -> LinkResult<()> {
        while self.stale > 0 {
            let frame = self.reader.read_frame(cancel)?;
            debug!(kind = ?frame.kind, "drained stale reply");
            self.stale -= 1;
        }
        Ok(())
    }

    fn round_trip(&mut self, request: &[u8], cancel: &CancelToken) -> LinkResult<Frame> {
        self.drain_stale(cancel)?;
        self.writer.write_all(request)?;
        self.stale += 1;
        let frame = self.reader.read_frame(cancel)?;
        self.stale -= 1;
        Ok(frame)
    }
}

/// A borrowed channel; returned to the free list on drop.
struct Lease<'a> {
    free: &'a Sender<Channel>,
    channel: Option<Channel>,
}

impl Lease<'_> {
    fn channel(&mut self) -> LinkResult<&mut Channel> {
        self.channel
            .as_mut()
            .ok_or_else(|| LinkError::Unreachable("channel lease already returned".to_string()))
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = self.free.send(channel);
        }
    }
}

// ─── Event correlation ──────────────────────────────────────────────

enum WaitSlot {
    Waiting(Sender<LinkResult<PooledCommand>>),
    /// Completion arrived before the caller registered.
    Done(LinkResult<PooledCommand>),
    /// The caller gave up; drop the completion when it shows up.
    Abandoned,
}

/// Responses parked per handle before its registration reply is read.
const EARLY_RESPONSE_LIMIT: usize = 64;

enum HandlerSlot {
    Active(ResponseCallback),
    /// Responses that beat the registration reply.
    Early(Vec<PooledCommand>),
}

struct ControllerInner {
    pool: CommandPool,
    clock: Arc<ClockModel>,
    free_tx: Sender<Channel>,
    free_rx: Receiver<Channel>,
    waits: Mutex<HashMap<u64, WaitSlot>>,
    handlers: Mutex<HashMap<u64, HandlerSlot>>,
    subscribers: RwLock<Vec<EventCallback>>,
    last_exception: Mutex<Option<McuException>>,
    lost: AtomicBool,
    stop: CancelToken,
}

impl ControllerInner {
    fn emit(&self, event: LinkEvent) {
        let subscribers = self.subscribers.read().clone();
        for callback in subscribers {
            callback(&event);
        }
    }

    /// Transport failures become `Unreachable`, or the cached MCU exception if one was seen.
    fn reclassify(&self, err: LinkError) -> LinkError {
        if !err.is_transport() {
            return err;
        }
        match self.last_exception.lock().clone() {
            Some(exc) => LinkError::Mcu(exc),
            None => LinkError::Unreachable(err.to_string()),
        }
    }

    fn lease(&self, cancel: &CancelToken) -> LinkResult<Lease<'_>> {
        loop {
            match self.free_rx.recv_timeout(poll_slice()) {
                Ok(channel) => {
                    return Ok(Lease {
                        free: &self.free_tx,
                        channel: Some(channel),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        return Err(LinkError::Cancelled);
                    }
                    if self.stop.is_cancelled() {
                        return Err(LinkError::Unreachable("endpoint shut down".to_string()));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(LinkError::Unreachable("no command channels".to_string()));
                }
            }
        }
    }

    /// Borrow a channel, send `request` and read its reply.
    fn call(&self, request: Request, cancel: &CancelToken) -> LinkResult<Frame> {
        let encoded = request.encode()?;
        drop(request);
        let mut lease = self.lease(cancel)?;
        let channel = lease.channel()?;
        if channel.broken {
            return Err(self.reclassify(LinkError::Closed));
        }
        match channel.round_trip(&encoded, cancel) {
            Ok(frame) => Ok(frame),
            Err(LinkError::Cancelled) => Err(LinkError::Cancelled),
            Err(e) => {
                channel.broken = true;
                if e.is_protocol() {
                    error!(error = %e, "protocol error on command channel");
                }
                Err(self.reclassify(e))
            }
        }
    }

    fn handle_event(&self, event: EventMessage) {
        match event {
            EventMessage::SendWait { handle, result } => {
                let result = result.map_err(LinkError::from);
                let mut waits = self.waits.lock();
                match waits.remove(&handle) {
                    Some(WaitSlot::Waiting(tx)) => {
                        let _ = tx.try_send(result);
                    }
                    Some(WaitSlot::Abandoned) => debug!(handle, "late send_wait completion dropped"),
                    Some(WaitSlot::Done(_)) | None => {
                        waits.insert(handle, WaitSlot::Done(result));
                    }
                }
            }
            EventMessage::ResponseHandler { handle, command } => {
                let callback = {
                    let mut handlers = self.handlers.lock();
                    match handlers.entry(handle).or_insert_with(|| HandlerSlot::Early(Vec::new())) {
                        HandlerSlot::Active(callback) => Some(Arc::clone(callback)),
                        HandlerSlot::Early(parked) => {
                            if parked.len() < EARLY_RESPONSE_LIMIT {
                                parked.push(command);
                            } else {
                                debug!(handle, "response for unknown handler dropped");
                            }
                            return;
                        }
                    }
                };
                if let Some(callback) = callback {
                    callback(&command);
                }
            }
            other => {
                match &other {
                    EventMessage::ClockSync(state) => {
                        if let Err(e) = self.clock.update(*state) {
                            warn!(error = %e, freq = state.freq, "clock sync ignored");
                        }
                    }
                    EventMessage::Exception(exc) => {
                        warn!(exception = %exc, "MCU exception");
                        *self.last_exception.lock() = Some(exc.clone());
                    }
                    EventMessage::LostCommunication => warn!("device reports lost communication"),
                    _ => {}
                }
                if let Some(event) = other.into_link_event() {
                    self.emit(event);
                }
            }
        }
    }

    fn mark_lost(&self) {
        if self.lost.swap(true, Ordering::Relaxed) {
            return;
        }
        // Dropping the senders wakes every waiter with a disconnect.
        self.waits.lock().clear();
        self.emit(LinkEvent::LostCommunication);
    }
}

fn event_loop(inner: &ControllerInner, mut reader: FrameReader<UnixStream>) {
    loop {
        let frame = match reader.read_frame(&inner.stop) {
            Ok(frame) => frame,
            Err(LinkError::Cancelled) => break,
            Err(_) if inner.stop.is_cancelled() => break,
            Err(e) => {
                warn!(error = %e, "event stream lost");
                inner.mark_lost();
                break;
            }
        };
        match EventMessage::decode(&frame, &inner.pool) {
            Ok(event) => inner.handle_event(event),
            Err(e) => {
                error!(error = %e, "protocol error on event stream, aborting");
                inner.mark_lost();
                break;
            }
        }
    }
}

// ─── Endpoint ───────────────────────────────────────────────────────

/// Controller-side endpoint.
pub struct ControllerEndpoint {
    inner: Arc<ControllerInner>,
    event_stream: UnixStream,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    channels: usize,
}

impl ControllerEndpoint {
    /// Open `channels` command connections plus the event connection to `path`.
    pub fn connect(path: impl AsRef<Path>, channels: usize, pool: CommandPool) -> LinkResult<Self> {
        let path = path.as_ref();
        let connect = || {
            UnixStream::connect(path)
                .map_err(|e| LinkError::Unreachable(format!("connect {}: {e}", path.display())))
        };
        let commands = (0..channels).map(|_| connect()).collect::<LinkResult<Vec<_>>>()?;
        let events = connect()?;
        Self::from_streams(commands, events, pool)
    }

    /// Build an endpoint over already connected streams.
    pub fn from_streams(
        commands: Vec<UnixStream>,
        events: UnixStream,
        pool: CommandPool,
    ) -> LinkResult<Self> {
        if commands.is_empty() {
            return Err(LinkError::InvalidOperation(
                "at least one command channel is required".to_string(),
            ));
        }
        let channels = commands.len();
        let (free_tx, free_rx) = channel::bounded(channels);
        for stream in commands {
            let _ = free_tx.send(Channel::open(stream)?);
        }

        let mut event_stream = events;
        write_frame(&mut event_stream, MessageType::AttachEventStream, &[])?;
        event_stream.set_read_timeout(Some(poll_slice()))?;
        let reader = FrameReader::new(event_stream.try_clone()?);

        let inner = Arc::new(ControllerInner {
            pool,
            clock: Arc::new(ClockModel::new()),
            free_tx,
            free_rx,
            waits: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            last_exception: Mutex::new(None),
            lost: AtomicBool::new(false),
            stop: CancelToken::new(),
        });
        let thread_inner = Arc::clone(&inner);
        let event_thread = std::thread::Builder::new()
            .name("link-events".to_string())
            .spawn(move || event_loop(&thread_inner, reader))?;

        info!(channels, "controller endpoint connected");
        Ok(Self {
            inner,
            event_stream,
            event_thread: Mutex::new(Some(event_thread)),
            channels,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Last exception event received, if any.
    pub fn last_exception(&self) -> Option<McuException> {
        self.inner.last_exception.lock().clone()
    }

    /// Whether the event stream has been lost.
    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::Relaxed)
    }

    /// Block until the first clock-sync snapshot arrives.
    pub fn wait_for_clock(&self, timeout: Duration, cancel: &CancelToken) -> LinkResult<()> {
        let deadline = Instant::now() + timeout;
        while !self.inner.clock.is_ready() {
            if self.is_lost() {
                return Err(self.inner.reclassify(LinkError::Closed));
            }
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout);
            }
            if !cancel.sleep(poll_slice()) {
                return Err(LinkError::Cancelled);
            }
        }
        Ok(())
    }

    fn await_completion(
        &self,
        handle: u64,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> LinkResult<PooledCommand> {
        let rx = {
            let mut waits = self.inner.waits.lock();
            if let Some(WaitSlot::Done(result)) = waits.remove(&handle) {
                return result;
            }
            if self.is_lost() {
                return Err(self.inner.reclassify(LinkError::Closed));
            }
            let (tx, rx) = channel::bounded(1);
            waits.insert(handle, WaitSlot::Waiting(tx));
            rx
        };

        let deadline = Instant::now() + timeout + SEND_WAIT_SLACK;
        let outcome = loop {
            match rx.recv_timeout(poll_slice()) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.inner.reclassify(LinkError::Closed));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        break LinkError::Cancelled;
                    }
                    if Instant::now() >= deadline {
                        break LinkError::Timeout;
                    }
                }
            }
        };

        let mut waits = self.inner.waits.lock();
        if let Ok(result) = rx.try_recv() {
            return result;
        }
        waits.insert(handle, WaitSlot::Abandoned);
        Err(outcome)
    }

    /// Stop the event reader and close every channel.
    pub fn shutdown(&self) {
        if self.inner.stop.is_cancelled() {
            return;
        }
        self.inner.stop.cancel();
        let _ = self.event_stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.event_thread.lock().take() {
            if handle.join().is_err() {
                warn!("event thread panicked");
            }
        }
        while let Ok(channel) = self.inner.free_rx.try_recv() {
            let _ = channel.writer.shutdown(Shutdown::Both);
        }
        info!("controller endpoint stopped");
    }
}

impl Drop for ControllerEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl McuLink for ControllerEndpoint {
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
        cancel: &CancelToken,
    ) -> LinkResult<()> {
        command.sent_at = host_time();
        let frame = self.inner.call(
            Request::SendCommand {
                min_clock,
                req_clock,
                command,
            },
            cancel,
        )?;
        decode_reply_empty(frame)
    }

    fn send_wait(
        &self,
        mut command: PooledCommand,
        response: CommandId,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> LinkResult<PooledCommand> {
        command.sent_at = host_time();
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let frame = self.inner.call(
            Request::SendWait {
                response,
                timeout_ms,
                command,
            },
            cancel,
        )?;
        let handle = decode_reply_handle(frame)?;
        self.await_completion(handle, timeout, cancel)
    }

    fn try_replace(
        &self,
        original: PooledCommand,
        replacement: PooledCommand,
        cancel: &CancelToken,
    ) -> LinkResult<bool> {
        let frame = self.inner.call(
            Request::TryReplace {
                original,
                replacement,
            },
            cancel,
        )?;
        decode_reply_bool(frame)
    }

    fn send_cancel(&self, command: PooledCommand, cancel: &CancelToken) -> LinkResult<()> {
        let frame = self.inner.call(Request::SendCancel { command }, cancel)?;
        decode_reply_empty(frame)
    }

    fn send_cancel_many(&self, commands: Vec<PooledCommand>, cancel: &CancelToken) -> LinkResult<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let frame = self.inner.call(Request::SendCancelMany { commands }, cancel)?;
        decode_reply_empty(frame)
    }

    fn register_response_handler(
        &self,
        response: CommandId,
        callback: ResponseCallback,
        cancel: &CancelToken,
    ) -> LinkResult<HandlerHandle> {
        let frame = self
            .inner
            .call(Request::RegisterResponseHandler { response }, cancel)?;
        let handle = decode_reply_handle(frame)?;
        // Replay parked responses in arrival order before going live.
        loop {
            let parked = {
                let mut handlers = self.inner.handlers.lock();
                match handlers.remove(&handle) {
                    Some(HandlerSlot::Early(parked)) if !parked.is_empty() => {
                        handlers.insert(handle, HandlerSlot::Early(Vec::new()));
                        parked
                    }
                    _ => {
                        handlers.insert(handle, HandlerSlot::Active(Arc::clone(&callback)));
                        break;
                    }
                }
            };
            debug!(handle, count = parked.len(), "replaying early responses");
            for command in &parked {
                callback(command);
            }
        }
        Ok(HandlerHandle(handle))
    }

    fn unregister_response_handler(&self, handle: HandlerHandle, cancel: &CancelToken) -> LinkResult<()> {
        self.inner.handlers.lock().remove(&handle.0);
        let frame = self
            .inner
            .call(Request::UnregisterResponseHandler { handle: handle.0 }, cancel)?;
        // Drop anything parked by responses that raced the removal.
        self.inner.handlers.lock().remove(&handle.0);
        decode_reply_empty(frame)
    }

    fn current_error(&self, cancel: &CancelToken) -> LinkResult<Option<McuException>> {
        let frame = self.inner.call(Request::GetCurrentError, cancel)?;
        decode_reply_error(frame)
    }

    fn has_timing_critical_commands_scheduled(&self, cancel: &CancelToken) -> LinkResult<bool> {
        let frame = self
            .inner
            .call(Request::HasTimingCriticalCommandsScheduled, cancel)?;
        decode_reply_bool(frame)
    }

    fn collect_garbage(&self, cancel: &CancelToken) -> LinkResult<usize> {
        let frame = self.inner.call(Request::CollectGarbage, cancel)?;
        let remote = decode_reply_count(frame)? as usize;
        Ok(remote + self.inner.pool.collect_garbage())
    }

    fn enter_printing_mode(&self, cancel: &CancelToken) -> LinkResult<()> {
        let frame = self.inner.call(Request::EnterPrintingMode, cancel)?;
        decode_reply_empty(frame)
    }

    fn exit_printing_mode(&self, cancel: &CancelToken) -> LinkResult<()> {
        let frame = self.inner.call(Request::ExitPrintingMode, cancel)?;
        decode_reply_empty(frame)
    }

    fn subscribe(&self, callback: EventCallback) {
        self.inner.subscribers.write().push(callback);
    }
}
