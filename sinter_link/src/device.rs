//! Device-side transport endpoint.
//!
//! Serves an [`McuLink`] backend to a controller process. Each accepted
//! connection starts with a handshake frame naming its role: any number of
//! command streams, each with its own read thread, and one event stream
//! shared by every asynchronous signal. `SendWait` completions run on a
//! small completion pool so a command stream never blocks on a round trip.

use parking_lot::Mutex;
use sinter_common::cancel::CancelToken;
use sinter_common::consts::CANCEL_POLL_MS;
use sinter_common::worker::FixedPool;
use std::collections::HashMap;
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::error::{LinkError, LinkResult};
use crate::link::{HandlerHandle, LinkEvent, McuLink};
use crate::protocol::{
    EventMessage, Frame, FrameReader, MessageType, Reply, Request, encode_response_event,
};

/// Time a fresh connection gets to send its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Workers completing `SendWait` requests.
const COMPLETION_WORKERS: usize = 4;

struct DeviceInner {
    backend: Arc<dyn McuLink>,
    events: Mutex<Option<UnixStream>>,
    next_handle: AtomicU64,
    handlers: Mutex<HashMap<u64, HandlerHandle>>,
    running: CancelToken,
}

impl DeviceInner {
    fn write_frame(&self, frame: &[u8]) {
        let mut events = self.events.lock();
        let Some(stream) = events.as_mut() else {
            debug!("no event stream attached, event dropped");
            return;
        };
        if let Err(e) = stream.write_all(frame) {
            warn!(error = %e, "event stream write failed, detaching");
            *events = None;
        }
    }

    fn write_event(&self, event: &EventMessage) {
        match event.encode() {
            Ok(frame) => self.write_frame(&frame),
            Err(e) => error!(error = %e, "failed to encode event"),
        }
    }

    fn write_response(&self, handle: u64, command: &Command) {
        match encode_response_event(handle, command) {
            Ok(frame) => self.write_frame(&frame),
            Err(e) => error!(error = %e, handle, "failed to encode response event"),
        }
    }

    fn issue_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch(self: &Arc<Self>, request: Request, completions: &FixedPool) -> LinkResult<Reply> {
        let cancel = &self.running;
        match request {
            Request::SendCommand {
                min_clock,
                req_clock,
                command,
            } => {
                self.backend.send(command, min_clock, req_clock, cancel)?;
                Ok(Reply::Empty)
            }
            Request::SendWait {
                response,
                timeout_ms,
                command,
            } => {
                let handle = self.issue_handle();
                let inner = Arc::clone(self);
                completions
                    .execute(move || {
                        let result = inner
                            .backend
                            .send_wait(
                                command,
                                response,
                                Duration::from_millis(u64::from(timeout_ms)),
                                &inner.running,
                            )
                            .map_err(|e| e.to_exception());
                        inner.write_event(&EventMessage::SendWait { handle, result });
                    })
                    .map_err(|e| LinkError::InvalidOperation(e.to_string()))?;
                Ok(Reply::Handle(handle))
            }
            Request::TryReplace {
                original,
                replacement,
            } => Ok(Reply::Bool(
                self.backend.try_replace(original, replacement, cancel)?,
            )),
            Request::SendCancel { command } => {
                self.backend.send_cancel(command, cancel)?;
                Ok(Reply::Empty)
            }
            Request::SendCancelMany { commands } => {
                self.backend.send_cancel_many(commands, cancel)?;
                Ok(Reply::Empty)
            }
            Request::RegisterResponseHandler { response } => {
                let handle = self.issue_handle();
                let weak: Weak<Self> = Arc::downgrade(self);
                let backend_handle = self.backend.register_response_handler(
                    response,
                    Arc::new(move |command: &Command| {
                        if let Some(inner) = weak.upgrade() {
                            inner.write_response(handle, command);
                        }
                    }),
                    cancel,
                )?;
                self.handlers.lock().insert(handle, backend_handle);
                Ok(Reply::Handle(handle))
            }
            Request::UnregisterResponseHandler { handle } => {
                let backend_handle = self.handlers.lock().remove(&handle).ok_or_else(|| {
                    LinkError::InvalidOperation(format!("unknown response handler {handle}"))
                })?;
                self.backend
                    .unregister_response_handler(backend_handle, cancel)?;
                Ok(Reply::Empty)
            }
            Request::GetCurrentError => Ok(Reply::Error(self.backend.current_error(cancel)?)),
            Request::HasTimingCriticalCommandsScheduled => Ok(Reply::Bool(
                self.backend.has_timing_critical_commands_scheduled(cancel)?,
            )),
            Request::CollectGarbage => {
                let freed = self.backend.collect_garbage(cancel)?;
                Ok(Reply::Count(u32::try_from(freed).unwrap_or(u32::MAX)))
            }
            Request::EnterPrintingMode => {
                self.backend.enter_printing_mode(cancel)?;
                Ok(Reply::Empty)
            }
            Request::ExitPrintingMode => {
                self.backend.exit_printing_mode(cancel)?;
                Ok(Reply::Empty)
            }
        }
    }
}

/// Device-side endpoint.
pub struct DeviceEndpoint {
    inner: Arc<DeviceInner>,
    completions: Arc<FixedPool>,
    streams: Mutex<Vec<JoinHandle<()>>>,
    stream_seq: AtomicUsize,
}

impl DeviceEndpoint {
    pub fn new(backend: Arc<dyn McuLink>) -> LinkResult<Self> {
        let completions = FixedPool::new("link-complete", COMPLETION_WORKERS)
            .map_err(|e| LinkError::InvalidOperation(e.to_string()))?;
        let inner = Arc::new(DeviceInner {
            backend,
            events: Mutex::new(None),
            next_handle: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
            running: CancelToken::new(),
        });

        let weak = Arc::downgrade(&inner);
        inner.backend.subscribe(Arc::new(move |event: &LinkEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.write_event(&EventMessage::from(event));
            }
        }));

        Ok(Self {
            inner,
            completions: Arc::new(completions),
            streams: Mutex::new(Vec::new()),
            stream_seq: AtomicUsize::new(0),
        })
    }

    pub fn backend(&self) -> &Arc<dyn McuLink> {
        &self.inner.backend
    }

    /// Number of command streams served so far.
    pub fn command_streams(&self) -> usize {
        self.stream_seq.load(Ordering::Relaxed)
    }

    /// Read the handshake of a fresh connection and start serving it.
    pub fn serve_connection(&self, stream: UnixStream) -> LinkResult<()> {
        stream.set_read_timeout(Some(Duration::from_millis(CANCEL_POLL_MS)))?;
        let mut reader = FrameReader::new(stream.try_clone()?);
        let handshake = read_handshake(&mut reader, &self.inner.running)?;
        match handshake.kind {
            MessageType::AttachEventStream => {
                self.attach_event_stream(stream);
                Ok(())
            }
            MessageType::AttachCommandStream => self.attach_command_stream(reader, stream),
            other => Err(LinkError::Protocol(format!(
                "expected a stream handshake, got {other:?}"
            ))),
        }
    }

    fn attach_event_stream(&self, stream: UnixStream) {
        let replaced = self.inner.events.lock().replace(stream);
        if let Some(old) = replaced {
            warn!("event stream re-attached, closing the previous one");
            let _ = old.shutdown(Shutdown::Both);
        }
        info!("event stream attached");
        if self.inner.backend.clock().is_ready() {
            let state = *self.inner.backend.clock().snapshot();
            self.inner.write_event(&EventMessage::ClockSync(state));
        }
    }

    fn attach_command_stream(
        &self,
        reader: FrameReader<UnixStream>,
        writer: UnixStream,
    ) -> LinkResult<()> {
        let index = self.stream_seq.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let completions = Arc::clone(&self.completions);
        let handle = std::thread::Builder::new()
            .name(format!("link-cmd-{index}"))
            .spawn(move || command_loop(index, &inner, &completions, reader, writer))?;
        self.streams.lock().push(handle);
        info!(stream = index, "command stream attached");
        Ok(())
    }

    /// Stop every stream loop and detach the event stream.
    pub fn shutdown(&self) {
        if self.inner.running.is_cancelled() {
            return;
        }
        self.inner.running.cancel();
        let handles: Vec<_> = self.streams.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("command stream thread panicked");
            }
        }
        if let Some(stream) = self.inner.events.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        info!("device endpoint stopped");
    }
}

impl Drop for DeviceEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_handshake(
    reader: &mut FrameReader<UnixStream>,
    running: &CancelToken,
) -> LinkResult<Frame> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        if let Some(frame) = reader.poll_frame()? {
            return Ok(frame);
        }
        if running.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(LinkError::Protocol("handshake timed out".to_string()));
        }
    }
}

fn command_loop(
    index: usize,
    inner: &Arc<DeviceInner>,
    completions: &FixedPool,
    mut reader: FrameReader<UnixStream>,
    mut writer: UnixStream,
) {
    loop {
        let frame = match reader.read_frame(&inner.running) {
            Ok(frame) => frame,
            Err(LinkError::Cancelled) => break,
            Err(LinkError::Closed) => {
                debug!(stream = index, "command stream closed by peer");
                break;
            }
            Err(e) => {
                error!(stream = index, error = %e, "command stream read failed, aborting");
                break;
            }
        };
        let request = match Request::decode(&frame, inner.backend.pool()) {
            Ok(request) => request,
            Err(e) => {
                error!(stream = index, error = %e, "protocol error, aborting command stream");
                break;
            }
        };
        let kind = request.message_type();
        let encoded = match inner.dispatch(request, completions) {
            Ok(reply) => reply.encode(),
            Err(e) => {
                debug!(stream = index, request = ?kind, error = %e, "request failed");
                Reply::encode_exception(&e.to_exception())
            }
        };
        let written = encoded.and_then(|frame| writer.write_all(&frame).map_err(LinkError::from));
        if let Err(e) = written {
            warn!(stream = index, error = %e, "reply write failed, aborting command stream");
            break;
        }
    }
    let _ = writer.shutdown(Shutdown::Both);
}
