//! Wire codec.
//!
//! Every message is `[len: u32 LE][type: u8][payload]` where `len` counts the
//! type byte plus the payload, so any frame can be skipped from its length
//! alone. All integers are little endian.
//!
//! ```text
//! command    = [id u8][flags u8][sent_at f64][received_at f64] slot*
//! slot       = [1][len u8][bytes]  |  [0][i64]
//! exception  = [kind u8][len u32][utf8] ([reason u8] if kind == 2)
//! string     = [len u32][utf8]
//! clock      = [mcu_freq f64][sample_time f64][clock f64][freq f64][ready u8]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sinter_common::cancel::CancelToken;
use sinter_common::catalog::{CommandFlags, CommandId};
use sinter_common::clock::ClockState;
use sinter_common::consts::{MAX_ARG_BUFFER_LEN, MAX_FRAME_LEN};
use std::io::{ErrorKind, Read, Write};

use crate::command::{Command, CommandArg};
use crate::error::{ExceptionKind, LinkError, LinkResult, McuException};
use crate::link::LinkEvent;
use crate::pool::{CommandPool, PooledCommand};

/// Length prefix plus type byte.
pub const HEADER_LEN: usize = 5;

// ─── Message catalog ────────────────────────────────────────────────

/// One-byte message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    AttachCommandStream = 0x01,
    AttachEventStream = 0x02,

    SendCommand = 0x10,
    SendWaitCommand = 0x11,
    TryReplaceCommand = 0x12,
    SendCancelCommand = 0x13,
    SendCancelManyCommand = 0x14,
    RegisterResponseHandlerCommand = 0x15,
    UnregisterResponseHandlerCommand = 0x16,
    GetCurrentErrorCommand = 0x17,
    HasTimingCriticalCommandsScheduleCommand = 0x18,
    CollectGarbageCommand = 0x19,
    EnterPrintingModeCommand = 0x1A,
    ExitPrintingModeCommand = 0x1B,

    Reply = 0x20,
    ExceptionReply = 0x21,

    ExceptionEvent = 0x30,
    ClockSyncEvent = 0x31,
    ClockSyncUnreachableEvent = 0x32,
    ClockSyncExceptionEvent = 0x33,
    LostCommunicationEvent = 0x34,
    SendWaitEvent = 0x35,
    ResponseHandlerEvent = 0x36,
}

impl TryFrom<u8> for MessageType {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self, LinkError> {
        use MessageType::*;
        Ok(match value {
            0x01 => AttachCommandStream,
            0x02 => AttachEventStream,
            0x10 => SendCommand,
            0x11 => SendWaitCommand,
            0x12 => TryReplaceCommand,
            0x13 => SendCancelCommand,
            0x14 => SendCancelManyCommand,
            0x15 => RegisterResponseHandlerCommand,
            0x16 => UnregisterResponseHandlerCommand,
            0x17 => GetCurrentErrorCommand,
            0x18 => HasTimingCriticalCommandsScheduleCommand,
            0x19 => CollectGarbageCommand,
            0x1A => EnterPrintingModeCommand,
            0x1B => ExitPrintingModeCommand,
            0x20 => Reply,
            0x21 => ExceptionReply,
            0x30 => ExceptionEvent,
            0x31 => ClockSyncEvent,
            0x32 => ClockSyncUnreachableEvent,
            0x33 => ClockSyncExceptionEvent,
            0x34 => LostCommunicationEvent,
            0x35 => SendWaitEvent,
            0x36 => ResponseHandlerEvent,
            other => return Err(LinkError::UnknownMessageType(other)),
        })
    }
}

// ─── Framing ────────────────────────────────────────────────────────

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub payload: Bytes,
}

/// Encode one frame into a contiguous buffer.
pub fn encode_frame(kind: MessageType, payload: &[u8]) -> LinkResult<BytesMut> {
    let len = payload.len() + 1;
    if len > MAX_FRAME_LEN {
        return Err(LinkError::Protocol(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(len as u32);
    buf.put_u8(kind as u8);
    buf.put_slice(payload);
    Ok(buf)
}

/// Write one frame with a single `write_all`.
pub fn write_frame<W: Write>(writer: &mut W, kind: MessageType, payload: &[u8]) -> LinkResult<()> {
    let frame = encode_frame(kind, payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Incremental frame reader.
///
/// Bytes read before a timeout stay buffered, so a reader whose stream has
/// a read timeout can be polled repeatedly without losing frame alignment.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Bytes of an incomplete frame held back from the last read.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next frame, or `None` if the stream timed out before one completed.
    pub fn poll_frame(&mut self) -> LinkResult<Option<Frame>> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.try_parse()? {
                return Ok(Some(frame));
            }
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Block until a frame arrives or `cancel` fires.
    pub fn read_frame(&mut self, cancel: &CancelToken) -> LinkResult<Frame> {
        loop {
            if let Some(frame) = self.poll_frame()? {
                return Ok(frame);
            }
            if cancel.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
        }
    }

    fn try_parse(&mut self) -> LinkResult<Option<Frame>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(LinkError::Protocol(format!("invalid frame length {len}")));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        let mut body = self.buf.split_to(len).freeze();
        let kind = MessageType::try_from(body.get_u8())?;
        Ok(Some(Frame {
            kind,
            payload: body,
        }))
    }
}

// ─── Primitive payload codecs ───────────────────────────────────────

fn need(buf: &impl Buf, n: usize, what: &str) -> LinkResult<()> {
    if buf.remaining() < n {
        Err(LinkError::Protocol(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

pub fn get_u8(buf: &mut impl Buf) -> LinkResult<u8> {
    need(&*buf, 1, "u8")?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut impl Buf) -> LinkResult<u16> {
    need(&*buf, 2, "u16")?;
    Ok(buf.get_u16_le())
}

pub fn get_u32(buf: &mut impl Buf) -> LinkResult<u32> {
    need(&*buf, 4, "u32")?;
    Ok(buf.get_u32_le())
}

pub fn get_u64(buf: &mut impl Buf) -> LinkResult<u64> {
    need(&*buf, 8, "u64")?;
    Ok(buf.get_u64_le())
}

pub fn get_i64(buf: &mut impl Buf) -> LinkResult<i64> {
    need(&*buf, 8, "i64")?;
    Ok(buf.get_i64_le())
}

pub fn get_f64(buf: &mut impl Buf) -> LinkResult<f64> {
    need(&*buf, 8, "f64")?;
    Ok(buf.get_f64_le())
}

pub fn get_bool(buf: &mut impl Buf) -> LinkResult<bool> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(LinkError::Protocol(format!("invalid bool byte {other}"))),
    }
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn get_string(buf: &mut impl Buf) -> LinkResult<String> {
    let len = get_u32(buf)? as usize;
    if len > MAX_FRAME_LEN {
        return Err(LinkError::Protocol(format!("string length {len} too large")));
    }
    need(&*buf, len, "string")?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|e| LinkError::Protocol(format!("invalid utf8: {e}")))
}

pub fn put_exception(buf: &mut BytesMut, exc: &McuException) {
    let kind = match exc.kind {
        ExceptionKind::Generic => 0,
        ExceptionKind::InvalidOperation => 1,
        ExceptionKind::AutomatedRestart { .. } => 2,
        ExceptionKind::Timeout => 3,
    };
    buf.put_u8(kind);
    put_string(buf, &exc.message);
    if let ExceptionKind::AutomatedRestart { reason } = exc.kind {
        buf.put_u8(reason);
    }
}

pub fn get_exception(buf: &mut impl Buf) -> LinkResult<McuException> {
    let kind = get_u8(buf)?;
    let message = get_string(buf)?;
    let kind = match kind {
        0 => ExceptionKind::Generic,
        1 => ExceptionKind::InvalidOperation,
        2 => ExceptionKind::AutomatedRestart {
            reason: get_u8(buf)?,
        },
        3 => ExceptionKind::Timeout,
        other => return Err(LinkError::Protocol(format!("unknown exception kind {other}"))),
    };
    Ok(McuException { kind, message })
}

pub fn put_clock_state(buf: &mut BytesMut, state: &ClockState) {
    buf.put_f64_le(state.mcu_freq);
    buf.put_f64_le(state.sample_time);
    buf.put_f64_le(state.clock);
    buf.put_f64_le(state.freq);
    buf.put_u8(u8::from(state.is_ready));
}

pub fn get_clock_state(buf: &mut impl Buf) -> LinkResult<ClockState> {
    let state = ClockState {
        mcu_freq: get_f64(buf)?,
        sample_time: get_f64(buf)?,
        clock: get_f64(buf)?,
        freq: get_f64(buf)?,
        is_ready: get_bool(buf)?,
    };
    if state.is_ready {
        state
            .check()
            .map_err(|e| LinkError::Protocol(format!("clock state at {}: {e}", state.sample_time)))?;
    }
    Ok(state)
}

pub fn put_command(buf: &mut BytesMut, cmd: &Command) -> LinkResult<()> {
    buf.put_u8(cmd.id.0);
    buf.put_u8(cmd.flags.bits());
    buf.put_f64_le(cmd.sent_at);
    buf.put_f64_le(cmd.received_at);
    for arg in cmd.args() {
        match arg {
            CommandArg::Buffer(bytes) => {
                if bytes.len() > MAX_ARG_BUFFER_LEN {
                    return Err(LinkError::ArgumentTooLarge {
                        len: bytes.len(),
                        max: MAX_ARG_BUFFER_LEN,
                    });
                }
                buf.put_u8(1);
                buf.put_u8(bytes.len() as u8);
                buf.put_slice(bytes);
            }
            CommandArg::Scalar(value) => {
                buf.put_u8(0);
                buf.put_i64_le(*value);
            }
        }
    }
    Ok(())
}

/// Decode a command into an instance borrowed from `pool`.
///
/// The slot count comes from the pool's catalog.
pub fn get_command(buf: &mut impl Buf, pool: &CommandPool) -> LinkResult<PooledCommand> {
    let id = CommandId(get_u8(buf)?);
    let flags = CommandFlags::from_bits_truncate(get_u8(buf)?);
    let mut cmd = pool.acquire(id)?;
    cmd.flags = flags;
    cmd.sent_at = get_f64(buf)?;
    cmd.received_at = get_f64(buf)?;
    for slot in 0..cmd.arity() {
        if get_bool(buf)? {
            let len = get_u8(buf)? as usize;
            need(&*buf, len, "argument buffer")?;
            let mut bytes = [0u8; MAX_ARG_BUFFER_LEN];
            buf.copy_to_slice(&mut bytes[..len]);
            let arena_buf = pool.buffer(&bytes[..len])?;
            cmd.set_buffer(slot, arena_buf)?;
        } else {
            let value = get_i64(buf)?;
            cmd.set_scalar(slot, value)?;
        }
    }
    Ok(cmd)
}

fn expect_end(buf: &impl Buf, kind: MessageType) -> LinkResult<()> {
    if buf.has_remaining() {
        Err(LinkError::Protocol(format!(
            "{} trailing bytes after {kind:?}",
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

// ─── Requests (controller → device) ─────────────────────────────────

/// Call-surface request carried on a command stream.
#[derive(Debug, PartialEq)]
pub enum Request {
    SendCommand {
        min_clock: u64,
        req_clock: u64,
        command: PooledCommand,
    },
    SendWait {
        response: CommandId,
        timeout_ms: u32,
        command: PooledCommand,
    },
    TryReplace {
        original: PooledCommand,
        replacement: PooledCommand,
    },
    SendCancel {
        command: PooledCommand,
    },
    SendCancelMany {
        commands: Vec<PooledCommand>,
    },
    RegisterResponseHandler {
        response: CommandId,
    },
    UnregisterResponseHandler {
        handle: u64,
    },
    GetCurrentError,
    HasTimingCriticalCommandsScheduled,
    CollectGarbage,
    EnterPrintingMode,
    ExitPrintingMode,
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::SendCommand { .. } => MessageType::SendCommand,
            Self::SendWait { .. } => MessageType::SendWaitCommand,
            Self::TryReplace { .. } => MessageType::TryReplaceCommand,
            Self::SendCancel { .. } => MessageType::SendCancelCommand,
            Self::SendCancelMany { .. } => MessageType::SendCancelManyCommand,
            Self::RegisterResponseHandler { .. } => MessageType::RegisterResponseHandlerCommand,
            Self::UnregisterResponseHandler { .. } => MessageType::UnregisterResponseHandlerCommand,
            Self::GetCurrentError => MessageType::GetCurrentErrorCommand,
            Self::HasTimingCriticalCommandsScheduled => {
                MessageType::HasTimingCriticalCommandsScheduleCommand
            }
            Self::CollectGarbage => MessageType::CollectGarbageCommand,
            Self::EnterPrintingMode => MessageType::EnterPrintingModeCommand,
            Self::ExitPrintingMode => MessageType::ExitPrintingModeCommand,
        }
    }

    /// Encode as a complete frame.
    pub fn encode(&self) -> LinkResult<BytesMut> {
        let mut payload = BytesMut::new();
        match self {
            Self::SendCommand {
                min_clock,
                req_clock,
                command,
            } => {
                payload.put_u64_le(*min_clock);
                payload.put_u64_le(*req_clock);
                put_command(&mut payload, command)?;
            }
            Self::SendWait {
                response,
                timeout_ms,
                command,
            } => {
                payload.put_u8(response.0);
                payload.put_u32_le(*timeout_ms);
                put_command(&mut payload, command)?;
            }
            Self::TryReplace {
                original,
                replacement,
            } => {
                put_command(&mut payload, original)?;
                put_command(&mut payload, replacement)?;
            }
            Self::SendCancel { command } => put_command(&mut payload, command)?,
            Self::SendCancelMany { commands } => {
                let count = u16::try_from(commands.len()).map_err(|_| {
                    LinkError::InvalidOperation(format!(
                        "cannot cancel {} commands in one request",
                        commands.len()
                    ))
                })?;
                payload.put_u16_le(count);
                for command in commands {
                    put_command(&mut payload, command)?;
                }
            }
            Self::RegisterResponseHandler { response } => payload.put_u8(response.0),
            Self::UnregisterResponseHandler { handle } => payload.put_u64_le(*handle),
            Self::GetCurrentError
            | Self::HasTimingCriticalCommandsScheduled
            | Self::CollectGarbage
            | Self::EnterPrintingMode
            | Self::ExitPrintingMode => {}
        }
        encode_frame(self.message_type(), &payload)
    }

    /// Decode a request frame; commands are borrowed from `pool`.
    pub fn decode(frame: &Frame, pool: &CommandPool) -> LinkResult<Self> {
        let mut buf = frame.payload.clone();
        let request = match frame.kind {
            MessageType::SendCommand => Self::SendCommand {
                min_clock: get_u64(&mut buf)?,
                req_clock: get_u64(&mut buf)?,
                command: get_command(&mut buf, pool)?,
            },
            MessageType::SendWaitCommand => Self::SendWait {
                response: CommandId(get_u8(&mut buf)?),
                timeout_ms: get_u32(&mut buf)?,
                command: get_command(&mut buf, pool)?,
            },
            MessageType::TryReplaceCommand => Self::TryReplace {
                original: get_command(&mut buf, pool)?,
                replacement: get_command(&mut buf, pool)?,
            },
            MessageType::SendCancelCommand => Self::SendCancel {
                command: get_command(&mut buf, pool)?,
            },
            MessageType::SendCancelManyCommand => {
                let count = get_u16(&mut buf)? as usize;
                let mut commands = Vec::with_capacity(count);
                for _ in 0..count {
                    commands.push(get_command(&mut buf, pool)?);
                }
                Self::SendCancelMany { commands }
            }
            MessageType::RegisterResponseHandlerCommand => Self::RegisterResponseHandler {
                response: CommandId(get_u8(&mut buf)?),
            },
            MessageType::UnregisterResponseHandlerCommand => Self::UnregisterResponseHandler {
                handle: get_u64(&mut buf)?,
            },
            MessageType::GetCurrentErrorCommand => Self::GetCurrentError,
            MessageType::HasTimingCriticalCommandsScheduleCommand => {
                Self::HasTimingCriticalCommandsScheduled
            }
            MessageType::CollectGarbageCommand => Self::CollectGarbage,
            MessageType::EnterPrintingModeCommand => Self::EnterPrintingMode,
            MessageType::ExitPrintingModeCommand => Self::ExitPrintingMode,
            other => {
                return Err(LinkError::Protocol(format!(
                    "{other:?} is not a request message"
                )));
            }
        };
        expect_end(&buf, frame.kind)?;
        Ok(request)
    }
}

// ─── Replies (device → controller, inline on the command stream) ────

/// Inline reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Empty,
    Bool(bool),
    Handle(u64),
    Count(u32),
    Error(Option<McuException>),
}

impl Reply {
    pub fn encode(&self) -> LinkResult<BytesMut> {
        let mut payload = BytesMut::new();
        match self {
            Self::Empty => {}
            Self::Bool(v) => payload.put_u8(u8::from(*v)),
            Self::Handle(h) => payload.put_u64_le(*h),
            Self::Count(n) => payload.put_u32_le(*n),
            Self::Error(None) => payload.put_u8(0),
            Self::Error(Some(exc)) => {
                payload.put_u8(1);
                put_exception(&mut payload, exc);
            }
        }
        encode_frame(MessageType::Reply, &payload)
    }

    /// Exception reply frame.
    pub fn encode_exception(exc: &McuException) -> LinkResult<BytesMut> {
        let mut payload = BytesMut::new();
        put_exception(&mut payload, exc);
        encode_frame(MessageType::ExceptionReply, &payload)
    }
}

/// Split a reply frame into its payload or the exception it carries.
pub fn reply_payload(frame: Frame) -> LinkResult<Bytes> {
    match frame.kind {
        MessageType::Reply => Ok(frame.payload),
        MessageType::ExceptionReply => {
            let mut buf = frame.payload;
            Err(get_exception(&mut buf)?.into())
        }
        other => Err(LinkError::Protocol(format!(
            "expected a reply, got {other:?}"
        ))),
    }
}

pub fn decode_reply_empty(frame: Frame) -> LinkResult<()> {
    let buf = reply_payload(frame)?;
    expect_end(&buf, MessageType::Reply)
}

pub fn decode_reply_bool(frame: Frame) -> LinkResult<bool> {
    let mut buf = reply_payload(frame)?;
    let v = get_bool(&mut buf)?;
    expect_end(&buf, MessageType::Reply)?;
    Ok(v)
}

pub fn decode_reply_handle(frame: Frame) -> LinkResult<u64> {
    let mut buf = reply_payload(frame)?;
    let v = get_u64(&mut buf)?;
    expect_end(&buf, MessageType::Reply)?;
    Ok(v)
}

pub fn decode_reply_count(frame: Frame) -> LinkResult<u32> {
    let mut buf = reply_payload(frame)?;
    let v = get_u32(&mut buf)?;
    expect_end(&buf, MessageType::Reply)?;
    Ok(v)
}

pub fn decode_reply_error(frame: Frame) -> LinkResult<Option<McuException>> {
    let mut buf = reply_payload(frame)?;
    let exc = if get_bool(&mut buf)? {
        Some(get_exception(&mut buf)?)
    } else {
        None
    };
    expect_end(&buf, MessageType::Reply)?;
    Ok(exc)
}

// ─── Events (device → controller, event stream) ─────────────────────

/// Message on the single event stream.
#[derive(Debug, PartialEq)]
pub enum EventMessage {
    Exception(McuException),
    ClockSync(ClockState),
    ClockSyncUnreachable,
    ClockSyncException(McuException),
    LostCommunication,
    SendWait {
        handle: u64,
        result: Result<PooledCommand, McuException>,
    },
    ResponseHandler {
        handle: u64,
        command: PooledCommand,
    },
}

impl EventMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Exception(_) => MessageType::ExceptionEvent,
            Self::ClockSync(_) => MessageType::ClockSyncEvent,
            Self::ClockSyncUnreachable => MessageType::ClockSyncUnreachableEvent,
            Self::ClockSyncException(_) => MessageType::ClockSyncExceptionEvent,
            Self::LostCommunication => MessageType::LostCommunicationEvent,
            Self::SendWait { .. } => MessageType::SendWaitEvent,
            Self::ResponseHandler { .. } => MessageType::ResponseHandlerEvent,
        }
    }

    pub fn encode(&self) -> LinkResult<BytesMut> {
        let mut payload = BytesMut::new();
        match self {
            Self::Exception(exc) | Self::ClockSyncException(exc) => {
                put_exception(&mut payload, exc)
            }
            Self::ClockSync(state) => put_clock_state(&mut payload, state),
            Self::ClockSyncUnreachable | Self::LostCommunication => {}
            Self::SendWait { handle, result } => {
                payload.put_u64_le(*handle);
                match result {
                    Ok(command) => {
                        payload.put_u8(1);
                        put_command(&mut payload, command)?;
                    }
                    Err(exc) => {
                        payload.put_u8(0);
                        put_exception(&mut payload, exc);
                    }
                }
            }
            Self::ResponseHandler { handle, command } => {
                return encode_response_event(*handle, command);
            }
        }
        encode_frame(self.message_type(), &payload)
    }

    /// The subscriber-facing event, if this is not a correlated completion.
    pub fn into_link_event(self) -> Option<LinkEvent> {
        match self {
            Self::Exception(exc) => Some(LinkEvent::Exception(exc)),
            Self::ClockSync(state) => Some(LinkEvent::ClockSync(state)),
            Self::ClockSyncUnreachable => Some(LinkEvent::ClockSyncUnreachable),
            Self::ClockSyncException(exc) => Some(LinkEvent::ClockSyncException(exc)),
            Self::LostCommunication => Some(LinkEvent::LostCommunication),
            Self::SendWait { .. } | Self::ResponseHandler { .. } => None,
        }
    }

    pub fn decode(frame: &Frame, pool: &CommandPool) -> LinkResult<Self> {
        let mut buf = frame.payload.clone();
        let event = match frame.kind {
            MessageType::ExceptionEvent => Self::Exception(get_exception(&mut buf)?),
            MessageType::ClockSyncEvent => Self::ClockSync(get_clock_state(&mut buf)?),
            MessageType::ClockSyncUnreachableEvent => Self::ClockSyncUnreachable,
            MessageType::ClockSyncExceptionEvent => {
                Self::ClockSyncException(get_exception(&mut buf)?)
            }
            MessageType::LostCommunicationEvent => Self::LostCommunication,
            MessageType::SendWaitEvent => {
                let handle = get_u64(&mut buf)?;
                let result = if get_bool(&mut buf)? {
                    Ok(get_command(&mut buf, pool)?)
                } else {
                    Err(get_exception(&mut buf)?)
                };
                Self::SendWait { handle, result }
            }
            MessageType::ResponseHandlerEvent => Self::ResponseHandler {
                handle: get_u64(&mut buf)?,
                command: get_command(&mut buf, pool)?,
            },
            other => {
                return Err(LinkError::Protocol(format!(
                    "{other:?} is not an event message"
                )));
            }
        };
        expect_end(&buf, frame.kind)?;
        Ok(event)
    }
}

impl From<&LinkEvent> for EventMessage {
    fn from(event: &LinkEvent) -> Self {
        match event {
            LinkEvent::Exception(exc) => Self::Exception(exc.clone()),
            LinkEvent::ClockSync(state) => Self::ClockSync(*state),
            LinkEvent::ClockSyncUnreachable => Self::ClockSyncUnreachable,
            LinkEvent::ClockSyncException(exc) => Self::ClockSyncException(exc.clone()),
            LinkEvent::LostCommunication => Self::LostCommunication,
        }
    }
}

/// `ResponseHandlerEvent` frame for a borrowed command.
pub fn encode_response_event(handle: u64, command: &Command) -> LinkResult<BytesMut> {
    let mut payload = BytesMut::new();
    payload.put_u64_le(handle);
    put_command(&mut payload, command)?;
    encode_frame(MessageType::ResponseHandlerEvent, &payload)
}
