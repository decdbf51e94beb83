//! MCU call surface.
//!
//! [`McuLink`] is what the rest of the host talks to, whether the MCU is
//! driven in-process ([`crate::simulation::SimulatedMcu`]) or through the
//! device-side process ([`crate::controller::ControllerEndpoint`]).

use sinter_common::cancel::CancelToken;
use sinter_common::catalog::CommandId;
use sinter_common::clock::{ClockModel, ClockState};
use std::sync::Arc;
use std::time::Duration;

use crate::command::Command;
use crate::error::{LinkResult, McuException};
use crate::pool::{CommandPool, PooledCommand};

/// Asynchronous signal from the MCU side.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The MCU raised an exception outside any request.
    Exception(McuException),
    /// A new clock regression snapshot.
    ClockSync(ClockState),
    /// Clock synchronisation could not reach the MCU.
    ClockSyncUnreachable,
    /// Clock synchronisation failed.
    ClockSyncException(McuException),
    /// The MCU stopped answering.
    LostCommunication,
}

/// Callback invoked with every response matching a registered id.
pub type ResponseCallback = Arc<dyn Fn(&Command) + Send + Sync>;

/// Callback invoked for every [`LinkEvent`].
pub type EventCallback = Arc<dyn Fn(&LinkEvent) + Send + Sync>;

/// Server-issued response handler handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerHandle(pub u64);

/// Generic MCU command dispatch.
///
/// Commands are passed by value and returned to their pool by the
/// implementation once they have been consumed.
pub trait McuLink: Send + Sync {
    /// Pool commands for this link are borrowed from.
    fn pool(&self) -> &CommandPool;

    /// Clock model kept current by clock-sync events.
    fn clock(&self) -> &Arc<ClockModel>;

    /// Schedule `command` for `req_clock`, not to be released before `min_clock`.
    fn send(
        &self,
        command: PooledCommand,
        min_clock: u64,
        req_clock: u64,
        cancel: &CancelToken,
    ) -> LinkResult<()>;

    /// Send `command` and wait up to `timeout` for a `response` command.
    fn send_wait(
        &self,
        command: PooledCommand,
        response: CommandId,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> LinkResult<PooledCommand>;

    /// Swap a still-pending `original` for `replacement`.
    /// Returns `false` if `original` already executed or was never sent.
    fn try_replace(
        &self,
        original: PooledCommand,
        replacement: PooledCommand,
        cancel: &CancelToken,
    ) -> LinkResult<bool>;

    /// Drop every pending command equal to `command`.
    fn send_cancel(&self, command: PooledCommand, cancel: &CancelToken) -> LinkResult<()>;

    /// Drop every pending command equal to any of `commands`.
    fn send_cancel_many(&self, commands: Vec<PooledCommand>, cancel: &CancelToken)
    -> LinkResult<()>;

    /// Invoke `callback` for every `response` command the MCU emits.
    fn register_response_handler(
        &self,
        response: CommandId,
        callback: ResponseCallback,
        cancel: &CancelToken,
    ) -> LinkResult<HandlerHandle>;

    fn unregister_response_handler(
        &self,
        handle: HandlerHandle,
        cancel: &CancelToken,
    ) -> LinkResult<()>;

    /// Latched MCU error, if any.
    fn current_error(&self, cancel: &CancelToken) -> LinkResult<Option<McuException>>;

    fn has_timing_critical_commands_scheduled(&self, cancel: &CancelToken) -> LinkResult<bool>;

    /// Trim pooled storage; returns the number of instances freed.
    fn collect_garbage(&self, cancel: &CancelToken) -> LinkResult<usize>;

    fn enter_printing_mode(&self, cancel: &CancelToken) -> LinkResult<()>;

    fn exit_printing_mode(&self, cancel: &CancelToken) -> LinkResult<()>;

    /// Receive every subsequent [`LinkEvent`].
    fn subscribe(&self, callback: EventCallback);
}
