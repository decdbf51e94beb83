//! MCU command values.

use sinter_common::catalog::{CommandFlags, CommandId};

use crate::arena::ArenaBuf;
use crate::error::{LinkError, LinkResult};

/// One argument slot.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArg {
    Scalar(i64),
    Buffer(ArenaBuf),
}

impl Default for CommandArg {
    fn default() -> Self {
        Self::Scalar(0)
    }
}

/// A catalog command with its fixed-arity argument list.
///
/// Instances normally live in a [`crate::pool::CommandPool`] and travel as
/// [`crate::pool::PooledCommand`] guards.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: CommandId,
    pub flags: CommandFlags,
    /// Host time the command was handed to the transport [s].
    pub sent_at: f64,
    /// Host time the command was received by the device side [s].
    pub received_at: f64,
    args: Vec<CommandArg>,
}

impl Command {
    /// Command with `arity` zeroed scalar slots.
    pub fn new(id: CommandId, arity: usize, flags: CommandFlags) -> Self {
        Self {
            id,
            flags,
            sent_at: 0.0,
            received_at: 0.0,
            args: vec![CommandArg::default(); arity],
        }
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn args(&self) -> &[CommandArg] {
        &self.args
    }

    pub fn arg(&self, slot: usize) -> Option<&CommandArg> {
        self.args.get(slot)
    }

    /// Scalar value of `slot`, if it holds one.
    pub fn scalar(&self, slot: usize) -> Option<i64> {
        match self.args.get(slot) {
            Some(CommandArg::Scalar(v)) => Some(*v),
            _ => None,
        }
    }

    /// Buffer contents of `slot`, if it holds one.
    pub fn buffer(&self, slot: usize) -> Option<&[u8]> {
        match self.args.get(slot) {
            Some(CommandArg::Buffer(b)) => Some(b),
            _ => None,
        }
    }

    fn slot_mut(&mut self, slot: usize) -> LinkResult<&mut CommandArg> {
        let arity = self.args.len();
        self.args
            .get_mut(slot)
            .ok_or(LinkError::SlotOutOfRange { slot, arity })
    }

    pub fn set_scalar(&mut self, slot: usize, value: i64) -> LinkResult<()> {
        *self.slot_mut(slot)? = CommandArg::Scalar(value);
        Ok(())
    }

    pub fn set_buffer(&mut self, slot: usize, buf: ArenaBuf) -> LinkResult<()> {
        *self.slot_mut(slot)? = CommandArg::Buffer(buf);
        Ok(())
    }

    /// Fill slots from `values` in order.
    pub fn set_scalars(&mut self, values: &[i64]) -> LinkResult<()> {
        for (slot, &value) in values.iter().enumerate() {
            self.set_scalar(slot, value)?;
        }
        Ok(())
    }

    pub fn is_timing_critical(&self) -> bool {
        self.flags.contains(CommandFlags::TIMING_CRITICAL)
    }

    pub fn is_movement(&self) -> bool {
        self.flags.contains(CommandFlags::MOVEMENT)
    }

    /// Same id and argument values; flags and timestamps are ignored.
    pub fn same_payload(&self, other: &Command) -> bool {
        self.id == other.id && self.args == other.args
    }

    /// Reset to a blank instance, dropping buffer references.
    pub(crate) fn clear(&mut self, flags: CommandFlags) {
        self.flags = flags;
        self.sent_at = 0.0;
        self.received_at = 0.0;
        for arg in &mut self.args {
            *arg = CommandArg::default();
        }
    }
}
