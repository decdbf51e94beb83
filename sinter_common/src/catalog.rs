//! MCU command catalog.
//!
//! Maps one-byte command ids to their argument shape. Both endpoints must be
//! built from the same catalog: the wire format carries no arity, so a decoder
//! learns how many slots to read from here.

use bitflags::bitflags;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::consts::MAX_COMMAND_ARGS;

/// Catalog id of an MCU command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u8);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Per-command scheduling flags, carried on the wire as one byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandFlags: u8 {
        /// Must execute at its scheduled clock or the MCU faults.
        const TIMING_CRITICAL = 0x01;
        /// Part of the motion stream.
        const MOVEMENT        = 0x02;
    }
}

/// Argument shape of one catalog command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPrototype {
    pub id: CommandId,
    pub name: String,
    /// Number of argument slots.
    pub arity: usize,
    /// Flags applied to freshly pooled instances.
    pub default_flags: CommandFlags,
}

/// Catalog construction error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("command id {0} registered twice")]
    DuplicateId(CommandId),
    #[error("command name '{0}' registered twice")]
    DuplicateName(String),
    #[error("command '{name}' declares {arity} arguments (max {MAX_COMMAND_ARGS})")]
    TooManyArgs { name: String, arity: usize },
}

/// Well-known ids of the built-in catalog.
pub mod ids {
    use super::CommandId;

    pub const GET_CLOCK: CommandId = CommandId(0x01);
    pub const CLOCK: CommandId = CommandId(0x02);
    pub const IDENTIFY: CommandId = CommandId(0x03);
    pub const IDENTIFY_RESPONSE: CommandId = CommandId(0x04);
    pub const QUEUE_MOVE: CommandId = CommandId(0x10);
    pub const QUEUE_DWELL: CommandId = CommandId(0x11);
    pub const QUEUE_PWM: CommandId = CommandId(0x12);
    pub const RESET_STEP_CLOCK: CommandId = CommandId(0x13);
}

/// Immutable id → prototype table.
#[derive(Debug, Clone, Default)]
pub struct CommandCatalog {
    by_id: HashMap<CommandId, CommandPrototype>,
    by_name: HashMap<String, CommandId>,
}

impl CommandCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Catalog understood by the simulated MCU and the link stepper.
    ///
    /// | id | name | args |
    /// |----|------|------|
    /// | 0x01 | `get_clock` | — |
    /// | 0x02 | `clock` | `clock` |
    /// | 0x03 | `identify` | `offset, count` |
    /// | 0x04 | `identify_response` | `offset, data` (buffer) |
    /// | 0x10 | `queue_move` | `oid, clock, ticks, steps` |
    /// | 0x11 | `queue_dwell` | `oid, clock, ticks` |
    /// | 0x12 | `queue_pwm` | `oid, clock, value` |
    /// | 0x13 | `reset_step_clock` | `oid, clock, position` |
    pub fn builtin() -> Self {
        let motion = CommandFlags::TIMING_CRITICAL | CommandFlags::MOVEMENT;
        let mut catalog = Self::default();
        for (id, name, arity, default_flags) in [
            (ids::GET_CLOCK, "get_clock", 0, CommandFlags::empty()),
            (ids::CLOCK, "clock", 1, CommandFlags::empty()),
            (ids::IDENTIFY, "identify", 2, CommandFlags::empty()),
            (ids::IDENTIFY_RESPONSE, "identify_response", 2, CommandFlags::empty()),
            (ids::QUEUE_MOVE, "queue_move", 4, motion),
            (ids::QUEUE_DWELL, "queue_dwell", 3, motion),
            (ids::QUEUE_PWM, "queue_pwm", 3, CommandFlags::TIMING_CRITICAL),
            (ids::RESET_STEP_CLOCK, "reset_step_clock", 3, motion),
        ] {
            catalog.insert(CommandPrototype {
                id,
                name: name.to_string(),
                arity,
                default_flags,
            });
        }
        catalog
    }

    fn insert(&mut self, proto: CommandPrototype) {
        self.by_name.insert(proto.name.clone(), proto.id);
        self.by_id.insert(proto.id, proto);
    }

    pub fn get(&self, id: CommandId) -> Option<&CommandPrototype> {
        self.by_id.get(&id)
    }

    pub fn lookup(&self, name: &str) -> Option<&CommandPrototype> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn arity(&self, id: CommandId) -> Option<usize> {
        self.get(id).map(|p| p.arity)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandPrototype> {
        self.by_id.values()
    }
}

/// Builder collecting prototypes; validation happens in [`CatalogBuilder::build`].
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    entries: Vec<CommandPrototype>,
}

impl CatalogBuilder {
    pub fn command(
        mut self,
        id: CommandId,
        name: impl Into<String>,
        arity: usize,
        default_flags: CommandFlags,
    ) -> Self {
        self.entries.push(CommandPrototype {
            id,
            name: name.into(),
            arity,
            default_flags,
        });
        self
    }

    pub fn build(self) -> Result<CommandCatalog, CatalogError> {
        let mut catalog = CommandCatalog::default();
        for proto in self.entries {
            if proto.arity > MAX_COMMAND_ARGS {
                return Err(CatalogError::TooManyArgs {
                    name: proto.name,
                    arity: proto.arity,
                });
            }
            if catalog.by_id.contains_key(&proto.id) {
                return Err(CatalogError::DuplicateId(proto.id));
            }
            if catalog.by_name.contains_key(&proto.name) {
                return Err(CatalogError::DuplicateName(proto.name));
            }
            catalog.insert(proto);
        }
        Ok(catalog)
    }
}
