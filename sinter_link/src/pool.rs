//! Command pool.
//!
//! Per-id lock-free free lists of [`Command`] instances plus the shared
//! [`Arena`] their buffers are sliced from. Borrowing hands out a
//! [`PooledCommand`] guard; the guard returns the instance exactly once,
//! either through [`PooledCommand::release`] or on drop.

use crossbeam::queue::SegQueue;
use sinter_common::catalog::{CommandCatalog, CommandFlags, CommandId};
use sinter_common::consts::OUTSTANDING_WARN_DEFAULT;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

use crate::arena::{Arena, ArenaBuf};
use crate::command::Command;
use crate::error::{LinkError, LinkResult};

struct PoolInner {
    catalog: Arc<CommandCatalog>,
    free: Vec<SegQueue<Command>>,
    arena: Arena,
    outstanding: AtomicUsize,
    warn_threshold: usize,
    warned: AtomicBool,
}

/// Shared command pool. Cloning shares the same storage.
#[derive(Clone)]
pub struct CommandPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPool")
            .field("outstanding", &self.outstanding())
            .field("pooled", &self.pooled())
            .finish()
    }
}

impl CommandPool {
    pub fn new(catalog: Arc<CommandCatalog>) -> Self {
        Self::with_warn_threshold(catalog, OUTSTANDING_WARN_DEFAULT)
    }

    /// Pool that logs a leak warning once more than `warn_threshold`
    /// commands are borrowed at the same time.
    pub fn with_warn_threshold(catalog: Arc<CommandCatalog>, warn_threshold: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                catalog,
                free: (0..=u8::MAX as usize).map(|_| SegQueue::new()).collect(),
                arena: Arena::new(),
                outstanding: AtomicUsize::new(0),
                warn_threshold,
                warned: AtomicBool::new(false),
            }),
        }
    }

    pub fn catalog(&self) -> &Arc<CommandCatalog> {
        &self.inner.catalog
    }

    pub fn arena(&self) -> &Arena {
        &self.inner.arena
    }

    /// Borrow a blank command for catalog id `id`.
    pub fn acquire(&self, id: CommandId) -> LinkResult<PooledCommand> {
        let proto = self
            .inner
            .catalog
            .get(id)
            .ok_or(LinkError::UnknownCommand(id))?;
        let cmd = match self.inner.free[id.0 as usize].pop() {
            Some(cmd) => cmd,
            None => Command::new(id, proto.arity, proto.default_flags),
        };
        Ok(self.track(cmd))
    }

    /// Borrow a blank command by catalog name.
    pub fn acquire_named(&self, name: &str) -> LinkResult<PooledCommand> {
        let id = self
            .inner
            .catalog
            .lookup(name)
            .map(|p| p.id)
            .ok_or_else(|| LinkError::InvalidOperation(format!("unknown command '{name}'")))?;
        self.acquire(id)
    }

    /// Borrow a command for `id` with its scalar slots filled from `values`.
    pub fn command(&self, id: CommandId, values: &[i64]) -> LinkResult<PooledCommand> {
        let mut cmd = self.acquire(id)?;
        cmd.set_scalars(values)?;
        Ok(cmd)
    }

    /// Copy `data` into the pool's arena.
    pub fn buffer(&self, data: &[u8]) -> LinkResult<ArenaBuf> {
        self.inner.arena.alloc(data)
    }

    /// Commands currently borrowed.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }

    /// Commands sitting in the free lists.
    pub fn pooled(&self) -> usize {
        self.inner.free.iter().map(SegQueue::len).sum()
    }

    /// Drop every pooled instance and start a fresh arena chunk.
    /// Returns the number of instances freed.
    pub fn collect_garbage(&self) -> usize {
        let mut freed = 0;
        for list in &self.inner.free {
            while list.pop().is_some() {
                freed += 1;
            }
        }
        self.inner.arena.reset();
        debug!(freed, outstanding = self.outstanding(), "command pool garbage collected");
        freed
    }

    fn track(&self, cmd: Command) -> PooledCommand {
        let now = self.inner.outstanding.fetch_add(1, Ordering::Relaxed) + 1;
        if now > self.inner.warn_threshold && !self.inner.warned.swap(true, Ordering::Relaxed) {
            warn!(
                outstanding = now,
                threshold = self.inner.warn_threshold,
                "outstanding pooled commands above threshold, possible leak"
            );
        }
        PooledCommand {
            cmd,
            pool: self.clone(),
        }
    }

    fn give_back(&self, mut cmd: Command) {
        let flags = self
            .inner
            .catalog
            .get(cmd.id)
            .map(|p| p.default_flags)
            .unwrap_or_default();
        cmd.clear(flags);
        self.inner.free[cmd.id.0 as usize].push(cmd);
        let now = self.inner.outstanding.fetch_sub(1, Ordering::Relaxed) - 1;
        if now <= self.inner.warn_threshold / 2 {
            self.inner.warned.store(false, Ordering::Relaxed);
        }
    }
}

/// Borrowed command; returned to its pool exactly once.
pub struct PooledCommand {
    cmd: Command,
    pool: CommandPool,
}

impl PooledCommand {
    /// Return the command to its pool now.
    pub fn release(self) {
        drop(self);
    }

    /// Pool this command belongs to.
    pub fn pool(&self) -> &CommandPool {
        &self.pool
    }
}

impl Deref for PooledCommand {
    type Target = Command;

    fn deref(&self) -> &Command {
        &self.cmd
    }
}

impl DerefMut for PooledCommand {
    fn deref_mut(&mut self) -> &mut Command {
        &mut self.cmd
    }
}

impl Drop for PooledCommand {
    fn drop(&mut self) {
        // Zero-arity placeholder; never allocates.
        let cmd = std::mem::replace(
            &mut self.cmd,
            Command::new(CommandId(0), 0, CommandFlags::empty()),
        );
        self.pool.give_back(cmd);
    }
}

impl fmt::Debug for PooledCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.cmd, f)
    }
}

impl PartialEq for PooledCommand {
    fn eq(&self, other: &Self) -> bool {
        self.cmd == other.cmd
    }
}

impl PartialEq<Command> for PooledCommand {
    fn eq(&self, other: &Command) -> bool {
        self.cmd == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sinter_common::catalog::ids;

    fn pool() -> CommandPool {
        CommandPool::new(Arc::new(CommandCatalog::builtin()))
    }

    #[test]
    fn acquire_and_release_recycles() {
        let pool = pool();
        let mut cmd = pool.acquire(ids::QUEUE_MOVE).unwrap();
        assert_eq!(cmd.arity(), 4);
        assert!(cmd.is_timing_critical());
        cmd.set_scalars(&[1, 2, 3, 4]).unwrap();
        assert_eq!(pool.outstanding(), 1);
        cmd.release();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.pooled(), 1);

        let again = pool.acquire(ids::QUEUE_MOVE).unwrap();
        assert_eq!(again.scalar(3), Some(0), "recycled command is blank");
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn drop_returns_to_pool() {
        let pool = pool();
        {
            let _a = pool.acquire(ids::GET_CLOCK).unwrap();
            let _b = pool.acquire(ids::GET_CLOCK).unwrap();
            assert_eq!(pool.outstanding(), 2);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn unknown_id_rejected() {
        let pool = pool();
        assert!(matches!(
            pool.acquire(CommandId(0xEE)),
            Err(LinkError::UnknownCommand(CommandId(0xEE)))
        ));
        assert!(pool.acquire_named("nope").is_err());
    }

    #[test]
    fn flags_restored_on_return() {
        let pool = pool();
        let mut cmd = pool.acquire(ids::QUEUE_PWM).unwrap();
        cmd.flags = CommandFlags::empty();
        cmd.release();
        let cmd = pool.acquire(ids::QUEUE_PWM).unwrap();
        assert!(cmd.is_timing_critical());
    }

    #[test]
    fn collect_garbage_empties_free_lists() {
        let pool = pool();
        for _ in 0..5 {
            pool.acquire(ids::CLOCK).unwrap().release();
        }
        // Same instance recycled every time.
        assert_eq!(pool.pooled(), 1);
        let held: Vec<_> = (0..3).map(|_| pool.acquire(ids::CLOCK).unwrap()).collect();
        drop(held);
        assert_eq!(pool.pooled(), 3);
        assert_eq!(pool.collect_garbage(), 3);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn concurrent_borrow_and_return() {
        let pool = pool();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let mut cmd = pool.acquire(ids::QUEUE_DWELL).unwrap();
                        cmd.set_scalar(2, i).unwrap();
                        cmd.release();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.pooled() <= 4);
    }

    #[test]
    fn buffer_args_share_arena() {
        let pool = pool();
        let mut cmd = pool.acquire(ids::IDENTIFY_RESPONSE).unwrap();
        let buf = pool.buffer(b"{\"mcu\":1}").unwrap();
        cmd.set_buffer(1, buf).unwrap();
        assert_eq!(cmd.buffer(1), Some(&b"{\"mcu\":1}"[..]));
        assert_eq!(pool.arena().allocations(), 1);
    }
}
