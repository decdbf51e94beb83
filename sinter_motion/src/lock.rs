//! Master lock with owner tracking.
//!
//! The master lock is shared with every subsystem that touches device
//! state. It remembers which thread holds it so the movement queue can
//! (a) skip re-locking when a producer already holds it and (b) refuse to
//! take the flush lock underneath it.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn current_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// Non-reentrant mutex that knows its owner thread.
#[derive(Debug, Default)]
pub struct MasterLock {
    inner: Mutex<()>,
    /// Token of the owning thread, 0 when free.
    owner: AtomicU64,
}

/// Held master lock; released on drop.
pub struct MasterGuard<'a> {
    lock: &'a MasterLock,
    _guard: MutexGuard<'a, ()>,
}

impl MasterLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is free.
    ///
    /// Locking twice from the same thread deadlocks; use
    /// [`MasterLock::lock_unless_held`] where the caller may already own it.
    pub fn lock(&self) -> MasterGuard<'_> {
        let guard = self.inner.lock();
        self.owner.store(current_token(), Ordering::Release);
        MasterGuard {
            lock: self,
            _guard: guard,
        }
    }

    pub fn try_lock(&self) -> Option<MasterGuard<'_>> {
        let guard = self.inner.try_lock()?;
        self.owner.store(current_token(), Ordering::Release);
        Some(MasterGuard {
            lock: self,
            _guard: guard,
        })
    }

    /// Lock, unless the current thread already holds the lock (`None`).
    pub fn lock_unless_held(&self) -> Option<MasterGuard<'_>> {
        if self.is_held_by_current_thread() {
            None
        } else {
            Some(self.lock())
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_token()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl Drop for MasterGuard<'_> {
    fn drop(&mut self) {
        self.lock.owner.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tracks_owner_thread() {
        let lock = Arc::new(MasterLock::new());
        assert!(!lock.is_held_by_current_thread());
        let guard = lock.lock();
        assert!(lock.is_held_by_current_thread());
        assert!(lock.lock_unless_held().is_none());

        let other = Arc::clone(&lock);
        let seen = std::thread::spawn(move || (other.is_held_by_current_thread(), other.try_lock().is_some()))
            .join()
            .unwrap();
        assert_eq!(seen, (false, false));

        drop(guard);
        assert!(!lock.is_held_by_current_thread());
        assert!(!lock.is_locked());
    }
}
