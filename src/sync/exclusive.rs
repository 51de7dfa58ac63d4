//! Recursive exclusive lock.
//!
//! A mutex that the owning thread may re-acquire; the lock is released for
//! other threads only when the unlock count matches the lock count. Batched
//! acquisition reserves several recursive holds in one non-blocking step,
//! and batched release drops the whole recursive stack at once - the two
//! halves of the library's "hand the lock across a callback boundary"
//! protocol.

use crate::error::{Error, Result};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

struct ExState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// A recursive exclusive lock.
pub struct ExclusiveLock {
    state: Mutex<ExState>,
    idle: Condvar,
}

impl ExclusiveLock {
    /// Create a new, unowned lock.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ExState {
                owner: None,
                depth: 0,
            }),
            idle: Condvar::new(),
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, ExState>> {
        self.state
            .lock()
            .map_err(|_| Error::Lock("exclusive lock poisoned".into()))
    }

    /// Acquire the lock, blocking until it is available.
    ///
    /// If the calling thread already owns the lock the recursion depth is
    /// incremented and the call returns immediately.
    pub fn acquire(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.lock_state()?;
        if state.owner == Some(me) {
            state.depth += 1;
            return Ok(());
        }
        while state.owner.is_some() {
            state = self
                .idle
                .wait(state)
                .map_err(|_| Error::Lock("exclusive lock poisoned".into()))?;
        }
        state.owner = Some(me);
        state.depth = 1;
        Ok(())
    }

    /// Attempt to acquire the lock without blocking.
    ///
    /// Returns `true` on success (including recursive re-acquisition by the
    /// owner) and `false` if another thread holds the lock.
    pub fn try_acquire(&self) -> Result<bool> {
        self.try_acquire_many(1)
    }

    /// Attempt to reserve `count` recursive holds in one non-blocking step.
    ///
    /// All-or-nothing: either the calling thread ends up holding the lock
    /// `count` more times than before, or the lock state is unchanged and
    /// `false` is returned.
    pub fn try_acquire_many(&self, count: u32) -> Result<bool> {
        debug_assert!(count >= 1, "reserving zero holds is meaningless");
        let me = thread::current().id();
        let mut state = self.lock_state()?;
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = count;
                Ok(true)
            }
            Some(owner) if owner == me => {
                state.depth += count;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Release one hold of the lock.
    ///
    /// When the recursion depth reaches zero the owner is cleared and one
    /// waiter, if any, is woken. Releasing a lock the calling thread does
    /// not own is a programmer error.
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.lock_state()?;
        if state.owner != Some(me) {
            return Err(Error::Unlock(
                "calling thread does not own the exclusive lock".into(),
            ));
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.idle.notify_one();
        }
        Ok(())
    }

    /// Release the calling thread's entire recursive stack.
    ///
    /// Returns the depth that was released.
    pub fn release_all(&self) -> Result<u32> {
        let me = thread::current().id();
        let mut state = self.lock_state()?;
        if state.owner != Some(me) {
            return Err(Error::Unlock(
                "calling thread does not own the exclusive lock".into(),
            ));
        }
        let prev = state.depth;
        state.depth = 0;
        state.owner = None;
        drop(state);
        self.idle.notify_one();
        Ok(prev)
    }

    /// Current recursion depth held by the calling thread (0 if not owner).
    pub fn held_depth(&self) -> Result<u32> {
        let me = thread::current().id();
        let state = self.lock_state()?;
        if state.owner == Some(me) {
            Ok(state.depth)
        } else {
            Ok(0)
        }
    }
}

impl Default for ExclusiveLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_recursive_acquire_release() {
        let lock = ExclusiveLock::new();
        lock.acquire().unwrap();
        lock.acquire().unwrap();
        assert_eq!(lock.held_depth().unwrap(), 2);
        lock.release().unwrap();
        assert_eq!(lock.held_depth().unwrap(), 1);
        lock.release().unwrap();
        assert_eq!(lock.held_depth().unwrap(), 0);
    }

    #[test]
    fn test_try_acquire_contended() {
        let lock = Arc::new(ExclusiveLock::new());
        lock.acquire().unwrap();

        let peer = Arc::clone(&lock);
        let acquired = thread::spawn(move || peer.try_acquire().unwrap())
            .join()
            .unwrap();
        assert!(!acquired);

        lock.release().unwrap();
        let peer = Arc::clone(&lock);
        let acquired = thread::spawn(move || {
            let ok = peer.try_acquire().unwrap();
            if ok {
                peer.release().unwrap();
            }
            ok
        })
        .join()
        .unwrap();
        assert!(acquired);
    }

    #[test]
    fn test_try_acquire_many_reserves_atomically() {
        let lock = ExclusiveLock::new();
        assert!(lock.try_acquire_many(3).unwrap());
        assert_eq!(lock.held_depth().unwrap(), 3);
        assert_eq!(lock.release_all().unwrap(), 3);
        assert_eq!(lock.held_depth().unwrap(), 0);
    }

    #[test]
    fn test_release_without_ownership_fails() {
        let lock = Arc::new(ExclusiveLock::new());
        lock.acquire().unwrap();
        let peer = Arc::clone(&lock);
        let result = thread::spawn(move || peer.release()).join().unwrap();
        assert!(result.is_err());
        lock.release().unwrap();
    }

    #[test]
    fn test_blocking_handoff() {
        let lock = Arc::new(ExclusiveLock::new());
        lock.acquire().unwrap();

        let peer = Arc::clone(&lock);
        let waiter = thread::spawn(move || {
            peer.acquire().unwrap();
            let depth = peer.held_depth().unwrap();
            peer.release().unwrap();
            depth
        });

        thread::sleep(std::time::Duration::from_millis(20));
        lock.release().unwrap();
        assert_eq!(waiter.join().unwrap(), 1);
    }
}
