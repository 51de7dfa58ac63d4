//! Global API lock.
//!
//! The process-wide serialization point for library entry. The canonical
//! build pairs the recursive reader/writer lock with the per-thread DLFTT
//! counter: read-only operations take read holds, mutating operations take
//! write holds, and while a thread's DLFTT is positive every entry becomes
//! a no-op so user callbacks invoked under the lock can re-enter the
//! library. The `exclusive-api` feature degenerates this to a single
//! recursive exclusive lock with a shared lock count and a permanently-zero
//! DLFTT.
//!
//! Besides the blocking entry points used by library operations, the lock
//! exposes the developer surface for handing the lock across foreign code:
//! a non-blocking [`acquire`](ApiLock::acquire) that reserves a batch of
//! recursive holds, a [`release`](ApiLock::release) that drops the whole
//! recursive stack, and an attempt counter for contention diagnostics.

use crate::error::Result;
use crate::observability;
use crate::sync::registry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

#[cfg(not(feature = "exclusive-api"))]
use crate::error::Error;
#[cfg(not(feature = "exclusive-api"))]
use crate::sync::rwlock::RwLock;

#[cfg(feature = "exclusive-api")]
use crate::sync::exclusive::ExclusiveLock;

static GLOBAL: OnceLock<ApiLock> = OnceLock::new();

/// The library's global API lock.
pub struct ApiLock {
    #[cfg(not(feature = "exclusive-api"))]
    lock: RwLock,
    #[cfg(feature = "exclusive-api")]
    lock: ExclusiveLock,
    attempts: AtomicU64,
}

impl ApiLock {
    /// The process-wide API lock instance, created on first use.
    pub fn global() -> &'static ApiLock {
        GLOBAL.get_or_init(ApiLock::new)
    }

    /// Number of entry attempts made against this lock so far.
    ///
    /// Bumped on every blocking entry, acquired or not; diagnostics use the
    /// delta across a workload to measure contention.
    pub fn attempt_count(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    fn note_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        observability::record_api_attempt();
    }
}

#[cfg(not(feature = "exclusive-api"))]
impl ApiLock {
    fn new() -> Self {
        Self {
            lock: RwLock::new(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Non-blocking: reserve `count` recursive holds for the calling thread.
    ///
    /// Returns `true` when the holds were reserved (also when the thread's
    /// DLFTT was already positive, meaning the thread effectively holds the
    /// lock), `false` when another thread holds the lock.
    pub fn acquire(&self, count: u32) -> Result<bool> {
        debug_assert!(count >= 1, "reserving zero holds is meaningless");
        let dlftt = registry::dlftt();
        let acquired = if dlftt == 0 {
            self.lock.try_write_lock()?
        } else {
            true
        };
        if acquired {
            registry::set_dlftt(dlftt + count);
        }
        Ok(acquired)
    }

    /// Release the calling thread's entire recursive stack.
    ///
    /// Returns the depth that was released.
    pub fn release(&self) -> Result<u32> {
        let prev = registry::dlftt();
        if prev == 0 {
            return Err(Error::Unlock(
                "API lock not held by the calling thread".into(),
            ));
        }
        registry::set_dlftt(0);
        self.lock.unlock()?;
        Ok(prev)
    }

    /// Enter the library for a read-only operation.
    pub fn enter_read(&self, operation: &'static str) -> Result<ApiGuard<'_>> {
        self.note_attempt();
        let locked = if registry::dlftt() == 0 {
            self.lock.read_lock()?;
            true
        } else {
            false
        };
        registry::push_context(operation);
        tracing::trace!(operation, locked, "entering API (read)");
        Ok(ApiGuard {
            lock: self,
            locked,
            operation,
        })
    }

    /// Enter the library for a mutating operation.
    pub fn enter_write(&self, operation: &'static str) -> Result<ApiGuard<'_>> {
        self.note_attempt();
        let locked = if registry::dlftt() == 0 {
            self.lock.write_lock()?;
            true
        } else {
            false
        };
        registry::push_context(operation);
        tracing::trace!(operation, locked, "entering API (write)");
        Ok(ApiGuard {
            lock: self,
            locked,
            operation,
        })
    }

    /// Prepare for invoking a user callback: disable locking for this thread.
    ///
    /// Every library path that calls out to user code brackets the call with
    /// this and [`user_callback_restore`](Self::user_callback_restore), so
    /// the callback can re-enter the library without self-deadlock.
    pub fn user_callback_prepare(&self) -> Result<()> {
        registry::inc_dlftt();
        Ok(())
    }

    /// Undo one [`user_callback_prepare`](Self::user_callback_prepare).
    pub fn user_callback_restore(&self) -> Result<()> {
        registry::dec_dlftt();
        Ok(())
    }
}

#[cfg(feature = "exclusive-api")]
impl ApiLock {
    fn new() -> Self {
        Self {
            lock: ExclusiveLock::new(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Non-blocking: reserve `count` recursive holds for the calling thread.
    pub fn acquire(&self, count: u32) -> Result<bool> {
        self.lock.try_acquire_many(count)
    }

    /// Release the calling thread's entire recursive stack.
    ///
    /// Returns the depth that was released.
    pub fn release(&self) -> Result<u32> {
        self.lock.release_all()
    }

    /// Enter the library for a read-only operation.
    ///
    /// The exclusive variant has no shared mode; readers serialize too.
    pub fn enter_read(&self, operation: &'static str) -> Result<ApiGuard<'_>> {
        self.enter_write(operation)
    }

    /// Enter the library for a mutating operation.
    pub fn enter_write(&self, operation: &'static str) -> Result<ApiGuard<'_>> {
        self.note_attempt();
        self.lock.acquire()?;
        registry::push_context(operation);
        tracing::trace!(operation, "entering API");
        Ok(ApiGuard {
            lock: self,
            locked: true,
            operation,
        })
    }

    /// No-op in the exclusive variant; DLFTT is permanently zero.
    pub fn user_callback_prepare(&self) -> Result<()> {
        Ok(())
    }

    /// No-op in the exclusive variant; DLFTT is permanently zero.
    pub fn user_callback_restore(&self) -> Result<()> {
        Ok(())
    }
}

/// RAII hold of the API lock for one library operation.
///
/// Records at entry whether the lock was actually taken (a positive DLFTT
/// makes the entry a no-op) and mirrors that decision on drop.
pub struct ApiGuard<'a> {
    lock: &'a ApiLock,
    locked: bool,
    operation: &'static str,
}

impl Drop for ApiGuard<'_> {
    fn drop(&mut self) {
        registry::pop_context();
        if self.locked {
            #[cfg(not(feature = "exclusive-api"))]
            let released = self.lock.lock.unlock();
            #[cfg(feature = "exclusive-api")]
            let released = self.lock.lock.release();
            if released.is_err() {
                tracing::error!(operation = self.operation, "failed to release API lock");
            }
        }
    }
}
