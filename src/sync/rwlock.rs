//! Recursive reader/writer lock.
//!
//! Allows either any number of readers or a single writer into a critical
//! region, and - unlike the standard library's lock - allows both recursive
//! read locks and recursive write locks. The grant policy is
//! writer-preferring: new first-time readers queue behind a waiting writer,
//! while a thread that already holds a read lock may always recurse, so
//! finite reader populations drain and the writer is eventually admitted.
//!
//! Per-thread reader recursion is tracked inside each lock instance, keyed
//! by thread id, so multiple locks can coexist and one thread can hold
//! several of them recursively at once.
//!
//! The implementation is an extension of the classic condition-variable
//! reader/writer lock (Stevens, "UNIX Network Programming" vol. 2, ch. 8)
//! with recursion counts layered on top.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// What the lock is currently granted as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Nobody holds the lock.
    Idle,
    /// One or more reader threads hold the lock.
    Read,
    /// A single writer thread holds the lock.
    Write,
}

/// Statistics kept by a [`RwLock`].
///
/// "Real" counts exclude recursive re-acquisitions; plain counts include
/// them. The numbers are only mutually consistent when sampled together,
/// which [`RwLock::stats`] does under the lock's internal mutex.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RwLockStats {
    /// Read locks granted, including recursive grants.
    pub read_locks_granted: i64,
    /// Read locks released, including recursive releases.
    pub read_locks_released: i64,
    /// Read locks granted, excluding recursive grants.
    pub real_read_locks_granted: i64,
    /// Read locks released, excluding recursive releases.
    pub real_read_locks_released: i64,
    /// Maximum number of reader threads active at any point.
    pub max_read_locks: i64,
    /// Maximum read-lock recursion depth observed for any thread.
    pub max_read_lock_recursion_depth: i64,
    /// Read locks that were not granted immediately.
    pub read_locks_delayed: i64,
    /// Write locks granted, including recursive grants.
    pub write_locks_granted: i64,
    /// Write locks released, including recursive releases.
    pub write_locks_released: i64,
    /// Write locks granted, excluding recursive grants.
    pub real_write_locks_granted: i64,
    /// Write locks released, excluding recursive releases.
    pub real_write_locks_released: i64,
    /// Maximum number of writer threads active at any point (0 or 1).
    pub max_write_locks: i64,
    /// Maximum write-lock recursion depth observed.
    pub max_write_lock_recursion_depth: i64,
    /// Write locks that were not granted immediately.
    pub write_locks_delayed: i64,
    /// Maximum number of writers pending at any point.
    pub max_write_locks_pending: i64,
}

struct RwState {
    mode: Mode,
    writer: Option<ThreadId>,
    write_depth: u32,
    waiting_writers: u32,
    active_readers: u32,
    reader_depth: HashMap<ThreadId, u32>,
    stats: RwLockStats,
}

/// A recursive, writer-preferring reader/writer lock.
pub struct RwLock {
    state: Mutex<RwState>,
    writers_cv: Condvar,
    readers_cv: Condvar,
}

impl RwLock {
    /// Create a new, idle lock.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RwState {
                mode: Mode::Idle,
                writer: None,
                write_depth: 0,
                waiting_writers: 0,
                active_readers: 0,
                reader_depth: HashMap::new(),
                stats: RwLockStats::default(),
            }),
            writers_cv: Condvar::new(),
            readers_cv: Condvar::new(),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, RwState>> {
        self.state
            .lock()
            .map_err(|_| Error::Lock("reader/writer lock poisoned".into()))
    }

    /// Acquire a read lock, blocking as needed.
    ///
    /// A thread already holding a read lock recurses immediately, even past
    /// waiting writers. A thread holding the write lock takes the read as a
    /// recursive write hold and must release it symmetrically with
    /// [`unlock`](Self::unlock).
    pub fn read_lock(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.lock_state()?;

        if state.writer == Some(me) {
            // Promoted read under an existing write hold.
            state.write_depth += 1;
            state.stats.write_locks_granted += 1;
            state.stats.max_write_lock_recursion_depth = state
                .stats
                .max_write_lock_recursion_depth
                .max(state.write_depth as i64);
            return Ok(());
        }

        let held = state.reader_depth.get(&me).copied().unwrap_or(0);
        if held > 0 {
            state.reader_depth.insert(me, held + 1);
            state.stats.read_locks_granted += 1;
            state.stats.max_read_lock_recursion_depth = state
                .stats
                .max_read_lock_recursion_depth
                .max((held + 1) as i64);
            return Ok(());
        }

        // First-time reader: queue behind an active or waiting writer.
        let mut delayed = false;
        while state.mode == Mode::Write || state.waiting_writers > 0 {
            delayed = true;
            state = self
                .readers_cv
                .wait(state)
                .map_err(|_| Error::Lock("reader/writer lock poisoned".into()))?;
        }
        state.mode = Mode::Read;
        state.active_readers += 1;
        state.reader_depth.insert(me, 1);
        state.stats.read_locks_granted += 1;
        state.stats.real_read_locks_granted += 1;
        state.stats.max_read_locks = state.stats.max_read_locks.max(state.active_readers as i64);
        state.stats.max_read_lock_recursion_depth =
            state.stats.max_read_lock_recursion_depth.max(1);
        if delayed {
            state.stats.read_locks_delayed += 1;
        }
        Ok(())
    }

    /// Acquire the write lock, blocking as needed.
    ///
    /// Recursive by the owning writer. The waiting-writers count is raised
    /// for the duration of any wait, which holds off new first-time readers.
    pub fn write_lock(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.lock_state()?;

        if state.writer == Some(me) {
            state.write_depth += 1;
            state.stats.write_locks_granted += 1;
            state.stats.max_write_lock_recursion_depth = state
                .stats
                .max_write_lock_recursion_depth
                .max(state.write_depth as i64);
            return Ok(());
        }

        let mut delayed = false;
        state.waiting_writers += 1;
        state.stats.max_write_locks_pending = state
            .stats
            .max_write_locks_pending
            .max(state.waiting_writers as i64);
        while state.mode != Mode::Idle {
            delayed = true;
            state = self
                .writers_cv
                .wait(state)
                .map_err(|_| Error::Lock("reader/writer lock poisoned".into()))?;
        }
        state.waiting_writers -= 1;
        state.mode = Mode::Write;
        state.writer = Some(me);
        state.write_depth = 1;
        state.stats.write_locks_granted += 1;
        state.stats.real_write_locks_granted += 1;
        state.stats.max_write_locks = state.stats.max_write_locks.max(1);
        state.stats.max_write_lock_recursion_depth =
            state.stats.max_write_lock_recursion_depth.max(1);
        if delayed {
            state.stats.write_locks_delayed += 1;
        }
        Ok(())
    }

    /// Attempt to take the write lock without blocking.
    ///
    /// Succeeds only when the lock is idle or already write-held by the
    /// calling thread.
    pub fn try_write_lock(&self) -> Result<bool> {
        let me = thread::current().id();
        let mut state = self.lock_state()?;

        if state.writer == Some(me) {
            state.write_depth += 1;
            state.stats.write_locks_granted += 1;
            return Ok(true);
        }
        if state.mode != Mode::Idle {
            return Ok(false);
        }
        state.mode = Mode::Write;
        state.writer = Some(me);
        state.write_depth = 1;
        state.stats.write_locks_granted += 1;
        state.stats.real_write_locks_granted += 1;
        state.stats.max_write_locks = state.stats.max_write_locks.max(1);
        Ok(true)
    }

    /// Release one hold (read or write) owned by the calling thread.
    ///
    /// A writer reaching depth zero wakes a waiting writer first, else
    /// broadcasts to readers; the last reader out does the same.
    pub fn unlock(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.lock_state()?;

        if state.writer == Some(me) {
            debug_assert_eq!(state.mode, Mode::Write);
            state.write_depth -= 1;
            state.stats.write_locks_released += 1;
            if state.write_depth == 0 {
                state.writer = None;
                state.mode = Mode::Idle;
                state.stats.real_write_locks_released += 1;
                let wake_writer = state.waiting_writers > 0;
                drop(state);
                if wake_writer {
                    self.writers_cv.notify_one();
                } else {
                    self.readers_cv.notify_all();
                }
            }
            return Ok(());
        }

        let held = state.reader_depth.get(&me).copied().unwrap_or(0);
        if held == 0 {
            return Err(Error::Unlock(
                "calling thread holds neither a read nor a write lock".into(),
            ));
        }
        state.stats.read_locks_released += 1;
        if held > 1 {
            state.reader_depth.insert(me, held - 1);
            return Ok(());
        }
        state.reader_depth.remove(&me);
        state.active_readers -= 1;
        state.stats.real_read_locks_released += 1;
        if state.active_readers == 0 {
            state.mode = Mode::Idle;
            let wake_writer = state.waiting_writers > 0;
            drop(state);
            if wake_writer {
                self.writers_cv.notify_one();
            } else {
                self.readers_cv.notify_all();
            }
        }
        Ok(())
    }

    /// Sample the lock's statistics consistently.
    pub fn stats(&self) -> Result<RwLockStats> {
        Ok(self.lock_state()?.stats)
    }

    /// Reset the lock's statistics to zero.
    pub fn reset_stats(&self) -> Result<()> {
        self.lock_state()?.stats = RwLockStats::default();
        Ok(())
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}
