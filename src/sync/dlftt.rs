//! DLFTT-aware mutex.
//!
//! A composite of a plain mutex and the calling thread's DLFTT snapshot.
//! While a thread's DLFTT counter is positive, acquisitions on this mutex
//! become no-ops for that thread, which lets user callbacks re-enter the
//! library without self-deadlocking on locks their caller already owns
//! transitively. This is a correctness mechanism, not a lock-elision
//! optimization: the guard returned by [`DlfttMutex::acquire`] records the
//! decision made at acquire time, so the matching release agrees with it
//! even if the DLFTT counter changes inside the critical section.

use crate::error::{Error, Result};
use crate::sync::registry;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

/// A mutex that obeys the DLFTT locking protocol.
///
/// The protected value is reachable through [`acquire`](Self::acquire) like a
/// normal mutex; when the calling thread's DLFTT counter is positive the
/// guard bypasses the OS mutex entirely.
pub struct DlfttMutex<T> {
    lock: Mutex<()>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized either by `lock`, or - on the
// bypass path - by the process-wide API write lock that a positive DLFTT
// asserts the thread is holding. Either way no two threads touch the value
// concurrently.
unsafe impl<T: Send> Send for DlfttMutex<T> {}
unsafe impl<T: Send> Sync for DlfttMutex<T> {}

impl<T> DlfttMutex<T> {
    /// Create a new DLFTT-aware mutex protecting `value`.
    pub fn new(value: T) -> Self {
        Self {
            lock: Mutex::new(()),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the mutex, honoring the calling thread's DLFTT value.
    ///
    /// DLFTT of zero locks the underlying mutex; a positive DLFTT returns a
    /// bypass guard without touching it. The guard itself carries the
    /// snapshot, so the release on drop always mirrors the acquire.
    pub fn acquire(&self) -> Result<DlfttGuard<'_, T>> {
        let held = if registry::dlftt() == 0 {
            Some(
                self.lock
                    .lock()
                    .map_err(|_| Error::Lock("DLFTT mutex poisoned".into()))?,
            )
        } else {
            None
        };
        Ok(DlfttGuard {
            _held: held,
            data: self.data.get(),
            _marker: PhantomData,
        })
    }

    /// Whether the underlying OS mutex is currently locked.
    ///
    /// Probe used by diagnostics and tests to observe the DLFTT no-op law;
    /// the answer is immediately stale in the presence of other threads.
    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Access the protected value through an exclusive borrow.
    ///
    /// No locking is needed: `&mut self` already witnesses exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consume the mutex and return the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Guard for a [`DlfttMutex`].
///
/// Holds the OS mutex when the acquire decided to lock, and nothing when the
/// acquire was a DLFTT no-op. Dropping it mirrors the acquire decision.
pub struct DlfttGuard<'a, T> {
    _held: Option<MutexGuard<'a, ()>>,
    data: *mut T,
    _marker: PhantomData<&'a mut T>,
}

impl<T> Deref for DlfttGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard witnesses exclusive access per the protocol
        // described on `DlfttMutex`.
        unsafe { &*self.data }
    }
}

impl<T> DerefMut for DlfttGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as for `deref`.
        unsafe { &mut *self.data }
    }
}
