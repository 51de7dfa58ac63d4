//! Count-down thread barrier.
//!
//! A rendezvous point for a fixed number of threads, reusable across
//! cycles. Built on a mutex and condition variable with a generation
//! counter so a reused barrier never confuses consecutive cycles, even
//! under spurious wakeups. Intended for orchestrating multi-thread tests.

use crate::error::{Error, Result};
use std::sync::{Condvar, Mutex};

struct BarrierState {
    entered: u64,
    generation: u64,
}

/// A reusable rendezvous barrier for `threshold` threads.
pub struct Barrier {
    state: Mutex<BarrierState>,
    cv: Condvar,
    threshold: u64,
}

impl Barrier {
    /// Create a barrier that releases once `threshold` threads have entered.
    ///
    /// # Panics
    ///
    /// Panics if `threshold` is zero.
    pub fn new(threshold: u64) -> Self {
        assert!(threshold >= 1, "a barrier needs at least one participant");
        Self {
            state: Mutex::new(BarrierState {
                entered: 0,
                generation: 0,
            }),
            cv: Condvar::new(),
            threshold,
        }
    }

    /// Enter the barrier and wait for the rest of the cohort.
    ///
    /// The last arrival releases every sleeper and resets the barrier for
    /// the next cycle atomically.
    pub fn wait(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Lock("barrier poisoned".into()))?;
        state.entered += 1;
        if state.entered == self.threshold {
            state.entered = 0;
            state.generation = state.generation.wrapping_add(1);
            drop(state);
            self.cv.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while state.generation == generation {
            state = self
                .cv
                .wait(state)
                .map_err(|_| Error::Lock("barrier poisoned".into()))?;
        }
        Ok(())
    }

    /// The number of threads this barrier rendezvouses.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_thread_barrier() {
        let barrier = Barrier::new(1);
        barrier.wait().unwrap();
        barrier.wait().unwrap();
    }

    #[test]
    fn test_two_thread_rendezvous() {
        let barrier = Arc::new(Barrier::new(2));
        let entered = Arc::new(AtomicU64::new(0));

        let b = Arc::clone(&barrier);
        let e = Arc::clone(&entered);
        let peer = thread::spawn(move || {
            e.fetch_add(1, Ordering::SeqCst);
            b.wait().unwrap();
            e.load(Ordering::SeqCst)
        });

        entered.fetch_add(1, Ordering::SeqCst);
        barrier.wait().unwrap();
        // Both sides observe the full cohort after release.
        assert_eq!(entered.load(Ordering::SeqCst), 2);
        assert_eq!(peer.join().unwrap(), 2);
    }

    #[test]
    fn test_barrier_is_reusable() {
        let barrier = Arc::new(Barrier::new(2));
        for _ in 0..3 {
            let b = Arc::clone(&barrier);
            let peer = thread::spawn(move || b.wait().unwrap());
            barrier.wait().unwrap();
            peer.join().unwrap();
        }
    }

    #[test]
    fn test_many_threads() {
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];
        for _ in 0..8 {
            let b = Arc::clone(&barrier);
            handles.push(thread::spawn(move || b.wait().unwrap()));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
