//! Regular pool: one fixed shape per head.
//!
//! Recycles the allocation behind a `Box<T>`. Freeing drops the value but
//! parks the allocation on the head's free list; the next allocation
//! rewrites the slot in place. The allocation is recycled, never the value.

use super::{alloc_slot, regular_class, PoolList};
use crate::error::Result;
use crate::observability;
use crate::sync::DlfttMutex;
use std::mem::{size_of, MaybeUninit};
use std::ptr;
use std::sync::{Arc, Weak};

struct RegState<T> {
    free: Vec<Box<MaybeUninit<T>>>,
    allocated: usize,
}

/// Counters for one regular pool head.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegularPoolStats {
    /// Blocks allocated through this head (live + parked).
    pub allocated: usize,
    /// Blocks currently parked on the free list.
    pub on_free_list: usize,
}

/// A free-list pool for records of one fixed type.
///
/// # Example
///
/// ```rust,ignore
/// let pool: Arc<RegularPool<ChunkInfo>> = RegularPool::new("chunk-info")?;
/// let info = pool.alloc(ChunkInfo::default())?;
/// pool.free(info)?;
/// ```
pub struct RegularPool<T> {
    name: &'static str,
    state: DlfttMutex<RegState<T>>,
}

impl<T: Send + 'static> RegularPool<T> {
    /// Create a pool head and link it into the regular class.
    pub fn new(name: &'static str) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            name,
            state: DlfttMutex::new(RegState {
                free: Vec::new(),
                allocated: 0,
            }),
        });
        let dyn_pool: Arc<dyn PoolList> = pool.clone();
        let weak: Weak<dyn PoolList> = Arc::downgrade(&dyn_pool);
        regular_class().register(weak)?;
        Ok(pool)
    }

    /// Allocate a record, recycling a parked allocation when one exists.
    pub fn alloc(&self, value: T) -> Result<Box<T>> {
        let recycled = {
            let mut state = self.state.acquire()?;
            state.free.pop()
        };
        let slot = match recycled {
            Some(slot) => {
                regular_class().note_reclaimed(size_of::<T>());
                slot
            }
            None => {
                let slot = alloc_slot::<T>()?;
                let mut state = self.state.acquire()?;
                state.allocated += 1;
                slot
            }
        };
        let mut slot = slot;
        slot.write(value);
        // SAFETY: the slot was just initialized by `write`; reinterpreting
        // the box as `Box<T>` hands ownership of a valid value to the
        // caller.
        Ok(unsafe { Box::from_raw(Box::into_raw(slot).cast::<T>()) })
    }

    /// Allocate a record initialized to its default value.
    pub fn alloc_default(&self) -> Result<Box<T>>
    where
        T: Default,
    {
        self.alloc(T::default())
    }

    /// Release a record: drop the value, park the allocation.
    ///
    /// May trigger a garbage-collection pass on this head (per-list cap) or
    /// across the whole class (global cap).
    pub fn free(&self, obj: Box<T>) -> Result<()> {
        let raw = Box::into_raw(obj);
        // SAFETY: `raw` came out of a live `Box<T>`; the value is dropped
        // exactly once here and the allocation is retained as an
        // uninitialized slot of the same layout.
        let slot = unsafe {
            ptr::drop_in_place(raw);
            Box::from_raw(raw.cast::<MaybeUninit<T>>())
        };

        let on_list = {
            let mut state = self.state.acquire()?;
            state.free.push(slot);
            state.free.len()
        };

        let class = regular_class();
        class.note_freed(size_of::<T>());
        if on_list * size_of::<T>() > class.list_limit() {
            PoolList::collect(self)?;
        }
        if class.over_global_limit() {
            class.collect_all()?;
        }
        Ok(())
    }

    /// Sample this head's counters.
    pub fn stats(&self) -> Result<RegularPoolStats> {
        let state = self.state.acquire()?;
        Ok(RegularPoolStats {
            allocated: state.allocated,
            on_free_list: state.free.len(),
        })
    }
}

impl<T> Drop for RegularPool<T> {
    fn drop(&mut self) {
        // A head dropped with parked blocks takes them out of the class
        // gauge; the boxes free themselves.
        let parked = self.state.get_mut().free.len();
        if parked > 0 {
            regular_class().note_reclaimed(parked * size_of::<T>());
        }
    }
}

impl<T: Send + 'static> PoolList for RegularPool<T> {
    fn collect(&self) -> Result<()> {
        let collected = {
            let mut state = self.state.acquire()?;
            let n = state.free.len();
            state.allocated -= n;
            state.free.clear();
            n
        };
        if collected > 0 {
            regular_class().note_reclaimed(collected * size_of::<T>());
            observability::record_gc_pass("regular");
            tracing::trace!(
                pool = self.name,
                blocks = collected,
                "collected regular free list"
            );
        }
        Ok(())
    }

    fn allocated_bytes(&self) -> Result<usize> {
        let state = self.state.acquire()?;
        Ok(state.allocated * size_of::<T>())
    }
}
