//! Array pool: one head serves every element count up to a bound.
//!
//! Each element count `0..=max_elems` gets its own sublist. A freed array's
//! length recovers its count, so blocks return to the right sublist without
//! any side metadata. Element types are constrained to `Copy + Default`:
//! recycled arrays keep their previous contents (callers initialize what
//! they use), and nothing ever needs dropping element-by-element.

use super::{alloc_array, array_class, PoolList};
use crate::error::Result;
use crate::observability;
use crate::sync::DlfttMutex;
use std::mem::size_of;
use std::sync::{Arc, Weak};

struct ArrSublist<T> {
    free: Vec<Box<[T]>>,
    allocated: usize,
}

struct ArrState<T> {
    sublists: Vec<ArrSublist<T>>,
    allocated: usize,
    list_bytes: usize,
}

/// Counters for one array pool head.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArrayPoolStats {
    /// Arrays allocated through this head, over all element counts.
    pub allocated: usize,
    /// Bytes currently parked on this head's sublists.
    pub on_list_bytes: usize,
}

/// A free-list pool for arrays of `0..=max_elems` elements.
pub struct ArrayPool<T> {
    name: &'static str,
    max_elems: usize,
    state: DlfttMutex<ArrState<T>>,
}

impl<T: Copy + Default + Send + 'static> ArrayPool<T> {
    /// Create a pool head serving arrays of up to `max_elems` elements and
    /// link it into the array class.
    pub fn new(name: &'static str, max_elems: usize) -> Result<Arc<Self>> {
        let sublists = (0..=max_elems)
            .map(|_| ArrSublist {
                free: Vec::new(),
                allocated: 0,
            })
            .collect();
        let pool = Arc::new(Self {
            name,
            max_elems,
            state: DlfttMutex::new(ArrState {
                sublists,
                allocated: 0,
                list_bytes: 0,
            }),
        });
        let dyn_pool: Arc<dyn PoolList> = pool.clone();
        let weak: Weak<dyn PoolList> = Arc::downgrade(&dyn_pool);
        array_class().register(weak)?;
        Ok(pool)
    }

    /// Allocate an array of `nelem` elements.
    ///
    /// Recycled arrays keep their previous contents; fresh arrays are
    /// default-filled. Use [`alloc_cleared`](Self::alloc_cleared) when the
    /// caller needs every element defaulted.
    ///
    /// # Panics
    ///
    /// Panics if `nelem` exceeds the head's bound; requesting a count the
    /// head was not declared for is a programmer error.
    pub fn alloc(&self, nelem: usize) -> Result<Box<[T]>> {
        assert!(
            nelem <= self.max_elems,
            "array pool {} serves at most {} elements",
            self.name,
            self.max_elems
        );
        let bytes = nelem * size_of::<T>();

        let recycled = {
            let mut state = self.state.acquire()?;
            let arr = state.sublists[nelem].free.pop();
            if arr.is_some() {
                state.list_bytes -= bytes;
            }
            arr
        };
        if let Some(arr) = recycled {
            array_class().note_reclaimed(bytes);
            return Ok(arr);
        }

        let arr = alloc_array::<T>(nelem)?;
        let mut state = self.state.acquire()?;
        state.sublists[nelem].allocated += 1;
        state.allocated += 1;
        Ok(arr)
    }

    /// Allocate an array with every element set to its default value.
    pub fn alloc_cleared(&self, nelem: usize) -> Result<Box<[T]>> {
        let mut arr = self.alloc(nelem)?;
        arr.fill(T::default());
        Ok(arr)
    }

    /// Resize an array, preserving the leading elements that fit.
    pub fn realloc(&self, arr: Box<[T]>, new_nelem: usize) -> Result<Box<[T]>> {
        if arr.len() == new_nelem {
            return Ok(arr);
        }
        let mut grown = self.alloc(new_nelem)?;
        let keep = arr.len().min(new_nelem);
        grown[..keep].copy_from_slice(&arr[..keep]);
        self.free(arr)?;
        Ok(grown)
    }

    /// Release an array back to its sublist.
    ///
    /// May trigger a garbage-collection pass on this head (per-list cap) or
    /// across the whole class (global cap).
    pub fn free(&self, arr: Box<[T]>) -> Result<()> {
        let nelem = arr.len();
        assert!(
            nelem <= self.max_elems,
            "array returned to pool {} exceeds its bound",
            self.name
        );
        let bytes = nelem * size_of::<T>();

        let list_bytes = {
            let mut state = self.state.acquire()?;
            state.sublists[nelem].free.push(arr);
            state.list_bytes += bytes;
            state.list_bytes
        };

        let class = array_class();
        class.note_freed(bytes);
        if list_bytes > class.list_limit() {
            PoolList::collect(self)?;
        }
        if class.over_global_limit() {
            class.collect_all()?;
        }
        Ok(())
    }

    /// Sample this head's counters.
    pub fn stats(&self) -> Result<ArrayPoolStats> {
        let state = self.state.acquire()?;
        Ok(ArrayPoolStats {
            allocated: state.allocated,
            on_list_bytes: state.list_bytes,
        })
    }

    /// The largest element count this head serves.
    pub fn max_elems(&self) -> usize {
        self.max_elems
    }
}

impl<T> Drop for ArrayPool<T> {
    fn drop(&mut self) {
        let parked = self.state.get_mut().list_bytes;
        if parked > 0 {
            array_class().note_reclaimed(parked);
        }
    }
}

impl<T: Copy + Default + Send + 'static> PoolList for ArrayPool<T> {
    fn collect(&self) -> Result<()> {
        let bytes = {
            let mut state = self.state.acquire()?;
            let mut freed_bytes = 0;
            let mut freed_count = 0;
            for (nelem, sublist) in state.sublists.iter_mut().enumerate() {
                let n = sublist.free.len();
                freed_bytes += n * nelem * size_of::<T>();
                freed_count += n;
                sublist.allocated -= n;
                sublist.free.clear();
            }
            state.allocated -= freed_count;
            state.list_bytes = 0;
            freed_bytes
        };
        if bytes > 0 {
            array_class().note_reclaimed(bytes);
            observability::record_gc_pass("array");
            tracing::trace!(pool = self.name, bytes, "collected array free lists");
        }
        Ok(())
    }

    fn allocated_bytes(&self) -> Result<usize> {
        let state = self.state.acquire()?;
        Ok(state
            .sublists
            .iter()
            .enumerate()
            .map(|(nelem, sub)| sub.allocated * nelem * size_of::<T>())
            .sum())
    }
}
