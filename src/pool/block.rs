//! Block pool: byte blocks recycled by exact size.
//!
//! One head manages a priority queue of size classes, each with its own
//! free list. Lookups move the matched class to the front of the queue, so
//! the sizes a workload is currently churning through stay cheapest to
//! find. Blocks are fixed-length boxed byte slices; the length recovers the
//! size class when a block comes back.

use super::{alloc_bytes, block_class, PoolList};
use crate::error::Result;
use crate::observability;
use crate::sync::DlfttMutex;
use std::sync::{Arc, Weak};

struct SizeClass {
    size: usize,
    free: Vec<Box<[u8]>>,
    allocated: usize,
}

struct BlkState {
    classes: Vec<SizeClass>,
    allocated: usize,
    list_bytes: usize,
}

impl BlkState {
    /// Find the size class for `size`, moving it to the front of the queue.
    fn find_class(&mut self, size: usize) -> Option<usize> {
        let pos = self.classes.iter().position(|c| c.size == size)?;
        if pos != 0 {
            let class = self.classes.remove(pos);
            self.classes.insert(0, class);
        }
        Some(0)
    }

    /// Find or create the size class for `size`, at the front of the queue.
    fn find_or_create_class(&mut self, size: usize) -> usize {
        if self.find_class(size).is_none() {
            self.classes.insert(
                0,
                SizeClass {
                    size,
                    free: Vec::new(),
                    allocated: 0,
                },
            );
        }
        0
    }
}

/// Counters for one block pool head.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockPoolStats {
    /// Blocks allocated through this head, over all size classes.
    pub allocated: usize,
    /// Bytes currently parked on this head's free lists.
    pub on_list_bytes: usize,
    /// Number of live size classes in the priority queue.
    pub size_classes: usize,
}

/// A free-list pool for byte blocks of arbitrary (but recurring) sizes.
pub struct BlockPool {
    name: &'static str,
    state: DlfttMutex<BlkState>,
}

impl BlockPool {
    /// Create a pool head and link it into the block class.
    pub fn new(name: &'static str) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            name,
            state: DlfttMutex::new(BlkState {
                classes: Vec::new(),
                allocated: 0,
                list_bytes: 0,
            }),
        });
        let dyn_pool: Arc<dyn PoolList> = pool.clone();
        let weak: Weak<dyn PoolList> = Arc::downgrade(&dyn_pool);
        block_class().register(weak)?;
        Ok(pool)
    }

    /// Allocate a block of exactly `size` bytes.
    ///
    /// Recycled blocks keep their previous contents; fresh blocks are
    /// zero-filled. Use [`alloc_zeroed`](Self::alloc_zeroed) when the
    /// caller needs guaranteed zeros.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn alloc(&self, size: usize) -> Result<Box<[u8]>> {
        assert!(size > 0, "zero-length blocks are meaningless");

        let recycled = {
            let mut state = self.state.acquire()?;
            match state.find_class(size) {
                Some(idx) => {
                    let block = state.classes[idx].free.pop();
                    if block.is_some() {
                        state.list_bytes -= size;
                    }
                    block
                }
                None => None,
            }
        };
        if let Some(block) = recycled {
            block_class().note_reclaimed(size);
            return Ok(block);
        }

        let block = alloc_bytes(size)?;
        let mut state = self.state.acquire()?;
        let idx = state.find_or_create_class(size);
        state.classes[idx].allocated += 1;
        state.allocated += 1;
        Ok(block)
    }

    /// Allocate a zero-filled block of exactly `size` bytes.
    pub fn alloc_zeroed(&self, size: usize) -> Result<Box<[u8]>> {
        let mut block = self.alloc(size)?;
        block.fill(0);
        Ok(block)
    }

    /// Whether a recycled block of `size` bytes is immediately available.
    pub fn has_free_block(&self, size: usize) -> Result<bool> {
        let mut state = self.state.acquire()?;
        Ok(match state.find_class(size) {
            Some(idx) => !state.classes[idx].free.is_empty(),
            None => false,
        })
    }

    /// Resize a block, preserving the leading bytes that fit.
    pub fn realloc(&self, block: Box<[u8]>, new_size: usize) -> Result<Box<[u8]>> {
        if block.len() == new_size {
            return Ok(block);
        }
        let mut grown = self.alloc(new_size)?;
        let keep = block.len().min(new_size);
        grown[..keep].copy_from_slice(&block[..keep]);
        self.free(block)?;
        Ok(grown)
    }

    /// Release a block back to its size class.
    ///
    /// May trigger a garbage-collection pass on this head (per-list cap) or
    /// across the whole class (global cap).
    pub fn free(&self, block: Box<[u8]>) -> Result<()> {
        let size = block.len();

        let list_bytes = {
            let mut state = self.state.acquire()?;
            let idx = state.find_or_create_class(size);
            state.classes[idx].free.push(block);
            state.list_bytes += size;
            state.list_bytes
        };

        let class = block_class();
        class.note_freed(size);
        if list_bytes > class.list_limit() {
            PoolList::collect(self)?;
        }
        if class.over_global_limit() {
            class.collect_all()?;
        }
        Ok(())
    }

    /// Sample this head's counters.
    pub fn stats(&self) -> Result<BlockPoolStats> {
        let state = self.state.acquire()?;
        Ok(BlockPoolStats {
            allocated: state.allocated,
            on_list_bytes: state.list_bytes,
            size_classes: state.classes.len(),
        })
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        let parked = self.state.get_mut().list_bytes;
        if parked > 0 {
            block_class().note_reclaimed(parked);
        }
    }
}

impl PoolList for BlockPool {
    fn collect(&self) -> Result<()> {
        let bytes = {
            let mut state = self.state.acquire()?;
            let mut freed_bytes = 0;
            let mut freed_count = 0;
            for class in state.classes.iter_mut() {
                let n = class.free.len();
                freed_bytes += n * class.size;
                freed_count += n;
                class.allocated -= n;
                class.free.clear();
            }
            // Size classes with nothing left outstanding leave the queue.
            state.classes.retain(|c| c.allocated > 0);
            state.allocated -= freed_count;
            state.list_bytes = 0;
            freed_bytes
        };
        if bytes > 0 {
            block_class().note_reclaimed(bytes);
            observability::record_gc_pass("block");
            tracing::trace!(pool = self.name, bytes, "collected block free lists");
        }
        Ok(())
    }

    fn allocated_bytes(&self) -> Result<usize> {
        let state = self.state.acquire()?;
        Ok(state
            .classes
            .iter()
            .map(|c| c.allocated * c.size)
            .sum())
    }
}
