//! Factory pool: runtime-created heads for caller-chosen fixed sizes.
//!
//! Behaves like a regular head over raw bytes, except the head itself is
//! created and destroyed at runtime rather than declared per type. Layers
//! that deal in caller-determined record sizes (a serialized heap's object
//! slots, for example) create a factory per size and tear it down when the
//! size goes out of scope.

use super::{alloc_bytes, factory_class, PoolList};
use crate::error::{Error, Result};
use crate::observability;
use crate::sync::DlfttMutex;
use std::sync::{Arc, Weak};

struct FacState {
    free: Vec<Box<[u8]>>,
    allocated: usize,
}

/// Counters for one factory head.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FactoryPoolStats {
    /// Blocks allocated through this factory (live + parked).
    pub allocated: usize,
    /// Blocks currently parked on the free list.
    pub on_free_list: usize,
}

/// A runtime-created free-list head for one fixed block size.
pub struct FactoryPool {
    size: usize,
    state: DlfttMutex<FacState>,
}

impl FactoryPool {
    /// Create a factory for blocks of `size` bytes and link it into the
    /// factory class.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Result<Arc<Self>> {
        assert!(size > 0, "zero-length factory blocks are meaningless");
        let factory = Arc::new(Self {
            size,
            state: DlfttMutex::new(FacState {
                free: Vec::new(),
                allocated: 0,
            }),
        });
        let dyn_factory: Arc<dyn PoolList> = factory.clone();
        let weak: Weak<dyn PoolList> = Arc::downgrade(&dyn_factory);
        factory_class().register(weak)?;
        Ok(factory)
    }

    /// The fixed block size this factory serves.
    pub fn block_size(&self) -> usize {
        self.size
    }

    /// Allocate a block, recycling a parked one when available.
    ///
    /// Recycled blocks keep their previous contents; fresh blocks are
    /// zero-filled.
    pub fn alloc(&self) -> Result<Box<[u8]>> {
        let recycled = {
            let mut state = self.state.acquire()?;
            state.free.pop()
        };
        if let Some(block) = recycled {
            factory_class().note_reclaimed(self.size);
            return Ok(block);
        }

        let block = alloc_bytes(self.size)?;
        let mut state = self.state.acquire()?;
        state.allocated += 1;
        Ok(block)
    }

    /// Allocate a zero-filled block.
    pub fn alloc_zeroed(&self) -> Result<Box<[u8]>> {
        let mut block = self.alloc()?;
        block.fill(0);
        Ok(block)
    }

    /// Release a block back to this factory.
    ///
    /// May trigger a garbage-collection pass on this head (per-list cap) or
    /// across the whole class (global cap).
    ///
    /// # Panics
    ///
    /// Panics if the block's length does not match the factory's size;
    /// freeing through the wrong factory is a programmer error.
    pub fn free(&self, block: Box<[u8]>) -> Result<()> {
        assert_eq!(
            block.len(),
            self.size,
            "block freed through a factory of a different size"
        );

        let on_list = {
            let mut state = self.state.acquire()?;
            state.free.push(block);
            state.free.len()
        };

        let class = factory_class();
        class.note_freed(self.size);
        if on_list * self.size > class.list_limit() {
            PoolList::collect(self)?;
        }
        if class.over_global_limit() {
            class.collect_all()?;
        }
        Ok(())
    }

    /// Tear the factory down.
    ///
    /// Collects the free list, then fails if blocks allocated through this
    /// factory are still outstanding; the caller must return every block
    /// before destroying the head that recycles it.
    pub fn destroy(self: Arc<Self>) -> Result<()> {
        PoolList::collect(self.as_ref())?;
        let outstanding = {
            let state = self.state.acquire()?;
            state.allocated
        };
        if outstanding != 0 {
            return Err(Error::Gc(format!(
                "factory of {}-byte blocks destroyed with {outstanding} outstanding",
                self.size
            )));
        }
        // Dropping the Arc unlinks the head; the class registry prunes the
        // dead weak reference on its next walk.
        Ok(())
    }

    /// Sample this factory's counters.
    pub fn stats(&self) -> Result<FactoryPoolStats> {
        let state = self.state.acquire()?;
        Ok(FactoryPoolStats {
            allocated: state.allocated,
            on_free_list: state.free.len(),
        })
    }
}

impl Drop for FactoryPool {
    fn drop(&mut self) {
        let parked = self.state.get_mut().free.len();
        if parked > 0 {
            factory_class().note_reclaimed(parked * self.size);
        }
    }
}

impl PoolList for FactoryPool {
    fn collect(&self) -> Result<()> {
        let collected = {
            let mut state = self.state.acquire()?;
            let n = state.free.len();
            state.allocated -= n;
            state.free.clear();
            n
        };
        if collected > 0 {
            factory_class().note_reclaimed(collected * self.size);
            observability::record_gc_pass("factory");
            tracing::trace!(
                block_size = self.size,
                blocks = collected,
                "collected factory free list"
            );
        }
        Ok(())
    }

    fn allocated_bytes(&self) -> Result<usize> {
        let state = self.state.acquire()?;
        Ok(state.allocated * self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::reset_pool_limits;

    #[test]
    fn test_factory_recycles_fixed_size() {
        reset_pool_limits();
        let factory = FactoryPool::new(256).unwrap();
        assert_eq!(factory.block_size(), 256);

        let block = factory.alloc().unwrap();
        assert_eq!(block.len(), 256);
        factory.free(block).unwrap();
        assert_eq!(factory.stats().unwrap().on_free_list, 1);

        let _block = factory.alloc().unwrap();
        let stats = factory.stats().unwrap();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.on_free_list, 0);
    }

    #[test]
    fn test_independent_factories() {
        reset_pool_limits();
        let small = FactoryPool::new(64).unwrap();
        let large = FactoryPool::new(4096).unwrap();

        let a = small.alloc().unwrap();
        let b = large.alloc().unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(b.len(), 4096);
        small.free(a).unwrap();
        large.free(b).unwrap();

        assert_eq!(small.stats().unwrap().on_free_list, 1);
        assert_eq!(large.stats().unwrap().on_free_list, 1);
    }

    #[test]
    fn test_destroy_clean_factory() {
        reset_pool_limits();
        let factory = FactoryPool::new(128).unwrap();
        let block = factory.alloc().unwrap();
        factory.free(block).unwrap();
        factory.destroy().unwrap();
    }

    #[test]
    fn test_destroy_with_outstanding_blocks_fails() {
        reset_pool_limits();
        let factory = FactoryPool::new(128).unwrap();
        let block = factory.alloc().unwrap();

        let result = Arc::clone(&factory).destroy();
        assert!(result.is_err());

        factory.free(block).unwrap();
        factory.destroy().unwrap();
    }

    #[test]
    fn test_zeroed_alloc_after_dirty_free() {
        reset_pool_limits();
        let factory = FactoryPool::new(32).unwrap();
        let mut block = factory.alloc().unwrap();
        block.fill(0x5A);
        factory.free(block).unwrap();
        let block = factory.alloc_zeroed().unwrap();
        assert!(block.iter().all(|&b| b == 0));
        factory.free(block).unwrap();
    }
}
