//! Free-list pools for small, same-shaped allocations.
//!
//! The library allocates and frees the same shapes of memory over and over
//! (metadata records, element-count arrays, chunk buffers), so instead of
//! round-tripping through the system allocator every time, freed blocks are
//! parked on per-shape free lists and handed back out on the next request.
//!
//! Four pool classes share one contract:
//!
//! - [`RegularPool`]: one fixed shape per head (a typed record).
//! - [`ArrayPool`]: arrays of `0..=max` elements, one sublist per count.
//! - [`BlockPool`]: byte blocks keyed by exact size, most-recently-used
//!   size class kept at the head of the lookup queue.
//! - [`FactoryPool`]: a runtime-created head for a caller-chosen fixed
//!   size, independently destroyable.
//!
//! Each class carries a per-list cap and a global cap on parked memory;
//! crossing either triggers a garbage-collection pass that returns parked
//! blocks to the system allocator (live allocations are never touched).
//! When the system allocator itself fails, the pools collect everything
//! once and retry before reporting failure.
//!
//! Head metadata is guarded by DLFTT-aware mutexes so allocation stays safe
//! from user-callback re-entries. Lock order is fixed: a class's list of
//! heads before any individual head, and never a head across a pass that
//! re-enters the list of heads.

pub mod array;
pub mod block;
pub mod factory;
pub mod regular;

pub use array::ArrayPool;
pub use block::BlockPool;
pub use factory::FactoryPool;
pub use regular::RegularPool;

use crate::error::{Error, Result};
use crate::observability;
use crate::sync::DlfttMutex;
use std::alloc::{self, Layout};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{OnceLock, Weak};

/// Default cap on memory parked on each regular free list.
const REGULAR_LIST_LIMIT: usize = 64 * 1024;
/// Default cap on memory parked on all regular free lists.
const REGULAR_GLOBAL_LIMIT: usize = 1024 * 1024;
/// Default cap on memory parked on each array free list.
const ARRAY_LIST_LIMIT: usize = 256 * 1024;
/// Default cap on memory parked on all array free lists.
const ARRAY_GLOBAL_LIMIT: usize = 4 * 1024 * 1024;
/// Default cap on memory parked on each block free list.
const BLOCK_LIST_LIMIT: usize = 1024 * 1024;
/// Default cap on memory parked on all block free lists.
const BLOCK_GLOBAL_LIMIT: usize = 16 * 1024 * 1024;
/// Default cap on memory parked on each factory free list.
const FACTORY_LIST_LIMIT: usize = 1024 * 1024;
/// Default cap on memory parked on all factory free lists.
const FACTORY_GLOBAL_LIMIT: usize = 16 * 1024 * 1024;

/// One pool head, as seen by its class's garbage collector.
pub(crate) trait PoolList: Send + Sync {
    /// Free every block parked on this head's free lists.
    fn collect(&self) -> Result<()>;
    /// Bytes currently allocated through this head (live + parked).
    fn allocated_bytes(&self) -> Result<usize>;
}

/// Class-level bookkeeping: the list of heads, the freed-memory gauge, and
/// the adjustable caps.
pub(crate) struct PoolClass {
    name: &'static str,
    heads: DlfttMutex<Vec<Weak<dyn PoolList>>>,
    freed_bytes: AtomicUsize,
    list_limit: AtomicUsize,
    global_limit: AtomicUsize,
}

impl PoolClass {
    fn new(name: &'static str, list_limit: usize, global_limit: usize) -> Self {
        Self {
            name,
            heads: DlfttMutex::new(Vec::new()),
            freed_bytes: AtomicUsize::new(0),
            list_limit: AtomicUsize::new(list_limit),
            global_limit: AtomicUsize::new(global_limit),
        }
    }

    /// Link a new head into the class's garbage-collection list.
    pub(crate) fn register(&self, head: Weak<dyn PoolList>) -> Result<()> {
        let mut heads = self.heads.acquire()?;
        heads.retain(|h| h.strong_count() > 0);
        heads.push(head);
        Ok(())
    }

    /// Garbage collect every head in the class.
    pub(crate) fn collect_all(&self) -> Result<()> {
        let mut heads = self.heads.acquire()?;
        heads.retain(|h| h.strong_count() > 0);
        for head in heads.iter() {
            if let Some(head) = head.upgrade() {
                head.collect()
                    .map_err(|e| Error::Gc(format!("{} class: {e}", self.name)))?;
            }
        }
        Ok(())
    }

    /// Total bytes allocated through the class (live + parked).
    pub(crate) fn allocated_bytes_total(&self) -> Result<usize> {
        let heads = self.heads.acquire()?;
        let mut total = 0;
        for head in heads.iter() {
            if let Some(head) = head.upgrade() {
                total += head.allocated_bytes()?;
            }
        }
        Ok(total)
    }

    /// Account bytes newly parked on a free list.
    pub(crate) fn note_freed(&self, bytes: usize) {
        let now = self.freed_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        observability::record_pool_freed_bytes(self.name, now);
    }

    /// Account bytes taken back off a free list (reuse or collection).
    pub(crate) fn note_reclaimed(&self, bytes: usize) {
        let now = self
            .freed_bytes
            .fetch_sub(bytes, Ordering::AcqRel)
            .saturating_sub(bytes);
        observability::record_pool_freed_bytes(self.name, now);
    }

    /// Current value of the class's freed-memory gauge.
    pub(crate) fn freed_bytes(&self) -> usize {
        self.freed_bytes.load(Ordering::Acquire)
    }

    /// The per-list cap.
    pub(crate) fn list_limit(&self) -> usize {
        self.list_limit.load(Ordering::Relaxed)
    }

    /// Whether the class-wide gauge exceeds the global cap.
    pub(crate) fn over_global_limit(&self) -> bool {
        self.freed_bytes() > self.global_limit.load(Ordering::Relaxed)
    }
}

static REGULAR_CLASS: OnceLock<PoolClass> = OnceLock::new();
static ARRAY_CLASS: OnceLock<PoolClass> = OnceLock::new();
static BLOCK_CLASS: OnceLock<PoolClass> = OnceLock::new();
static FACTORY_CLASS: OnceLock<PoolClass> = OnceLock::new();

pub(crate) fn regular_class() -> &'static PoolClass {
    REGULAR_CLASS.get_or_init(|| PoolClass::new("regular", REGULAR_LIST_LIMIT, REGULAR_GLOBAL_LIMIT))
}

pub(crate) fn array_class() -> &'static PoolClass {
    ARRAY_CLASS.get_or_init(|| PoolClass::new("array", ARRAY_LIST_LIMIT, ARRAY_GLOBAL_LIMIT))
}

pub(crate) fn block_class() -> &'static PoolClass {
    BLOCK_CLASS.get_or_init(|| PoolClass::new("block", BLOCK_LIST_LIMIT, BLOCK_GLOBAL_LIMIT))
}

pub(crate) fn factory_class() -> &'static PoolClass {
    FACTORY_CLASS.get_or_init(|| PoolClass::new("factory", FACTORY_LIST_LIMIT, FACTORY_GLOBAL_LIMIT))
}

/// Force creation of the four class registries.
pub(crate) fn init_classes() {
    regular_class();
    array_class();
    block_class();
    factory_class();
}

/// Garbage collect every pool class.
///
/// Walks the classes in a fixed order and frees everything parked on their
/// free lists. Live allocations are never touched. Also the recovery path
/// for a failed system allocation: collect once, retry once.
pub fn garbage_collect_all() -> Result<()> {
    tracing::debug!("garbage collecting all pool classes");
    array_class().collect_all()?;
    block_class().collect_all()?;
    regular_class().collect_all()?;
    factory_class().collect_all()?;
    Ok(())
}

/// Current allocated footprint of each pool class, in bytes.
///
/// Counts live allocations and blocks awaiting garbage collection alike.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolSizes {
    /// Bytes allocated through regular pools.
    pub regular: usize,
    /// Bytes allocated through array pools.
    pub array: usize,
    /// Bytes allocated through block pools.
    pub block: usize,
    /// Bytes allocated through factory pools.
    pub factory: usize,
}

/// Report the allocated footprint of all four classes.
pub fn pool_sizes() -> Result<PoolSizes> {
    Ok(PoolSizes {
        regular: regular_class().allocated_bytes_total()?,
        array: array_class().allocated_bytes_total()?,
        block: block_class().allocated_bytes_total()?,
        factory: factory_class().allocated_bytes_total()?,
    })
}

/// Report each class's freed-memory gauge: the bytes currently parked on
/// free lists and eligible for garbage collection.
pub fn pool_freed_sizes() -> PoolSizes {
    PoolSizes {
        regular: regular_class().freed_bytes(),
        array: array_class().freed_bytes(),
        block: block_class().freed_bytes(),
        factory: factory_class().freed_bytes(),
    }
}

fn store_limit(slot: &AtomicUsize, value: i64) {
    let limit = if value < 0 { usize::MAX } else { value as usize };
    slot.store(limit, Ordering::Relaxed);
}

/// Set the per-class memory caps.
///
/// Arguments come in (global, per-list) pairs for the regular, array, block,
/// and factory classes, in bytes; `-1` means "no cap". Each global cap only
/// applies to its own class, so capping every class at 1 MiB still admits
/// 4 MiB of parked memory in total.
#[allow(clippy::too_many_arguments)]
pub fn set_pool_limits(
    regular_global: i64,
    regular_list: i64,
    array_global: i64,
    array_list: i64,
    block_global: i64,
    block_list: i64,
    factory_global: i64,
    factory_list: i64,
) {
    store_limit(&regular_class().global_limit, regular_global);
    store_limit(&regular_class().list_limit, regular_list);
    store_limit(&array_class().global_limit, array_global);
    store_limit(&array_class().list_limit, array_list);
    store_limit(&block_class().global_limit, block_global);
    store_limit(&block_class().list_limit, block_list);
    store_limit(&factory_class().global_limit, factory_global);
    store_limit(&factory_class().list_limit, factory_list);
}

/// Restore the default caps for every class.
pub fn reset_pool_limits() {
    set_pool_limits(
        REGULAR_GLOBAL_LIMIT as i64,
        REGULAR_LIST_LIMIT as i64,
        ARRAY_GLOBAL_LIMIT as i64,
        ARRAY_LIST_LIMIT as i64,
        BLOCK_GLOBAL_LIMIT as i64,
        BLOCK_LIST_LIMIT as i64,
        FACTORY_GLOBAL_LIMIT as i64,
        FACTORY_LIST_LIMIT as i64,
    );
}

/// Allocate a zero-filled byte block, collecting the pools and retrying
/// once if the system allocator fails.
pub(crate) fn alloc_bytes(size: usize) -> Result<Box<[u8]>> {
    let mut buf: Vec<u8> = Vec::new();
    if buf.try_reserve_exact(size).is_err() {
        garbage_collect_all()?;
        buf.try_reserve_exact(size)
            .map_err(|_| Error::AllocFailed(format!("byte block of {size} bytes")))?;
    }
    buf.resize(size, 0);
    Ok(buf.into_boxed_slice())
}

/// Allocate a default-filled array, collecting the pools and retrying once
/// if the system allocator fails.
pub(crate) fn alloc_array<T: Copy + Default>(nelem: usize) -> Result<Box<[T]>> {
    let mut buf: Vec<T> = Vec::new();
    if buf.try_reserve_exact(nelem).is_err() {
        garbage_collect_all()?;
        buf.try_reserve_exact(nelem)
            .map_err(|_| Error::AllocFailed(format!("array of {nelem} elements")))?;
    }
    buf.resize(nelem, T::default());
    Ok(buf.into_boxed_slice())
}

/// Allocate one uninitialized slot for a `T`, collecting the pools and
/// retrying once if the system allocator fails.
pub(crate) fn alloc_slot<T>() -> Result<Box<MaybeUninit<T>>> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Ok(Box::new(MaybeUninit::uninit()));
    }
    // SAFETY: the layout has non-zero size.
    let mut ptr = unsafe { alloc::alloc(layout) };
    if ptr.is_null() {
        garbage_collect_all()?;
        // SAFETY: as above.
        ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(Error::AllocFailed(format!(
                "record of {} bytes",
                layout.size()
            )));
        }
    }
    // SAFETY: `ptr` was just allocated with the layout of `T`, and
    // `MaybeUninit<T>` shares that layout; the box takes ownership.
    Ok(unsafe { Box::from_raw(ptr.cast::<MaybeUninit<T>>()) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_bytes_zeroed() {
        let block = alloc_bytes(4096).unwrap();
        assert_eq!(block.len(), 4096);
        assert!(block.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_alloc_array_defaults() {
        let arr = alloc_array::<u64>(16).unwrap();
        assert_eq!(arr.len(), 16);
        assert!(arr.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_alloc_slot_zero_sized() {
        let _slot = alloc_slot::<()>().unwrap();
    }

    #[test]
    fn test_limit_store_handles_no_cap() {
        let slot = AtomicUsize::new(0);
        store_limit(&slot, -1);
        assert_eq!(slot.load(Ordering::Relaxed), usize::MAX);
        store_limit(&slot, 4096);
        assert_eq!(slot.load(Ordering::Relaxed), 4096);
    }

    #[test]
    fn test_pool_sizes_reports_all_classes() {
        let sizes = pool_sizes().unwrap();
        // Nothing asserted about magnitude; other tests allocate in
        // parallel. The walk itself must succeed for every class.
        let _ = sizes.regular + sizes.array + sizes.block + sizes.factory;
    }
}
