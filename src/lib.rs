//! # Strata core
//!
//! The concurrency and memory-management core of the Strata scientific data
//! library. Three subsystems live here:
//!
//! - **Thread safety** ([`sync`]): a global API lock that serializes entry
//!   into library operations while supporting recursive re-entry, a
//!   per-thread "disable locking for this thread" (DLFTT) escape for user
//!   callbacks, a recursive reader/writer lock, and the per-thread info
//!   registry behind them.
//! - **Free-list pools** ([`pool`]): four classes of recyclers for small,
//!   same-shaped allocations, with per-list and global memory caps that
//!   trigger opportunistic garbage collection.
//! - **File layer** ([`file`]): a POSIX-like file shim with optional timing
//!   instrumentation, and a memory-resident file with page-tracked dirty
//!   regions and an optional backing store.
//!
//! The subsystems interact: the pools guard their metadata with DLFTT-aware
//! mutexes so they stay callable from user-callback re-entries, and the
//! memory-resident file keeps its dirty-page bookkeeping in the same
//! page-granular terms the flush path consumes.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use strata::prelude::*;
//!
//! strata::init()?;
//!
//! // Serialize a library operation
//! let _guard = ApiLock::global().enter_write("my_operation")?;
//!
//! // Recycle fixed-size blocks
//! let pool = BlockPool::new("chunk-buffers")?;
//! let block = pool.alloc(64 * 1024)?;
//! pool.free(block)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod file;
pub mod observability;
pub mod pool;
pub mod sync;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::file::{CoreConfig, CoreFile, SysFile};
    pub use crate::pool::{ArrayPool, BlockPool, FactoryPool, RegularPool};
    pub use crate::sync::{ApiLock, Barrier, DlfttMutex, ExclusiveLock, RwLock};
}

pub use error::{Error, Result};

/// Initialize the core's process-lifetime state.
///
/// Forces creation of the global API lock, the pool class registries, and the
/// metric descriptions. Everything initialized here is also created lazily on
/// first use, so calling this is optional; it exists so embedders can pay the
/// setup cost at a predictable point and observe initialization failures
/// eagerly.
pub fn init() -> Result<()> {
    sync::ApiLock::global();
    pool::init_classes();
    observability::init_metrics();
    Ok(())
}

/// Garbage collect every free-list pool class.
///
/// This is a library entry point: it enters the global API lock like any
/// other operation, then releases all memory parked on the pools' free lists.
/// Live allocations are never touched.
pub fn garbage_collect() -> Result<()> {
    let _guard = sync::ApiLock::global().enter_write("garbage_collect")?;
    pool::garbage_collect_all()
}
