//! Thread-safety substrate.
//!
//! Everything the library uses to serialize entry and stay re-entrant:
//!
//! - [`ApiLock`]: the global serialization point for library operations,
//!   with recursive entry, batched hand-off for callback boundaries, and
//!   the per-thread DLFTT ("disable locking for this thread") escape.
//! - [`ExclusiveLock`]: a recursive mutex with batched acquire/release.
//! - [`RwLock`]: a recursive, writer-preferring reader/writer lock with
//!   optional statistics.
//! - [`DlfttMutex`]: a plain mutex that becomes a no-op for threads whose
//!   DLFTT counter is positive; the free-list pools are built on it.
//! - [`Barrier`]: a reusable count-down rendezvous for test orchestration.
//! - [`registry`]: the per-thread info records (unique ids, context stack,
//!   diagnostic stack, DLFTT counter) behind all of the above.

pub mod api;
pub mod barrier;
pub mod dlftt;
pub mod exclusive;
pub mod registry;
pub mod rwlock;

pub use api::{ApiGuard, ApiLock};
pub use barrier::Barrier;
pub use dlftt::{DlfttGuard, DlfttMutex};
pub use exclusive::ExclusiveLock;
pub use registry::Diagnostic;
pub use rwlock::{RwLock, RwLockStats};
