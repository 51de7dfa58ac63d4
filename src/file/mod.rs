//! File layer: the POSIX shim and the memory-resident file.
//!
//! - [`SysFile`]: a thin wrapper over the OS file primitives with overflow
//!   checking, partial-transfer retries, seek elision for non-positional
//!   backends, advisory locking, and optional per-operation timing.
//! - [`CoreFile`]: an entire file image held in memory, grown in increment
//!   multiples, optionally backed by a real file and flushed through a
//!   page-aligned dirty-region set.
//! - [`RegionIndex`]: the ordered dirty-region index behind the tracking.

pub mod core;
pub mod regions;
pub mod sys;

pub use self::core::{CoreConfig, CoreFile, CoreOpenOptions, DEFAULT_INCREMENT, DEFAULT_PAGE_SIZE};
pub use regions::RegionIndex;
pub use sys::{FileId, OpTiming, SysFile, SysOptions, MAX_ADDR};
