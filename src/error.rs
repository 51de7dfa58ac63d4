//! Error types for the Strata core.

use thiserror::Error;

/// Result type alias using the core's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An OS synchronization primitive could not be created.
    #[error("initialization failed: {0}")]
    Init(String),

    /// A lock acquisition failed (poisoned or otherwise unusable).
    #[error("lock acquisition failed: {0}")]
    Lock(String),

    /// A lock release that the calling thread was not entitled to make.
    #[error("lock release failed: {0}")]
    Unlock(String),

    /// A memory request failed, even after one garbage-collection retry.
    #[error("allocation failed: {0}")]
    AllocFailed(String),

    /// A garbage-collection pass could not complete.
    #[error("garbage collection failed: {0}")]
    Gc(String),

    /// An address or length fell outside the addressable range.
    #[error("address overflow: addr={addr}, size={size}")]
    Overflow {
        /// Offending start address.
        addr: u64,
        /// Offending request length.
        size: u64,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// Advisory file locks are unavailable on this filesystem.
    #[error("advisory file locking is not supported by the filesystem")]
    LockUnsupported,
}
