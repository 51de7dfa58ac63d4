//! Metrics collection using metrics-rs.

use metrics::Unit;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const API_LOCK_ATTEMPTS: &str = "strata_api_lock_attempts";
const THREADS_REGISTERED: &str = "strata_threads_registered";
const POOL_FREED_BYTES: &str = "strata_pool_freed_bytes";
const POOL_GC_PASSES: &str = "strata_pool_gc_passes";
const FILE_BYTES_WRITTEN: &str = "strata_file_bytes_written";
const FILE_FLUSH_BYTES: &str = "strata_file_flush_bytes";

/// Initialize metric descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_counter!(
        API_LOCK_ATTEMPTS,
        Unit::Count,
        "Total number of entry attempts on the global API lock"
    );
    metrics::describe_counter!(
        THREADS_REGISTERED,
        Unit::Count,
        "Total number of per-thread info records created"
    );
    metrics::describe_gauge!(
        POOL_FREED_BYTES,
        Unit::Bytes,
        "Bytes currently parked on a pool class's free lists"
    );
    metrics::describe_counter!(
        POOL_GC_PASSES,
        Unit::Count,
        "Garbage-collection passes run over individual pool heads"
    );
    metrics::describe_counter!(
        FILE_BYTES_WRITTEN,
        Unit::Bytes,
        "Total bytes written through the POSIX file shim"
    );
    metrics::describe_histogram!(
        FILE_FLUSH_BYTES,
        Unit::Bytes,
        "Bytes written per memory-resident file flush"
    );
}

/// Record one entry attempt on the API lock.
#[inline]
pub fn record_api_attempt() {
    metrics::counter!(API_LOCK_ATTEMPTS).increment(1);
}

/// Record the creation of a per-thread info record.
#[inline]
pub fn record_thread_registered() {
    metrics::counter!(THREADS_REGISTERED).increment(1);
}

/// Record the current freed-bytes gauge for a pool class.
#[inline]
pub fn record_pool_freed_bytes(class: &'static str, bytes: usize) {
    metrics::gauge!(POOL_FREED_BYTES, "class" => class).set(bytes as f64);
}

/// Record a garbage-collection pass over one pool head.
#[inline]
pub fn record_gc_pass(class: &'static str) {
    metrics::counter!(POOL_GC_PASSES, "class" => class).increment(1);
}

/// Record bytes written through the file shim.
#[inline]
pub fn record_bytes_written(bytes: u64) {
    metrics::counter!(FILE_BYTES_WRITTEN).increment(bytes);
}

/// Record the size of one core-file flush.
#[inline]
pub fn record_flush_bytes(bytes: u64) {
    metrics::histogram!(FILE_FLUSH_BYTES).record(bytes as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_recorders_do_not_panic_without_exporter() {
        record_api_attempt();
        record_thread_registered();
        record_pool_freed_bytes("regular", 4096);
        record_gc_pass("block");
        record_bytes_written(512);
        record_flush_bytes(8192);
    }
}
