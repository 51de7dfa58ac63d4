//! Observability: metrics and tracing.
//!
//! The core emits structured `tracing` events at load-bearing points (GC
//! passes, file open/close/flush) and a small set of metrics via
//! `metrics-rs`:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `strata_api_lock_attempts` | Counter | Entry attempts on the API lock |
//! | `strata_threads_registered` | Counter | Thread records created |
//! | `strata_pool_freed_bytes` | Gauge | Bytes parked on a class's free lists |
//! | `strata_pool_gc_passes` | Counter | Per-head garbage-collection passes |
//! | `strata_file_bytes_written` | Counter | Bytes written through the file shim |
//! | `strata_file_flush_bytes` | Histogram | Bytes written per core-file flush |
//!
//! Call [`init_metrics`] once at startup to register descriptions; use any
//! `metrics` exporter to collect them.

mod metrics;

pub use metrics::{
    init_metrics, record_api_attempt, record_bytes_written, record_flush_bytes, record_gc_pass,
    record_pool_freed_bytes, record_thread_registered,
};
