//! Per-thread info registry.
//!
//! Every thread that touches the library gets a record holding its unique
//! id, its API-context stack, its diagnostic stack, and its DLFTT counter.
//! Records are reached through a thread-local slot and recycled through a
//! global free list when threads exit; ids are never reused, even for a
//! recycled record.

use crate::observability;
use std::cell::RefCell;
use std::sync::Mutex;

/// One diagnostic entry on a thread's error stack.
///
/// Failure paths in the file and pool layers push these so a caller that
/// receives a failed status can ask what went wrong along the call chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// The operation that pushed the entry.
    pub operation: &'static str,
    /// Human-readable description of the failure.
    pub message: String,
}

/// Per-thread record. All fields are only ever touched by the owning thread;
/// the record itself moves through the shared free list between owners.
struct ThreadRecord {
    id: u64,
    dlftt: u32,
    ctx_stack: Vec<&'static str>,
    diagnostics: Vec<Diagnostic>,
}

impl ThreadRecord {
    fn new() -> Self {
        Self {
            id: 0,
            dlftt: 0,
            ctx_stack: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.id = 0;
        self.dlftt = 0;
        self.ctx_stack.clear();
        self.diagnostics.clear();
    }
}

/// Shared registry state: the free list of parked records and the id source.
struct RegistryShared {
    free: Vec<Box<ThreadRecord>>,
    next_id: u64,
}

static REGISTRY: Mutex<RegistryShared> = Mutex::new(RegistryShared {
    free: Vec::new(),
    next_id: 0,
});

/// Owner of the thread-local slot. Dropping it (at thread exit) parks the
/// record back on the registry's free list.
struct ThreadSlot {
    record: Option<Box<ThreadRecord>>,
}

impl ThreadSlot {
    fn create() -> Self {
        let (recycled, id) = {
            let mut reg = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
            reg.next_id += 1;
            (reg.free.pop(), reg.next_id)
        };
        let mut record = recycled.unwrap_or_else(|| Box::new(ThreadRecord::new()));
        record.reset();
        // Ids stay unique even when the record is recycled.
        record.id = id;
        observability::record_thread_registered();
        Self {
            record: Some(record),
        }
    }
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.reset();
            if let Ok(mut reg) = REGISTRY.lock() {
                reg.free.push(record);
            }
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadSlot>> = const { RefCell::new(None) };
}

fn with_record<R>(f: impl FnOnce(&mut ThreadRecord) -> R) -> R {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let slot = slot.get_or_insert_with(ThreadSlot::create);
        let record = slot
            .record
            .as_mut()
            .expect("thread record taken before thread exit");
        f(record)
    })
}

/// Identifier for the current thread.
///
/// The id satisfies: 0 is reserved, ids are >= 1, an id is constant over a
/// thread's lifetime, and no two threads ever share one within a process.
pub fn thread_id() -> u64 {
    with_record(|r| r.id)
}

/// The current thread's DLFTT ("disable locking for this thread") value.
pub fn dlftt() -> u32 {
    with_record(|r| r.dlftt)
}

/// Overwrite the current thread's DLFTT value.
pub fn set_dlftt(value: u32) {
    with_record(|r| r.dlftt = value);
}

/// Increment the current thread's DLFTT value.
pub fn inc_dlftt() {
    with_record(|r| r.dlftt += 1);
}

/// Decrement the current thread's DLFTT value.
///
/// # Panics
///
/// Debug builds assert the counter is positive; a decrement without a
/// matching increment is a programmer error.
pub fn dec_dlftt() {
    with_record(|r| {
        debug_assert!(r.dlftt > 0, "DLFTT decrement without matching increment");
        r.dlftt = r.dlftt.saturating_sub(1);
    });
}

/// Push an operation name onto the current thread's API-context stack.
pub fn push_context(operation: &'static str) {
    with_record(|r| r.ctx_stack.push(operation));
}

/// Pop the top operation from the current thread's API-context stack.
pub fn pop_context() -> Option<&'static str> {
    with_record(|r| r.ctx_stack.pop())
}

/// Depth of the current thread's API-context stack.
pub fn context_depth() -> usize {
    with_record(|r| r.ctx_stack.len())
}

/// Push a diagnostic entry onto the current thread's error stack.
pub fn push_diagnostic(operation: &'static str, message: impl Into<String>) {
    with_record(|r| {
        r.diagnostics.push(Diagnostic {
            operation,
            message: message.into(),
        })
    });
}

/// Detach and return the current thread's error stack.
pub fn take_diagnostics() -> Vec<Diagnostic> {
    with_record(|r| std::mem::take(&mut r.diagnostics))
}

/// Number of parked records currently on the registry's free list.
pub fn recycled_count() -> usize {
    REGISTRY.lock().unwrap_or_else(|e| e.into_inner()).free.len()
}
