//! Basic synchronization primitives.
//!
//! Low-level modules can depend on this without pulling in the entire VM subsystem.
use std::cell::Cell;

pub use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use std::sync::{
    atomic::{fence, AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Cached runtime thread ID for the current thread
    static RUNTIME_THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Get the current thread's runtime ID, assigning one on first use. IDs are never 0.
pub fn get_current_thread_id() -> u64 {
    RUNTIME_THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}
