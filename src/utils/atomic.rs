use crate::utils::sync::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

#[cfg(feature = "memory-validation")]
use std::{cell::RefCell, collections::HashSet};

#[cfg(feature = "memory-validation")]
thread_local! {
    static ATOMIC_LOCATIONS: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
    static NON_ATOMIC_LOCATIONS: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

#[cfg(feature = "memory-validation")]
pub fn validate_atomic_access(ptr: *const u8, is_atomic: bool) {
    let addr = ptr as usize;
    let (seen, mine) = if is_atomic {
        (&NON_ATOMIC_LOCATIONS, &ATOMIC_LOCATIONS)
    } else {
        (&ATOMIC_LOCATIONS, &NON_ATOMIC_LOCATIONS)
    };
    seen.with(|locations| {
        if locations.borrow().contains(&addr) {
            tracing::warn!(
                "Mixed atomic and non-atomic access to the same location detected: {:#x}",
                addr
            );
        }
    });
    mine.with(|locations| {
        locations.borrow_mut().insert(addr);
    });
}

#[cfg(feature = "memory-validation")]
fn validate_ordering(ordering: Ordering, is_load: bool) {
    match (is_load, ordering) {
        (true, Ordering::Release) | (true, Ordering::AcqRel) => {
            panic!("Invalid load ordering: {:?}", ordering);
        }
        (false, Ordering::Acquire) | (false, Ordering::AcqRel) => {
            panic!("Invalid store ordering: {:?}", ordering);
        }
        _ => {}
    }
}

#[cfg(not(feature = "memory-validation"))]
#[inline(always)]
pub fn validate_atomic_access(_ptr: *const u8, _is_atomic: bool) {}

#[cfg(not(feature = "memory-validation"))]
#[inline(always)]
fn validate_ordering(_ordering: Ordering, _is_load: bool) {}

/// The strongest ordering a failed compare-exchange may use for its load, given the
/// ordering of the successful read-modify-write.
pub fn failure_ordering(success: Ordering) -> Ordering {
    match success {
        Ordering::Release | Ordering::Relaxed => Ordering::Relaxed,
        Ordering::Acquire | Ordering::AcqRel => Ordering::Acquire,
        _ => Ordering::SeqCst,
    }
}

/// The load half of `ordering`.
pub fn load_ordering(ordering: Ordering) -> Ordering {
    match ordering {
        Ordering::Release => Ordering::Relaxed,
        Ordering::AcqRel => Ordering::Acquire,
        o => o,
    }
}

/// The store half of `ordering`.
pub fn store_ordering(ordering: Ordering) -> Ordering {
    match ordering {
        Ordering::Acquire => Ordering::Relaxed,
        Ordering::AcqRel => Ordering::Release,
        o => o,
    }
}

/// Unified atomic memory access operations.
///
/// This trait provides a consistent interface for atomic operations
/// on raw memory locations, regardless of the underlying type size.
/// Values travel as the low `size` bytes of a `u64`.
pub trait AtomicAccess {
    /// Atomically load a value of the specified size from the pointer.
    ///
    /// # Safety
    /// - `ptr` must be valid and aligned for the operation
    /// - The pointed memory must be valid for reads
    unsafe fn load_atomic(ptr: *const u8, size: usize, ordering: Ordering) -> u64;

    /// Atomically store a value of the specified size to the pointer.
    ///
    /// # Safety
    /// - `ptr` must be valid and aligned for the operation
    /// - The pointed memory must be valid for writes
    unsafe fn store_atomic(ptr: *mut u8, size: usize, value: u64, ordering: Ordering);

    /// Atomically compare and exchange a value of the specified size.
    ///
    /// # Safety
    /// - `ptr` must be valid and aligned for the operation
    /// - The pointed memory must be valid for reads and writes
    unsafe fn compare_exchange_atomic(
        ptr: *mut u8,
        size: usize,
        expected: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u64, u64>;

    /// Like [`AtomicAccess::compare_exchange_atomic`], but allowed to fail even when the
    /// current value matches `expected`.
    ///
    /// # Safety
    /// Same requirements as [`AtomicAccess::compare_exchange_atomic`].
    unsafe fn compare_exchange_weak_atomic(
        ptr: *mut u8,
        size: usize,
        expected: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u64, u64>;

    /// Atomically exchange a value of the specified size.
    ///
    /// # Safety
    /// - `ptr` must be valid and aligned for the operation
    /// - The pointed memory must be valid for reads and writes
    unsafe fn exchange_atomic(ptr: *mut u8, size: usize, new: u64, ordering: Ordering) -> u64;

    /// Atomically replace the value with `update(current)`, returning the previous value.
    ///
    /// # Safety
    /// Same requirements as [`AtomicAccess::compare_exchange_atomic`].
    unsafe fn fetch_update_atomic(
        ptr: *mut u8,
        size: usize,
        ordering: Ordering,
        mut update: impl FnMut(u64) -> u64,
    ) -> u64 {
        let failure = failure_ordering(ordering);
        let mut current = unsafe { Self::load_atomic(ptr, size, failure) };
        loop {
            let next = update(current);
            match unsafe {
                Self::compare_exchange_weak_atomic(ptr, size, current, next, ordering, failure)
            } {
                Ok(previous) => return previous,
                Err(witness) => current = witness,
            }
        }
    }
}

/// Concrete implementation using `AtomicT::from_ptr`
pub struct StandardAtomicAccess;

macro_rules! sized_atomic {
    ($size:expr, $ptr:expr, |$atomic:ident, $ty:ident| $body:expr) => {
        match $size {
            1 => {
                type $ty = u8;
                let $atomic = unsafe { AtomicU8::from_ptr($ptr as *mut u8) };
                $body
            }
            2 => {
                type $ty = u16;
                let $atomic = unsafe { AtomicU16::from_ptr($ptr as *mut u16) };
                $body
            }
            4 => {
                type $ty = u32;
                let $atomic = unsafe { AtomicU32::from_ptr($ptr as *mut u32) };
                $body
            }
            8 => {
                type $ty = u64;
                let $atomic = unsafe { AtomicU64::from_ptr($ptr as *mut u64) };
                $body
            }
            _ => panic!("Unsupported atomic size: {}", $size),
        }
    };
}

impl AtomicAccess for StandardAtomicAccess {
    unsafe fn load_atomic(ptr: *const u8, size: usize, ordering: Ordering) -> u64 {
        validate_atomic_access(ptr, true);
        validate_ordering(ordering, true);
        sized_atomic!(size, ptr, |atomic, T| atomic.load(ordering) as u64)
    }

    unsafe fn store_atomic(ptr: *mut u8, size: usize, value: u64, ordering: Ordering) {
        validate_atomic_access(ptr as *const u8, true);
        validate_ordering(ordering, false);
        sized_atomic!(size, ptr, |atomic, T| atomic.store(value as T, ordering))
    }

    unsafe fn compare_exchange_atomic(
        ptr: *mut u8,
        size: usize,
        expected: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u64, u64> {
        validate_atomic_access(ptr as *const u8, true);
        sized_atomic!(size, ptr, |atomic, T| atomic
            .compare_exchange(expected as T, new as T, success, failure)
            .map(|x| x as u64)
            .map_err(|x| x as u64))
    }

    unsafe fn compare_exchange_weak_atomic(
        ptr: *mut u8,
        size: usize,
        expected: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u64, u64> {
        validate_atomic_access(ptr as *const u8, true);
        sized_atomic!(size, ptr, |atomic, T| atomic
            .compare_exchange_weak(expected as T, new as T, success, failure)
            .map(|x| x as u64)
            .map_err(|x| x as u64))
    }

    unsafe fn exchange_atomic(ptr: *mut u8, size: usize, new: u64, ordering: Ordering) -> u64 {
        validate_atomic_access(ptr as *const u8, true);
        sized_atomic!(size, ptr, |atomic, T| atomic.swap(new as T, ordering) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let mut data = [0u64; 2];
        let ptr = data.as_mut_ptr() as *mut u8;

        unsafe {
            StandardAtomicAccess::store_atomic(ptr, 1, 0xAA, Ordering::SeqCst);
            assert_eq!(
                StandardAtomicAccess::load_atomic(ptr, 1, Ordering::SeqCst),
                0xAA
            );

            StandardAtomicAccess::store_atomic(ptr.add(2), 2, 0xBBCC, Ordering::SeqCst);
            assert_eq!(
                StandardAtomicAccess::load_atomic(ptr.add(2), 2, Ordering::SeqCst),
                0xBBCC
            );

            StandardAtomicAccess::store_atomic(ptr.add(4), 4, 0xDEADBEEF, Ordering::SeqCst);
            assert_eq!(
                StandardAtomicAccess::load_atomic(ptr.add(4), 4, Ordering::SeqCst),
                0xDEADBEEF
            );

            StandardAtomicAccess::store_atomic(ptr.add(8), 8, 0x0123456789ABCDEF, Ordering::SeqCst);
            assert_eq!(
                StandardAtomicAccess::load_atomic(ptr.add(8), 8, Ordering::SeqCst),
                0x0123456789ABCDEF
            );
        }
        assert_eq!(data[1], 0x0123456789ABCDEF);
    }

    #[test]
    fn test_truncates_to_size() {
        let mut val = 0u64;
        let ptr = &mut val as *mut u64 as *mut u8;
        unsafe {
            StandardAtomicAccess::store_atomic(ptr, 4, 0xFFFF_FFFF_1234_5678, Ordering::Relaxed);
            assert_eq!(
                StandardAtomicAccess::load_atomic(ptr, 4, Ordering::Relaxed),
                0x1234_5678
            );
        }
    }

    #[test]
    fn test_compare_exchange() {
        let mut val = 0u64;
        let ptr = &mut val as *mut u64 as *mut u8;
        unsafe {
            assert_eq!(
                StandardAtomicAccess::compare_exchange_atomic(
                    ptr,
                    2,
                    0,
                    7,
                    Ordering::SeqCst,
                    Ordering::SeqCst
                ),
                Ok(0)
            );
            assert_eq!(
                StandardAtomicAccess::compare_exchange_atomic(
                    ptr,
                    2,
                    0,
                    9,
                    Ordering::AcqRel,
                    Ordering::Acquire
                ),
                Err(7)
            );
            assert_eq!(StandardAtomicAccess::exchange_atomic(ptr, 2, 11, Ordering::SeqCst), 7);
        }
    }

    #[test]
    fn test_weak_compare_exchange_converges() {
        let mut val = 5u64;
        let ptr = &mut val as *mut u64 as *mut u8;
        let mut attempts = 0;
        unsafe {
            while StandardAtomicAccess::compare_exchange_weak_atomic(
                ptr,
                8,
                5,
                6,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
            {
                attempts += 1;
                assert!(attempts < 1000);
            }
        }
        assert_eq!(val, 6);
    }

    #[test]
    fn test_fetch_update() {
        let mut val = 40u64;
        let ptr = &mut val as *mut u64 as *mut u8;
        let previous =
            unsafe { StandardAtomicAccess::fetch_update_atomic(ptr, 4, Ordering::SeqCst, |v| v + 2) };
        assert_eq!(previous, 40);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_failure_ordering() {
        assert_eq!(failure_ordering(Ordering::Release), Ordering::Relaxed);
        assert_eq!(failure_ordering(Ordering::AcqRel), Ordering::Acquire);
        assert_eq!(failure_ordering(Ordering::SeqCst), Ordering::SeqCst);
        assert_eq!(load_ordering(Ordering::Release), Ordering::Relaxed);
        assert_eq!(store_ordering(Ordering::Acquire), Ordering::Relaxed);
        assert_eq!(store_ordering(Ordering::SeqCst), Ordering::SeqCst);
    }

    #[test]
    #[cfg(feature = "memory-validation")]
    #[should_panic(expected = "Invalid load ordering")]
    fn test_invalid_load_ordering() {
        let val = 0u64;
        let ptr = &val as *const u64 as *const u8;
        unsafe {
            StandardAtomicAccess::load_atomic(ptr, 8, Ordering::Release);
        }
    }
}
