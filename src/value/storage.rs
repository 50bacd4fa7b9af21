use super::layout::Leaf;
use crate::{
    error::{InvokeError, InvokeResult},
    utils::{
        atomic::{failure_ordering, AtomicAccess, StandardAtomicAccess},
        is_ptr_aligned_to_field,
        sync::{AtomicU64, Ordering},
        ByteOffset,
    },
};
use std::fmt::{self, Debug, Formatter};

/// Word-aligned backing store for fields and array elements.
///
/// Every access is an atomic of the accessed scalar's own width, so racing readers and
/// writers never observe torn scalars. Wider values are either accessed as a single
/// unit of at most 8 bytes or copied leaf by leaf.
pub struct FieldStorage {
    words: Box<[AtomicU64]>,
    size: usize,
}

impl FieldStorage {
    pub fn new(size: usize) -> Self {
        let words = (0..size.div_ceil(8).max(1))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { words, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Address used to pick a lock stripe for compound accesses.
    pub fn address(&self, offset: ByteOffset) -> usize {
        self.words.as_ptr() as usize + offset.as_usize()
    }

    fn location(&self, offset: ByteOffset, width: usize) -> InvokeResult<*mut u8> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(InvokeError::internal(format!(
                "unsupported access width {}",
                width
            )));
        }
        let capacity = self.words.len() * 8;
        match offset.checked_add(width) {
            Some(end) if end.as_usize() <= capacity => {}
            _ => {
                return Err(InvokeError::internal(format!(
                    "access of {} bytes at offset {} outside storage of {} bytes",
                    width, offset, self.size
                )))
            }
        }
        // SAFETY: the range was bounds-checked above.
        let ptr = unsafe { (self.words.as_ptr() as *mut u8).add(offset.as_usize()) };
        if !is_ptr_aligned_to_field(ptr, width) {
            return Err(InvokeError::internal(format!(
                "misaligned {}-byte access at offset {}",
                width, offset
            )));
        }
        Ok(ptr)
    }

    pub fn load(&self, offset: ByteOffset, width: usize, ordering: Ordering) -> InvokeResult<u64> {
        let ptr = self.location(offset, width)?;
        // SAFETY: `location` validated bounds and alignment; the words are atomics.
        Ok(unsafe { StandardAtomicAccess::load_atomic(ptr, width, ordering) })
    }

    pub fn store(
        &self,
        offset: ByteOffset,
        width: usize,
        bits: u64,
        ordering: Ordering,
    ) -> InvokeResult<()> {
        let ptr = self.location(offset, width)?;
        unsafe { StandardAtomicAccess::store_atomic(ptr, width, bits, ordering) };
        Ok(())
    }

    /// Returns `Ok(previous)` on success and `Err(witness)` on failure. A weak exchange
    /// may fail even when the witness equals `expected`.
    pub fn compare_exchange(
        &self,
        offset: ByteOffset,
        width: usize,
        expected: u64,
        new: u64,
        ordering: Ordering,
        weak: bool,
    ) -> InvokeResult<Result<u64, u64>> {
        let ptr = self.location(offset, width)?;
        let failure = failure_ordering(ordering);
        Ok(unsafe {
            if weak {
                StandardAtomicAccess::compare_exchange_weak_atomic(
                    ptr, width, expected, new, ordering, failure,
                )
            } else {
                StandardAtomicAccess::compare_exchange_atomic(
                    ptr, width, expected, new, ordering, failure,
                )
            }
        })
    }

    pub fn swap(
        &self,
        offset: ByteOffset,
        width: usize,
        bits: u64,
        ordering: Ordering,
    ) -> InvokeResult<u64> {
        let ptr = self.location(offset, width)?;
        Ok(unsafe { StandardAtomicAccess::exchange_atomic(ptr, width, bits, ordering) })
    }

    pub fn fetch_update(
        &self,
        offset: ByteOffset,
        width: usize,
        ordering: Ordering,
        update: impl FnMut(u64) -> u64,
    ) -> InvokeResult<u64> {
        let ptr = self.location(offset, width)?;
        Ok(unsafe { StandardAtomicAccess::fetch_update_atomic(ptr, width, ordering, update) })
    }

    /// Copies `leaves` from this storage at `offset` into `dest` at `dest_offset`,
    /// loading with `load` and storing with `store` ordering.
    pub fn copy_leaves(
        &self,
        offset: ByteOffset,
        leaves: &[Leaf],
        dest: &FieldStorage,
        dest_offset: ByteOffset,
        load: Ordering,
        store: Ordering,
    ) -> InvokeResult<()> {
        for leaf in leaves {
            let bits = self.load(offset + leaf.position, leaf.size, load)?;
            dest.store(dest_offset + leaf.position, leaf.size, bits, store)?;
        }
        Ok(())
    }

    /// Whether the leaves at the two locations hold identical bits.
    pub fn leaves_equal(
        &self,
        offset: ByteOffset,
        leaves: &[Leaf],
        other: &FieldStorage,
        other_offset: ByteOffset,
    ) -> InvokeResult<bool> {
        for leaf in leaves {
            let a = self.load(offset + leaf.position, leaf.size, Ordering::Relaxed)?;
            let b = other.load(other_offset + leaf.position, leaf.size, Ordering::Relaxed)?;
            if a != b {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Debug for FieldStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.words
                    .iter()
                    .map(|w| format!("{:#018x}", w.load(Ordering::Relaxed))),
            )
            .finish()
    }
}
