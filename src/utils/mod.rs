//! Utility types and functions used throughout the codebase.
use std::{
    fmt::{Debug, Formatter},
    mem::align_of,
};

pub mod atomic;
pub mod newtypes;
pub mod sync;

pub use newtypes::ByteOffset;

pub struct DebugStr(pub String);

impl Debug for DebugStr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn is_ptr_aligned_to_field(ptr: *const u8, field_size: usize) -> bool {
    match field_size {
        1 => true,
        2 => (ptr as usize) % align_of::<u16>() == 0,
        4 => (ptr as usize) % align_of::<u32>() == 0,
        8 => (ptr as usize) % align_of::<u64>() == 0,
        _ => (ptr as usize) % field_size == 0,
    }
}

pub const fn align_up(value: usize, align: usize) -> usize {
    let misalignment = value % align;
    if misalignment == 0 {
        value
    } else {
        value + align - misalignment
    }
}
