//! C-ABI exports over the process-wide heap.
//!
//! Gated behind `features = ["ffi"]`. Every function forwards to
//! [`global()`](crate::global); failures of the plain entry points abort,
//! `tcalloc_try_malloc` reports them as null.

use crate::allocator::{self, Statistics, global};
use crate::error::{AllocError, HeapViolation, fatal};
use core::ptr;

#[unsafe(no_mangle)]
pub extern "C" fn tcalloc_malloc(size: usize) -> *mut u8 {
    global().allocate(size).as_ptr()
}

#[unsafe(no_mangle)]
pub extern "C" fn tcalloc_try_malloc(size: usize) -> *mut u8 {
    global()
        .try_allocate(size)
        .map_or(ptr::null_mut(), |p| p.as_ptr())
}

#[unsafe(no_mangle)]
pub extern "C" fn tcalloc_calloc(count: usize, size: usize) -> *mut u8 {
    match global().try_allocate_array(count, size) {
        Ok(p) => p.as_ptr(),
        // Overflow is the caller's problem, not an exhausted heap.
        Err(AllocError::SizeOverflow { .. }) => ptr::null_mut(),
        Err(e) => fatal(HeapViolation::Exhausted(e)),
    }
}

/// # Safety
///
/// `ptr` must be null or a live block from this heap.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tcalloc_realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    unsafe { global().reallocate(ptr, new_size) }
}

/// # Safety
///
/// `ptr` must be null or a live block from this heap.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tcalloc_free(ptr: *mut u8) {
    unsafe { global().free(ptr) }
}

#[unsafe(no_mangle)]
pub extern "C" fn tcalloc_malloc_size(ptr: *const u8) -> usize {
    global().usable_size(ptr)
}

#[unsafe(no_mangle)]
pub extern "C" fn tcalloc_good_size(size: usize) -> usize {
    global().good_size(size)
}

#[unsafe(no_mangle)]
pub extern "C" fn tcalloc_release_free_memory() {
    global().release_free_memory();
}

/// # Safety
///
/// `out` must be valid for one write of `Statistics`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tcalloc_statistics(out: *mut Statistics) {
    if out.is_null() {
        return;
    }
    unsafe { out.write(global().statistics()) };
}

#[unsafe(no_mangle)]
pub extern "C" fn tcalloc_forbid() {
    allocator::forbid();
}

#[unsafe(no_mangle)]
pub extern "C" fn tcalloc_allow() {
    allocator::allow();
}

#[unsafe(no_mangle)]
pub extern "C" fn tcalloc_thread_exit() {
    global().thread_exit();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_entry_points() {
        let p = tcalloc_malloc(100);
        assert!(!p.is_null());
        assert_eq!(tcalloc_malloc_size(p), tcalloc_good_size(100));

        let q = unsafe { tcalloc_realloc(p, 5000) };
        assert!(tcalloc_malloc_size(q) >= 5000);
        unsafe { tcalloc_free(q) };

        let z = tcalloc_calloc(16, 16);
        assert!(unsafe { core::slice::from_raw_parts(z, 256) }.iter().all(|&b| b == 0));
        unsafe { tcalloc_free(z) };
        assert!(tcalloc_calloc(usize::MAX, 2).is_null());

        let mut stats = Statistics::default();
        unsafe { tcalloc_statistics(&mut stats) };
        assert!(stats.reserved_bytes >= stats.committed_bytes);
        tcalloc_thread_exit();
    }
}
