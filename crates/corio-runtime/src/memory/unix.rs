//! Unix backing store for stack arenas using mmap

use corio_core::error::{CoResult, MemoryError};
use std::ptr::NonNull;

/// System page size, the granularity of guard pages
pub(super) fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

/// Reserve `size` bytes of address space with no access.
///
/// Nothing is committed until a range is opened with [`open_range`], and
/// then only the pages actually touched.
pub(super) fn map_region(size: usize) -> CoResult<NonNull<u8>> {
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed.into());
    }
    NonNull::new(base as *mut u8).ok_or_else(|| MemoryError::AllocationFailed.into())
}

/// Make `[start, start + size)` readable and writable. `start` must be page
/// aligned.
pub(super) fn open_range(start: *mut u8, size: usize) -> CoResult<()> {
    let rt = unsafe {
        libc::mprotect(
            start as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rt != 0 {
        return Err(MemoryError::ProtectionFailed.into());
    }
    Ok(())
}

/// Release a region obtained from [`map_region`]
pub(super) fn unmap_region(base: NonNull<u8>, size: usize) {
    unsafe {
        libc::munmap(base.as_ptr() as *mut libc::c_void, size);
    }
}
