//! Stack arena for coroutines
//!
//! A [`Memory`] is one contiguous mapping sliced into equally sized blocks.
//! Each block sits above its own `PROT_NONE` guard page, so a stack that
//! overflows faults instead of running into the block below. Blocks are
//! handed out first-fit and tracked in a used bitmap under a lock.
//!
//! ```text
//!   start
//!   | guard | block 0 | guard | block 1 | ... | guard | block n-1 |
//!           ^ base            ^ base                  ^ base     ^ end
//! ```
//! The region itself is only unmapped when the last handle to it is
//! dropped, which the [`Stack`] handles of live coroutines keep from
//! happening early.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix::{map_region, open_range, page_size, unmap_region};
    }
}

use corio_core::{kdebug, kerror, CoError, CoResult, MemoryError};

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One mapped region sliced into `block_count` stacks of `block_size` bytes
pub struct Memory {
    start: NonNull<u8>,
    /// Usable bytes per block, guard excluded
    block_size: usize,
    guard_size: usize,
    block_count: usize,
    /// `true` for every block currently handed out
    blocks: Mutex<Vec<bool>>,
    /// Blocks currently handed out
    ref_count: AtomicUsize,
}

// The region is only touched through block pointers whose ownership is
// tracked by the bitmap.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    /// Map a new region. `block_size` is rounded up to whole pages and every
    /// block gets one extra guard page below it.
    pub fn new(block_size: usize, block_count: usize) -> CoResult<Self> {
        if block_size == 0 || block_count == 0 {
            return Err(CoError::StackTooSmall(block_size));
        }
        let guard_size = page_size();
        let block_size = block_size
            .checked_next_multiple_of(guard_size)
            .ok_or(CoError::Config("stack size overflows usize"))?;
        let size = (block_size + guard_size)
            .checked_mul(block_count)
            .ok_or(CoError::Config("arena size overflows usize"))?;
        let start = map_region(size)?;

        let memory = Self {
            start,
            block_size,
            guard_size,
            block_count,
            blocks: Mutex::new(vec![false; block_count]),
            ref_count: AtomicUsize::new(0),
        };
        for index in 0..block_count {
            // Drop unmaps the whole region on failure
            open_range(memory.block_base(index), block_size)?;
        }
        kdebug!(
            "mapped stack arena {:p}, {} blocks of {} bytes, {} byte guards",
            start.as_ptr(),
            block_count,
            block_size,
            guard_size
        );
        Ok(memory)
    }

    #[inline]
    fn stride(&self) -> usize {
        self.block_size + self.guard_size
    }

    /// Lowest usable address of block `index`
    #[inline]
    fn block_base(&self, index: usize) -> *mut u8 {
        self.start
            .as_ptr()
            .wrapping_add(index * self.stride() + self.guard_size)
    }

    /// Index of the block starting at `ptr`
    fn block_index(&self, ptr: NonNull<u8>) -> Result<usize, MemoryError> {
        if !self.has_block(ptr) {
            return Err(MemoryError::OutOfRange);
        }
        let offset = ptr.as_ptr() as usize - self.start() as usize;
        if offset % self.stride() != self.guard_size {
            return Err(MemoryError::OutOfRange);
        }
        Ok(offset / self.stride())
    }

    /// Take the first free block, or `None` if every block is in use
    pub fn get_block(&self) -> Option<NonNull<u8>> {
        let mut blocks = self.blocks.lock().ok()?;
        let index = blocks.iter().position(|used| !used)?;
        blocks[index] = true;
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        NonNull::new(self.block_base(index))
    }

    /// Give a block back. Pointers that are not a block start of this region
    /// are logged and ignored.
    pub fn back_block(&self, ptr: NonNull<u8>) -> bool {
        let index = match self.block_index(ptr) {
            Ok(index) => index,
            Err(e) => {
                kerror!("back_block: {:p} in arena {:p}: {}", ptr.as_ptr(), self.start.as_ptr(), e);
                return false;
            }
        };
        let Ok(mut blocks) = self.blocks.lock() else {
            return false;
        };
        if !blocks[index] {
            kerror!("back_block: block {} of arena {:p} was not in use", index, self.start.as_ptr());
            return false;
        }
        blocks[index] = false;
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Check whether `ptr` lies inside this region
    pub fn has_block(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        addr >= self.start() as usize && addr < self.end() as usize
    }

    #[inline]
    pub fn start(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    /// One past the last byte of the region
    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.start.as_ptr().wrapping_add(self.stride() * self.block_count)
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Inaccessible bytes below each block
    #[inline]
    pub fn guard_size(&self) -> usize {
        self.guard_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Blocks currently handed out
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Whether another block can be taken
    pub fn has_free_block(&self) -> bool {
        self.ref_count() < self.block_count
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unmap_region(self.start, self.stride() * self.block_count);
    }
}

enum StackOwner {
    /// Block of an arena, returned on drop
    Arena(Arc<Memory>),
    /// Caller-provided memory, left alone on drop
    Borrowed,
}

/// Stack memory owned by exactly one coroutine
pub struct Stack {
    base: NonNull<u8>,
    size: usize,
    owner: StackOwner,
}

unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Take a free block of `memory`
    pub fn from_arena(memory: &Arc<Memory>) -> Option<Stack> {
        let base = memory.get_block()?;
        Some(Stack {
            base,
            size: memory.block_size(),
            owner: StackOwner::Arena(Arc::clone(memory)),
        })
    }

    /// Wrap caller-provided stack memory.
    ///
    /// Fails with [`CoError::NullStack`] on a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `size` bytes for as long
    /// as the returned stack, and any coroutine built on it, is alive.
    pub unsafe fn from_raw(ptr: *mut u8, size: usize) -> CoResult<Stack> {
        let base = NonNull::new(ptr).ok_or(CoError::NullStack)?;
        Ok(Stack {
            base,
            size,
            owner: StackOwner::Borrowed,
        })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Highest address of the stack; stacks grow down from here
    #[inline]
    pub fn top(&self) -> *mut u8 {
        self.base.as_ptr().wrapping_add(self.size)
    }

    /// Arena this stack was carved from, if any
    pub fn memory(&self) -> Option<&Arc<Memory>> {
        match &self.owner {
            StackOwner::Arena(memory) => Some(memory),
            StackOwner::Borrowed => None,
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let StackOwner::Arena(memory) = &self.owner {
            memory.back_block(self.base);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("arena", &self.memory().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corio_core::constants::STACK_ALIGN;

    /// Whether the kernel lets `len` bytes at `ptr` be read
    fn readable(ptr: *const u8, len: usize) -> bool {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // inaccessible source memory fails with EFAULT instead of faulting
        let n = unsafe { libc::write(fds[1], ptr as *const libc::c_void, len) };
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        n == len as isize
    }

    #[test]
    fn test_get_and_back_block() {
        let memory = Memory::new(4096, 4).unwrap();
        let a = memory.get_block().unwrap();
        let b = memory.get_block().unwrap();
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            memory.block_size() + memory.guard_size()
        );
        assert_eq!(memory.ref_count(), 2);

        assert!(memory.back_block(a));
        assert_eq!(memory.ref_count(), 1);

        // first fit: the freed slot is handed out again
        let c = memory.get_block().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_exhaustion() {
        let memory = Memory::new(4096, 2).unwrap();
        assert!(memory.get_block().is_some());
        assert!(memory.get_block().is_some());
        assert!(memory.get_block().is_none());
        assert!(!memory.has_free_block());
    }

    #[test]
    fn test_has_block() {
        let memory = Memory::new(4096, 2).unwrap();
        let block = memory.get_block().unwrap();
        assert!(memory.has_block(block));

        let mut outside = 0u8;
        assert!(!memory.has_block(NonNull::from(&mut outside)));
        assert!(!memory.back_block(NonNull::from(&mut outside)));
        assert_eq!(memory.block_index(NonNull::from(&mut outside)), Err(MemoryError::OutOfRange));

        // inside the region but not a block start
        let inner = NonNull::new(block.as_ptr().wrapping_add(16)).unwrap();
        assert!(memory.has_block(inner));
        assert!(!memory.back_block(inner));
        assert_eq!(memory.ref_count(), 1);
    }

    #[test]
    fn test_guard_page_below_each_block() {
        let memory = Memory::new(64 * 1024, 2).unwrap();
        let s0 = memory.get_block().unwrap().as_ptr();
        let s1 = memory.get_block().unwrap().as_ptr();
        let size = memory.block_size();

        assert!(readable(s0, 1));
        assert!(readable(s0.wrapping_add(size - 1), 1));
        assert!(readable(s1, 1));

        // one byte past the bottom of either stack is guard memory
        assert!(!readable(s1.wrapping_sub(1), 1));
        assert!(!readable(s0.wrapping_sub(1), 1));
        assert!(!readable(memory.start(), 1));

        // the top of stack 0 stays intact when stack 1 fills up
        unsafe {
            s0.add(size - 1).write(0x5A);
            std::ptr::write_bytes(s1, 0xAB, size);
            assert_eq!(s0.add(size - 1).read(), 0x5A);
        }
    }

    #[test]
    fn test_double_back_is_rejected() {
        let memory = Memory::new(4096, 1).unwrap();
        let block = memory.get_block().unwrap();
        assert!(memory.back_block(block));
        assert!(!memory.back_block(block));
        assert_eq!(memory.ref_count(), 0);
    }

    #[test]
    fn test_block_size_rounded() {
        let memory = Memory::new(1000, 2).unwrap();
        assert_eq!(memory.block_size() % STACK_ALIGN, 0);
        assert_eq!(memory.block_size() % memory.guard_size(), 0);
        assert!(memory.block_size() >= 1000);
    }

    #[test]
    fn test_stack_returns_block_on_drop() {
        let memory = Arc::new(Memory::new(8192, 2).unwrap());
        let stack = Stack::from_arena(&memory).unwrap();
        assert_eq!(stack.size(), memory.block_size());
        assert!(stack.size() >= 8192);
        assert_eq!(stack.top() as usize - stack.base() as usize, stack.size());
        assert_eq!(memory.ref_count(), 1);
        drop(stack);
        assert_eq!(memory.ref_count(), 0);
    }

    #[test]
    fn test_null_stack_rejected() {
        let err = unsafe { Stack::from_raw(std::ptr::null_mut(), 4096) }.unwrap_err();
        assert_eq!(err, CoError::NullStack);
    }
}
