//! Coroutine identifier type

use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Next id handed out by [`CoroutineId::allocate`]. Zero is reserved.
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Unique identifier for a coroutine.
///
/// Id 0 is reserved for the per-thread scheduler context (the "main"
/// coroutine that runs on the OS thread's own stack). Every other
/// coroutine gets a process-unique id from [`CoroutineId::allocate`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoroutineId(u32);

impl CoroutineId {
    /// Id of the scheduler context on every thread
    pub const MAIN: CoroutineId = CoroutineId(0);

    /// Create an id from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        CoroutineId(id)
    }

    /// Hand out the next process-unique id (never `MAIN`)
    pub fn allocate() -> Self {
        let mut id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            // wrapped around
            id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        }
        CoroutineId(id)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if this is the scheduler context id
    #[inline]
    pub const fn is_main(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for CoroutineId {
    #[inline]
    fn from(id: u32) -> Self {
        CoroutineId(id)
    }
}

impl fmt::Debug for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_main() {
            write!(f, "CoroutineId(MAIN)")
        } else {
            write!(f, "CoroutineId({})", self.0)
        }
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_id() {
        assert!(CoroutineId::MAIN.is_main());
        assert_eq!(CoroutineId::MAIN.as_u32(), 0);
        assert_eq!(format!("{:?}", CoroutineId::MAIN), "CoroutineId(MAIN)");
    }

    #[test]
    fn test_allocate_is_unique() {
        let a = CoroutineId::allocate();
        let b = CoroutineId::allocate();
        assert_ne!(a, b);
        assert!(!a.is_main());
        assert!(!b.is_main());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", CoroutineId::new(42)), "42");
        assert_eq!(format!("{:?}", CoroutineId::new(7)), "CoroutineId(7)");
    }
}
