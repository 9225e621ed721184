//! Error types for the coroutine runtime

use core::fmt;

/// Result type for runtime operations
pub type CoResult<T> = Result<T, CoError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoError {
    /// Stack memory handed to a coroutine was null
    NullStack,

    /// Requested stack is below the supported minimum
    StackTooSmall(usize),

    /// Operation called from the wrong coroutine context
    WrongContext(&'static str),

    /// Index outside the I/O thread pool
    InvalidIndex(usize),

    /// Invalid configuration value
    Config(&'static str),

    /// Stack memory mapping failed
    MemoryError(MemoryError),

    /// Failed to spawn an OS thread
    SpawnFailed,

    /// OS call failed with this errno
    Os(i32),
}

impl CoError {
    /// Capture the calling thread's current errno
    pub fn last_os_error() -> Self {
        CoError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for CoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoError::NullStack => write!(f, "coroutine stack memory is null"),
            CoError::StackTooSmall(size) => write!(f, "stack size {} too small", size),
            CoError::WrongContext(what) => write!(f, "wrong coroutine context: {}", what),
            CoError::InvalidIndex(i) => write!(f, "io thread index {} out of range", i),
            CoError::Config(msg) => write!(f, "invalid config: {}", msg),
            CoError::MemoryError(e) => write!(f, "memory error: {}", e),
            CoError::SpawnFailed => write!(f, "failed to spawn thread"),
            CoError::Os(errno) => write!(f, "os error: {}", errno),
        }
    }
}

impl std::error::Error for CoError {}

impl From<CoError> for std::io::Error {
    fn from(e: CoError) -> Self {
        match e {
            CoError::Os(errno) => std::io::Error::from_raw_os_error(errno),
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

/// Stack arena errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// Every block of the region is in use
    Exhausted,

    /// Pointer is not a block start of the region
    OutOfRange,

    /// mprotect refused to open a block
    ProtectionFailed,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::Exhausted => write!(f, "no free block"),
            MemoryError::OutOfRange => write!(f, "pointer is not a block of this region"),
            MemoryError::ProtectionFailed => write!(f, "failed to change page protection"),
        }
    }
}

impl From<MemoryError> for CoError {
    fn from(e: MemoryError) -> Self {
        CoError::MemoryError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = CoError::NullStack;
        assert_eq!(format!("{}", e), "coroutine stack memory is null");

        let e = CoError::MemoryError(MemoryError::AllocationFailed);
        assert_eq!(format!("{}", e), "memory error: memory allocation failed");
    }

    #[test]
    fn test_error_conversion() {
        let err: CoError = MemoryError::Exhausted.into();
        assert!(matches!(err, CoError::MemoryError(MemoryError::Exhausted)));
    }

    #[test]
    fn test_into_io_error() {
        let io: std::io::Error = CoError::Os(libc_eagain()).into();
        assert_eq!(io.raw_os_error(), Some(libc_eagain()));

        let io: std::io::Error = CoError::SpawnFailed.into();
        assert_eq!(io.kind(), std::io::ErrorKind::Other);
    }

    // EAGAIN on every Linux target
    fn libc_eagain() -> i32 {
        11
    }
}
