//! # corio-core
//!
//! Core types for the corio coroutine runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, epoll, timerfd and the syscall hooks live in
//! `corio-runtime`.
//!
//! ## Modules
//!
//! - `id` - Coroutine identifier type
//! - `state` - Coroutine lifecycle, reactor role and I/O interest enums
//! - `error` - Error types
//! - `kprint` - Leveled logging macros on top of the `log` facade
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::CoroutineId;
pub use state::{CoroutineState, IoEvent, ReactorType};
pub use error::{CoError, CoResult, MemoryError};
pub use env::{env_get, env_get_bool, env_get_opt};

/// Constants shared by the runtime crates
pub mod constants {
    /// Smallest stack a coroutine may be configured with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Stack alignment required by both supported ABIs
    pub const STACK_ALIGN: usize = 16;

    /// Initial capacity of the process-wide fd registry
    pub const FD_REGISTRY_INITIAL: usize = 1000;

    /// Max events fetched per `epoll_wait`
    pub const MAX_EPOLL_EVENTS: usize = 10;
}
