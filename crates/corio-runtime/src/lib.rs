//! # corio-runtime
//!
//! Linux runtime for the corio coroutine library.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Stack arenas (mmap) and the coroutine pool
//! - Per-thread epoll reactors and the fd event registry
//! - timerfd timers and the idle-connection time wheel
//! - Coroutine-aware mutex
//! - Syscall hooks for `read`, `write`, `accept`, `connect` and `sleep`
//! - Working-reactor thread pool

#[cfg(not(target_os = "linux"))]
compile_error!("corio-runtime needs epoll, eventfd and timerfd (Linux only)");

pub mod arch;
pub mod config;
pub mod memory;
pub mod coroutine;
pub mod pool;
pub mod fd_event;
pub mod reactor;
pub mod timer;
pub mod time_wheel;
pub mod mutex;
pub mod hook;
pub mod io_thread;

// Re-exports
pub use config::RuntimeConfig;
pub use coroutine::{
    get_current_coroutine, get_current_run_time, get_main_coroutine, is_main_coroutine, resume,
    yield_now, Coroutine, RunTime,
};
pub use fd_event::{FdEvent, FdEventContainer};
pub use hook::{
    co_accept, co_connect, co_connect_timeout, co_read, co_sleep, co_sleep_ms, co_write,
    is_hook_enabled, set_hook,
};
pub use io_thread::{IoThread, IoThreadPool};
pub use memory::{Memory, Stack};
pub use mutex::{CoroutineMutex, CoroutineMutexGuard};
pub use pool::{get_coroutine_pool, CoroutinePool};
pub use reactor::{CoroutineTaskQueue, Reactor, Task};
pub use time_wheel::{Slot, TimeWheel};
pub use timer::{Timer, TimerEvent};
