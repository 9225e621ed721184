//! # corio - coroutines on epoll reactors
//!
//! Write network code as straight-line blocking logic and run it as
//! non-blocking, event-driven I/O.
//!
//! ## Features
//!
//! - **Stackful coroutines**: asymmetric resume/yield through a per-thread
//!   scheduler context, hand-written context switch for x86_64 and aarch64
//! - **Pooled stacks**: warm coroutines on one mmap arena, overflow on demand
//! - **Reactors**: one epoll loop per thread; cross-thread registration and
//!   tasks go through a locked pending area plus an eventfd kick
//! - **Hooks**: `read`, `write`, `accept`, `connect`, `sleep` suspend the
//!   calling coroutine instead of blocking (optionally interposed on libc)
//! - **Timers**: timerfd deadlines and an idle-connection time wheel
//! - **CoroutineMutex**: FIFO lock that parks instead of blocking
//!
//! ## Quick Start
//!
//! ```ignore
//! use corio::{co_sleep_ms, Runtime, RuntimeConfig};
//!
//! fn main() {
//!     let mut rt = Runtime::new(RuntimeConfig::from_env()).unwrap();
//!     rt.start();
//!     rt.spawn(|| {
//!         co_sleep_ms(100);
//!         corio::kinfo!("woke up");
//!     })
//!     .unwrap();
//!     std::thread::sleep(std::time::Duration::from_millis(200));
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   accepting reactor (main thread)          io threads (working reactors)
//!  ┌─────────────────────────────┐        ┌──────────┐ ┌──────────┐
//!  │ epoll: listen fd, timerfd   │        │  epoll   │ │  epoll   │
//!  │ resumes parked coroutines   │        │  loop    │ │  loop    │
//!  └──────────────┬──────────────┘        └────┬─────┘ └────┬─────┘
//!                 │ add_coroutine / add_task    │            │
//!                 └──────────────►──────────────┴──── CoroutineTaskQueue
//!                                                (ready fd events, shared)
//! ```

// Re-export core types
pub use corio_core::{CoError, CoResult, CoroutineId, CoroutineState, IoEvent, MemoryError, ReactorType};

// Re-export kprint macros
pub use corio_core::{kdebug, kerror, kfatal, kinfo, ktrace, kwarn};
pub use corio_core::kprint::{self, set_log_level, LogLevel};

// Re-export env utilities
pub use corio_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use corio_runtime::{
    co_accept, co_connect, co_connect_timeout, co_read, co_sleep, co_sleep_ms, co_write,
    get_coroutine_pool, get_current_coroutine, get_current_run_time, get_main_coroutine,
    is_hook_enabled, is_main_coroutine, resume, set_hook, yield_now, Coroutine, CoroutineMutex,
    CoroutineMutexGuard, CoroutinePool, CoroutineTaskQueue, FdEvent, FdEventContainer, IoThread,
    IoThreadPool, Memory, Reactor, RunTime, RuntimeConfig, Slot, Stack, Task, TimeWheel, Timer,
    TimerEvent,
};
pub use corio_runtime::{config, hook};

use std::sync::Arc;

/// Process-level runtime handle.
///
/// Installs the configuration and logger, applies the hook toggle and owns
/// the pool of working reactors. The accepting reactor is whichever thread
/// calls [`Reactor::get_reactor`] and runs its loop, usually `main`.
pub struct Runtime {
    io_pool: IoThreadPool,
    started: bool,
}

impl Runtime {
    /// Set up the runtime. Threads are spawned but their loops wait for
    /// [`start`](Self::start).
    pub fn new(config: RuntimeConfig) -> CoResult<Self> {
        config.validate()?;
        kprint::init(&config.log_level.label().to_lowercase());
        if config::init_global(config).is_err() {
            kwarn!("runtime config already installed, keeping the existing one");
        }

        let cfg = config::global();
        cfg.print();
        hook::sys::init();
        set_hook(cfg.hook_enabled);

        let io_pool = IoThreadPool::new(cfg.io_threads)?;
        Ok(Self {
            io_pool,
            started: false,
        })
    }

    /// Runtime configured from `COR_*` environment variables
    pub fn from_env() -> CoResult<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    /// Let every io thread enter its event loop
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.io_pool.start();
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn io_pool(&self) -> &IoThreadPool {
        &self.io_pool
    }

    /// Run `f` in a pooled coroutine on one of the io threads
    pub fn spawn<F>(&self, f: F) -> CoResult<Arc<Coroutine>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.io_pool.add_coroutine_to_random_thread(f, true)
    }

    /// Stop and join the io threads
    pub fn shutdown(&mut self) {
        if self.started {
            kinfo!("runtime shutting down");
        }
        self.io_pool.stop();
        self.started = false;
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    #[serial]
    fn test_spawn_runs_on_io_thread() {
        let mut rt = Runtime::new(RuntimeConfig::new().io_threads(2)).unwrap();
        rt.start();
        assert!(rt.is_started());

        let (tx, rx) = mpsc::channel();
        rt.spawn(move || {
            co_sleep_ms(5);
            tx.send(std::thread::current().name().map(str::to_owned)).unwrap();
        })
        .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("corio-io-"));
        rt.shutdown();
        assert!(!rt.is_started());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(Runtime::new(RuntimeConfig::new().pool_size(0)).is_err());
    }
}
