//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on [`RuntimeConfig`]
//! 2. Environment variables (`COR_*`)
//! 3. User's config file passed at build time via `COR_CONFIG_RS`
//! 4. Library defaults
//!
//! The process-wide copy is installed once with [`init_global`] (or lazily
//! from the environment by [`global`]) and never changes afterwards.

pub mod defaults;

use std::sync::OnceLock;
use std::time::Duration;

use corio_core::constants::MIN_STACK_SIZE;
use corio_core::env::{env_get, env_get_bool};
use corio_core::kprint::LogLevel;
use corio_core::{kinfo, kwarn, CoError, CoResult};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size of every coroutine, bytes
    pub stack_size: usize,
    /// Warm coroutines kept by the process-wide pool
    pub pool_size: usize,
    /// How long a hooked `connect` waits before failing with ETIMEDOUT
    pub connect_timeout: Duration,
    /// Working reactors in the I/O thread pool
    pub io_threads: usize,
    /// Buckets in a connection time wheel
    pub wheel_buckets: usize,
    /// Rotation period of a connection time wheel
    pub wheel_interval: Duration,
    /// Upper bound of one `epoll_wait`
    pub epoll_timeout: Duration,
    /// Initial state of the process-wide hook toggle
    pub hook_enabled: bool,
    /// Default log level when `RUST_LOG` is unset
    pub log_level: LogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `COR_STACK_SIZE` - Coroutine stack size in bytes
    /// - `COR_POOL_SIZE` - Warm coroutines in the pool
    /// - `COR_CONNECT_TIMEOUT_MS` - Hooked connect timeout
    /// - `COR_IO_THREADS` - Working reactor threads
    /// - `COR_WHEEL_BUCKETS` - Time wheel bucket count
    /// - `COR_WHEEL_INTERVAL_S` - Time wheel rotation period in seconds
    /// - `COR_EPOLL_TIMEOUT_MS` - Max blocking time per loop iteration
    /// - `COR_HOOK` - Enable syscall hooks (0/1)
    /// - `COR_LOG_LEVEL` - off, error, warn, info, debug, trace
    pub fn from_env() -> Self {
        let log_level = std::env::var("COR_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::parse(&v))
            .or_else(|| LogLevel::parse(defaults::LOG_LEVEL))
            .unwrap_or(LogLevel::Info);

        Self {
            stack_size: env_get("COR_STACK_SIZE", defaults::STACK_SIZE),
            pool_size: env_get("COR_POOL_SIZE", defaults::POOL_SIZE),
            connect_timeout: Duration::from_millis(env_get(
                "COR_CONNECT_TIMEOUT_MS",
                defaults::CONNECT_TIMEOUT_MS,
            )),
            io_threads: env_get("COR_IO_THREADS", defaults::IO_THREADS),
            wheel_buckets: env_get("COR_WHEEL_BUCKETS", defaults::WHEEL_BUCKETS),
            wheel_interval: Duration::from_secs(env_get(
                "COR_WHEEL_INTERVAL_S",
                defaults::WHEEL_INTERVAL_S,
            )),
            epoll_timeout: Duration::from_millis(
                env_get("COR_EPOLL_TIMEOUT_MS", defaults::EPOLL_TIMEOUT_MS).max(0) as u64,
            ),
            hook_enabled: env_get_bool("COR_HOOK", defaults::HOOK_ENABLED),
            log_level,
        }
    }

    /// Create config from compile-time defaults only (no env override).
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            pool_size: defaults::POOL_SIZE,
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            io_threads: defaults::IO_THREADS,
            wheel_buckets: defaults::WHEEL_BUCKETS,
            wheel_interval: Duration::from_secs(defaults::WHEEL_INTERVAL_S),
            epoll_timeout: Duration::from_millis(defaults::EPOLL_TIMEOUT_MS.max(0) as u64),
            hook_enabled: defaults::HOOK_ENABLED,
            log_level: LogLevel::parse(defaults::LOG_LEVEL).unwrap_or(LogLevel::Info),
        }
    }

    // Builder methods

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn io_threads(mut self, n: usize) -> Self {
        self.io_threads = n;
        self
    }

    pub fn wheel_buckets(mut self, n: usize) -> Self {
        self.wheel_buckets = n;
        self
    }

    pub fn wheel_interval(mut self, d: Duration) -> Self {
        self.wheel_interval = d;
        self
    }

    pub fn epoll_timeout(mut self, d: Duration) -> Self {
        self.epoll_timeout = d;
        self
    }

    pub fn hook_enabled(mut self, enable: bool) -> Self {
        self.hook_enabled = enable;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// `epoll_wait` timeout in the form the syscall takes
    pub fn epoll_timeout_ms(&self) -> i32 {
        self.epoll_timeout.as_millis().min(i32::MAX as u128) as i32
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> CoResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(CoError::Config("stack_size must be >= 16KB"));
        }
        if self.pool_size == 0 {
            return Err(CoError::Config("pool_size must be > 0"));
        }
        if self.io_threads == 0 {
            return Err(CoError::Config("io_threads must be > 0"));
        }
        if self.wheel_buckets == 0 {
            return Err(CoError::Config("wheel_buckets must be > 0"));
        }
        if self.wheel_interval.is_zero() {
            return Err(CoError::Config("wheel_interval must be > 0"));
        }
        Ok(())
    }

    /// Log configuration at info level
    pub fn print(&self) {
        kinfo!("corio configuration:");
        kinfo!("  stack_size:       {}", self.stack_size);
        kinfo!("  pool_size:        {}", self.pool_size);
        kinfo!("  connect_timeout:  {:?}", self.connect_timeout);
        kinfo!("  io_threads:       {}", self.io_threads);
        kinfo!("  wheel_buckets:    {}", self.wheel_buckets);
        kinfo!("  wheel_interval:   {:?}", self.wheel_interval);
        kinfo!("  epoll_timeout:    {:?}", self.epoll_timeout);
        kinfo!("  hook_enabled:     {}", self.hook_enabled);
        kinfo!("  log_level:        {}", self.log_level);
    }
}

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

/// Install the process-wide configuration.
///
/// Fails if the config is invalid or a configuration is already in place.
pub fn init_global(config: RuntimeConfig) -> CoResult<()> {
    config.validate()?;
    GLOBAL
        .set(config)
        .map_err(|_| CoError::Config("runtime config already initialized"))
}

/// The process-wide configuration, built from the environment on first use.
pub fn global() -> &'static RuntimeConfig {
    GLOBAL.get_or_init(|| {
        let config = RuntimeConfig::from_env();
        match config.validate() {
            Ok(()) => config,
            Err(e) => {
                kwarn!("{}, falling back to built-in defaults", e);
                RuntimeConfig::new()
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.stack_size, defaults::STACK_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_millis(defaults::CONNECT_TIMEOUT_MS));
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .pool_size(2)
            .stack_size(64 * 1024)
            .io_threads(3)
            .wheel_interval(Duration::from_secs(2));

        assert_eq!(config.pool_size, 2);
        assert_eq!(config.stack_size, 64 * 1024);
        assert_eq!(config.io_threads, 3);
        assert_eq!(config.wheel_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new().pool_size(0).validate().is_err());
        assert!(RuntimeConfig::new().io_threads(0).validate().is_err());
        assert!(RuntimeConfig::new().wheel_buckets(0).validate().is_err());
        assert!(RuntimeConfig::new()
            .wheel_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_epoll_timeout_ms() {
        let config = RuntimeConfig::new().epoll_timeout(Duration::from_millis(250));
        assert_eq!(config.epoll_timeout_ms(), 250);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("COR_POOL_SIZE", "17");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("COR_POOL_SIZE");
        assert_eq!(config.pool_size, 17);
    }
}
