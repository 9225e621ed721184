//! Kernel-style leveled logging for corio
//!
//! The macros forward to the [`log`] facade under the `corio` target. Each
//! record is prefixed with the coroutine it was emitted from, and with the
//! message number of the request that coroutine is serving when one is set:
//!
//! ```text
//! [cor 17 msg 000412] read 0 bytes, peer closed
//! ```
//!
//! Nothing is printed until a logger is installed. [`init`] installs a
//! `flexi_logger` backend whose spec comes from `RUST_LOG`, falling back to
//! the level passed in. Without it every macro is a cheap no-op, so a
//! missing logger never takes the runtime down.
//!
//! # Usage
//!
//! ```ignore
//! use corio_core::{kinfo, kdebug, kerror};
//!
//! corio_core::kprint::init("info");
//! kinfo!("reactor {} started", tid);
//! kdebug!("fd {} registered, events {:#x}", fd, events);
//! kerror!("epoll_ctl failed: {}", err);
//! ```

use std::fmt;
use std::sync::{Mutex, Once, OnceLock};

use flexi_logger::{Logger, LoggerHandle};

/// Target used for every record emitted by the macros
pub const TARGET: &str = "corio";

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse a level name or its numeric form ("debug", "4")
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// One label per level
    pub fn label(&self) -> &'static str {
        match self {
            LogLevel::Off => "OFF",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }

    fn to_level(self) -> Option<log::Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(log::Level::Error),
            LogLevel::Warn => Some(log::Level::Warn),
            LogLevel::Info => Some(log::Level::Info),
            LogLevel::Debug => Some(log::Level::Debug),
            LogLevel::Trace => Some(log::Level::Trace),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Record context
// ============================================================================

/// Where a record was emitted from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContext {
    /// Current coroutine id (0 for a scheduler context)
    pub coroutine: u32,
    /// Message number of the request being served, if any
    pub msg_no: Option<String>,
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.msg_no {
            Some(msg) if !msg.is_empty() => write!(f, "[cor {} msg {}]", self.coroutine, msg),
            _ => write!(f, "[cor {}]", self.coroutine),
        }
    }
}

static CONTEXT_PROVIDER: OnceLock<fn() -> LogContext> = OnceLock::new();

/// Register the function that describes the calling coroutine.
///
/// The runtime crate installs this once; later calls are ignored.
pub fn set_context_provider(provider: fn() -> LogContext) {
    let _ = CONTEXT_PROVIDER.set(provider);
}

// ============================================================================
// Backend
// ============================================================================

static INIT: Once = Once::new();
static HANDLE: Mutex<Option<LoggerHandle>> = Mutex::new(None);

/// Install the `flexi_logger` backend.
///
/// `RUST_LOG` wins over `default_spec`. Only the first call has any effect.
pub fn init(default_spec: &str) {
    INIT.call_once(|| {
        let started = Logger::try_with_env_or_str(default_spec)
            .and_then(|logger| logger.format(flexi_logger::detailed_format).start());
        match started {
            Ok(handle) => {
                if let Ok(mut slot) = HANDLE.lock() {
                    *slot = Some(handle);
                }
            }
            Err(e) => eprintln!("corio: failed to start logger: {}", e),
        }
    });
}

/// Check whether a logger has been installed by [`init`]
pub fn is_initialized() -> bool {
    HANDLE.lock().map(|h| h.is_some()).unwrap_or(false)
}

/// Set the maximum level programmatically
pub fn set_log_level(level: LogLevel) {
    log::set_max_level(level.to_filter());
}

/// Check if a level would currently be emitted
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    match level.to_level() {
        Some(lvl) => log::log_enabled!(target: TARGET, lvl),
        None => false,
    }
}

/// Flush whatever the backend buffers
pub fn flush() {
    log::logger().flush();
    if let Ok(slot) = HANDLE.lock() {
        if let Some(handle) = slot.as_ref() {
            handle.flush();
        }
    }
}

/// Log at error level, flush, and terminate the process
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    _klog_impl(LogLevel::Error, args);
    flush();
    eprintln!("corio: fatal: {}", args);
    std::process::exit(1);
}

/// Internal: leveled record with coroutine prefix
#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: fmt::Arguments<'_>) {
    let Some(lvl) = level.to_level() else {
        return;
    };
    if !log::log_enabled!(target: TARGET, lvl) {
        return;
    }
    match CONTEXT_PROVIDER.get() {
        Some(provider) => log::log!(target: TARGET, lvl, "{} {}", provider(), args),
        None => log::log!(target: TARGET, lvl, "{}", args),
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Error level log
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}

/// Log, flush and exit(1)
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {
        $crate::kprint::fatal(format_args!($($arg)*))
    };
}

// ============================================================================
// Tests
// ============================================================================
