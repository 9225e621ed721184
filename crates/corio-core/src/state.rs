//! Coroutine state, reactor role and I/O interest types

use core::fmt;

/// Lifecycle of a coroutine.
///
/// ```text
/// Idle --set_callback--> Fresh --resume--> Running <--resume-- Suspended
///                                              |    \--yield--------^
///                                              +--callback returns--> Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoroutineState {
    /// No callback attached yet
    Idle = 0,

    /// Callback attached, never resumed
    Fresh = 1,

    /// Currently executing on some thread
    Running = 2,

    /// Yielded back to a scheduler context
    Suspended = 3,

    /// Callback returned; parked until a new callback is attached
    Terminated = 4,
}

impl CoroutineState {
    /// Whether `resume` may switch into a coroutine in this state
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, CoroutineState::Fresh | CoroutineState::Suspended)
    }
}

impl From<u8> for CoroutineState {
    fn from(v: u8) -> Self {
        match v {
            0 => CoroutineState::Idle,
            1 => CoroutineState::Fresh,
            2 => CoroutineState::Running,
            3 => CoroutineState::Suspended,
            _ => CoroutineState::Terminated,
        }
    }
}

/// Role of a reactor.
///
/// The accepting reactor resumes parked coroutines in place. Working
/// reactors hand ready coroutines to the shared cross-thread queue and
/// drain it at the top of every loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ReactorType {
    Accepting = 0,
    #[default]
    Working = 1,
}

impl From<u8> for ReactorType {
    fn from(v: u8) -> Self {
        match v {
            0 => ReactorType::Accepting,
            _ => ReactorType::Working,
        }
    }
}

impl fmt::Display for ReactorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorType::Accepting => write!(f, "accepting"),
            ReactorType::Working => write!(f, "working"),
        }
    }
}

/// Readiness interest on a descriptor.
///
/// Values match `EPOLLIN` / `EPOLLOUT` so they can be or'ed straight into
/// an epoll event mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IoEvent {
    Read = 0x001,
    Write = 0x004,
}

impl IoEvent {
    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }
}
