//! The real blocking primitives
//!
//! Resolved once with `dlsym(RTLD_NEXT, ..)` so they skip any interposed
//! symbol of the same name in the executable. If the lookup fails the raw
//! syscall is used instead. Everything inside the runtime (eventfd and
//! timerfd draining, wakeups) goes through here, never through the hooks.

use std::ffi::CStr;
use std::sync::OnceLock;

use libc::{c_int, c_uint, c_void, size_t, sockaddr, socklen_t, ssize_t};

type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
type AcceptFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
type SleepFn = unsafe extern "C" fn(c_uint) -> c_uint;

struct RealFns {
    read: Option<ReadFn>,
    write: Option<WriteFn>,
    accept: Option<AcceptFn>,
    connect: Option<ConnectFn>,
    sleep: Option<SleepFn>,
}

static REAL: OnceLock<RealFns> = OnceLock::new();

macro_rules! resolve {
    ($name:literal, $ty:ty) => {{
        let sym: &CStr = $name;
        let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, sym.as_ptr()) };
        if ptr.is_null() {
            None
        } else {
            // dlsym hands back the address of a function with this signature
            Some(unsafe { std::mem::transmute::<*mut c_void, $ty>(ptr) })
        }
    }};
}

fn real() -> &'static RealFns {
    REAL.get_or_init(|| RealFns {
        read: resolve!(c"read", ReadFn),
        write: resolve!(c"write", WriteFn),
        accept: resolve!(c"accept", AcceptFn),
        connect: resolve!(c"connect", ConnectFn),
        sleep: resolve!(c"sleep", SleepFn),
    })
}

/// Resolve every real primitive now instead of on first use
pub fn init() {
    real();
}

/// # Safety
/// Same contract as `read(2)`.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    match real().read {
        Some(f) => f(fd, buf, count),
        None => libc::syscall(libc::SYS_read, fd, buf, count) as ssize_t,
    }
}

/// # Safety
/// Same contract as `write(2)`.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    match real().write {
        Some(f) => f(fd, buf, count),
        None => libc::syscall(libc::SYS_write, fd, buf, count) as ssize_t,
    }
}

/// # Safety
/// Same contract as `accept(2)`.
pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    match real().accept {
        Some(f) => f(fd, addr, len),
        None => libc::syscall(libc::SYS_accept, fd, addr, len) as c_int,
    }
}

/// # Safety
/// Same contract as `connect(2)`.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    match real().connect {
        Some(f) => f(fd, addr, len),
        None => libc::syscall(libc::SYS_connect, fd, addr, len) as c_int,
    }
}

/// Block the OS thread for `seconds`, returning the unslept remainder
pub fn sleep(seconds: c_uint) -> c_uint {
    match real().sleep {
        Some(f) => unsafe { f(seconds) },
        None => {
            std::thread::sleep(std::time::Duration::from_secs(seconds as u64));
            0
        }
    }
}

// ============================================================================
// errno
// ============================================================================

#[inline]
pub fn errno() -> i32 {
    nix::errno::Errno::last() as i32
}

#[inline]
pub fn set_errno(value: i32) {
    unsafe { *libc::__errno_location() = value };
}

/// EAGAIN-class failure that warrants suspend-and-retry
#[inline]
pub fn would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}
