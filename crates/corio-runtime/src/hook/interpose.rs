//! C symbol overrides
//!
//! Linked into an executable these shadow libc's `read`, `write`, `accept`,
//! `connect` and `sleep`, so code that knows nothing about coroutines
//! (including `std::net`) suspends instead of blocking. The real functions
//! are still reachable through [`super::sys`], which resolves them with
//! `RTLD_NEXT`.

use libc::{c_int, c_uint, c_void, size_t, sockaddr, socklen_t, ssize_t};

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    super::read(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    super::write(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    super::accept(fd, addr, len)
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    super::connect(fd, addr, len)
}

#[no_mangle]
pub extern "C" fn sleep(seconds: c_uint) -> c_uint {
    super::sleep(seconds)
}
