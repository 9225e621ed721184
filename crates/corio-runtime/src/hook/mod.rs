//! Coroutine-aware blocking primitives
//!
//! `read`, `write`, `accept`, `connect` and `sleep` look blocking to the
//! caller. Called from the scheduler context they go straight to the real
//! primitive. Called from a worker coroutine they run non-blocking, and on
//! `EAGAIN` the coroutine parks on the descriptor's [`FdEvent`] and yields;
//! once the reactor sees readiness it is resumed and the primitive is
//! retried exactly once.
//!
//! Three layers:
//!
//! - `*_hook` functions always take the coroutine-aware path
//! - [`read`], [`write`], [`accept`], [`connect`], [`sleep`] dispatch on the
//!   process-wide toggle ([`set_hook`])
//! - `co_*` wrappers return `io::Result` for Rust callers
//!
//! With the `interpose` feature the dispatching functions are also exported
//! as the C symbols of the same name.
//!
//! [`FdEvent`]: crate::fd_event::FdEvent

pub mod sys;

#[cfg(feature = "interpose")]
mod interpose;

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libc::{c_int, c_uint, c_void, size_t, sockaddr, socklen_t, ssize_t};

use corio_core::{kdebug, kerror, ktrace, kwarn, CoError, IoEvent};

use crate::config;
use crate::coroutine;
use crate::fd_event::{FdEvent, FdEventContainer};
use crate::reactor::Reactor;
use crate::timer::TimerEvent;

static HOOK_ENABLED: AtomicBool = AtomicBool::new(true);

/// Turn interception on or off for the whole process
pub fn set_hook(enable: bool) {
    HOOK_ENABLED.store(enable, Ordering::Release);
    kdebug!("syscall hooks {}", if enable { "enabled" } else { "disabled" });
}

#[inline]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.load(Ordering::Acquire)
}

fn os_errno(e: &CoError) -> i32 {
    match e {
        CoError::Os(errno) => *errno,
        _ => libc::EIO,
    }
}

/// Bind `fd` to the calling thread's reactor in non-blocking mode
fn prepare_fd(fd: RawFd) -> Option<(Arc<FdEvent>, Arc<Reactor>)> {
    let fd_event = FdEventContainer::global().get_fd_event(fd)?;
    let reactor = Reactor::get_reactor();
    fd_event.set_reactor(Some(&reactor));
    if let Err(e) = fd_event.set_non_block() {
        kdebug!("fd {}: cannot switch to non-blocking: {}", fd, e);
        return None;
    }
    Some((fd_event, reactor))
}

/// Park the current coroutine on `fd_event` for `event` and yield.
/// Returns `false` if the interest could not be armed.
fn park_on(fd_event: &FdEvent, event: IoEvent) -> bool {
    fd_event.set_coroutine(coroutine::get_current_coroutine());
    if let Err(e) = fd_event.add_listen_events(event) {
        fd_event.clear_coroutine();
        kerror!("fd {}: cannot listen for {:?}: {}", fd_event.fd(), event, e);
        sys::set_errno(os_errno(&e));
        return false;
    }
    coroutine::yield_now();
    if let Err(e) = fd_event.del_listen_events(event) {
        kwarn!("fd {}: cannot drop {:?} interest: {}", fd_event.fd(), event, e);
    }
    fd_event.clear_coroutine();
    true
}

fn io_hook<F>(fd: RawFd, event: IoEvent, name: &str, mut op: F) -> isize
where
    F: FnMut() -> isize,
{
    if coroutine::is_main_coroutine() {
        return op();
    }
    let Some((fd_event, _)) = prepare_fd(fd) else {
        return op();
    };

    let n = op();
    if n >= 0 || !sys::would_block(sys::errno()) {
        return n;
    }

    ktrace!("{} on fd {} would block, suspending", name, fd);
    if !park_on(&fd_event, event) {
        return -1;
    }
    op()
}

// ============================================================================
// Hooked variants
// ============================================================================

/// # Safety
/// Same contract as `read(2)`.
pub unsafe fn read_hook(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    io_hook(fd, IoEvent::Read, "read", || sys::read(fd, buf, count))
}

/// # Safety
/// Same contract as `write(2)`.
pub unsafe fn write_hook(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    io_hook(fd, IoEvent::Write, "write", || sys::write(fd, buf, count))
}

/// # Safety
/// Same contract as `accept(2)`.
pub unsafe fn accept_hook(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    io_hook(fd, IoEvent::Read, "accept", || sys::accept(fd, addr, len) as isize) as c_int
}

/// Non-blocking connect bounded by the configured connection timeout.
///
/// # Safety
/// Same contract as `connect(2)`.
pub unsafe fn connect_hook(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, len, config::global().connect_timeout)
}

/// Connect, giving up with `ETIMEDOUT` once `timeout` passes without the
/// handshake completing.
unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    len: socklen_t,
    timeout: Duration,
) -> c_int {
    if coroutine::is_main_coroutine() {
        return sys::connect(fd, addr, len);
    }
    let Some((fd_event, reactor)) = prepare_fd(fd) else {
        return sys::connect(fd, addr, len);
    };

    let n = sys::connect(fd, addr, len);
    if n == 0 {
        return 0;
    }
    if sys::errno() != libc::EINPROGRESS {
        return n;
    }

    let timed_out = Arc::new(AtomicBool::new(false));
    let timeout_ms = timeout.as_millis() as i64;
    let timer_event = {
        let timed_out = Arc::clone(&timed_out);
        let fd_event = Arc::clone(&fd_event);
        TimerEvent::new(timeout_ms, false, move || {
            // readiness may have claimed the coroutine first
            if let Some(cor) = fd_event.take_coroutine() {
                timed_out.store(true, Ordering::Release);
                coroutine::resume(&cor);
            }
        })
    };
    let timer = reactor.get_timer();
    timer.add_timer_event(Arc::clone(&timer_event), true);

    ktrace!("connect on fd {} in progress, timeout {}ms", fd, timeout_ms);
    let parked = park_on(&fd_event, IoEvent::Write);
    timer.del_timer_event(&timer_event);
    if !parked {
        return -1;
    }

    let n = sys::connect(fd, addr, len);
    if n == 0 || (n < 0 && sys::errno() == libc::EISCONN) {
        return 0;
    }
    if timed_out.load(Ordering::Acquire) {
        kdebug!("connect on fd {} timed out after {}ms", fd, timeout_ms);
        sys::set_errno(libc::ETIMEDOUT);
    }
    -1
}

/// Suspend the current coroutine for `ms` milliseconds. Blocks the thread
/// when called from the scheduler context.
pub fn sleep_ms(ms: u64) {
    if coroutine::is_main_coroutine() {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    }

    let done = Arc::new(AtomicBool::new(false));
    let cor = coroutine::get_current_coroutine();
    let timer_event = {
        let done = Arc::clone(&done);
        TimerEvent::new(ms as i64, false, move || {
            done.store(true, Ordering::Release);
            coroutine::resume(&cor);
        })
    };
    Reactor::get_reactor()
        .get_timer()
        .add_timer_event(timer_event, true);

    // only the timer may end the sleep
    while !done.load(Ordering::Acquire) {
        coroutine::yield_now();
    }
}

/// `sleep(3)` shaped variant of [`sleep_ms`]
pub fn sleep_hook(seconds: c_uint) -> c_uint {
    if coroutine::is_main_coroutine() {
        return sys::sleep(seconds);
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

// ============================================================================
// Toggle dispatch
// ============================================================================

/// # Safety
/// Same contract as `read(2)`.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    if is_hook_enabled() {
        read_hook(fd, buf, count)
    } else {
        sys::read(fd, buf, count)
    }
}

/// # Safety
/// Same contract as `write(2)`.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    if is_hook_enabled() {
        write_hook(fd, buf, count)
    } else {
        sys::write(fd, buf, count)
    }
}

/// # Safety
/// Same contract as `accept(2)`.
pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    if is_hook_enabled() {
        accept_hook(fd, addr, len)
    } else {
        sys::accept(fd, addr, len)
    }
}

/// # Safety
/// Same contract as `connect(2)`.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    if is_hook_enabled() {
        connect_hook(fd, addr, len)
    } else {
        sys::connect(fd, addr, len)
    }
}

pub fn sleep(seconds: c_uint) -> c_uint {
    if is_hook_enabled() {
        sleep_hook(seconds)
    } else {
        sys::sleep(seconds)
    }
}

// ============================================================================
// io::Result wrappers
// ============================================================================

fn cvt(n: isize) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::from_raw_os_error(sys::errno()))
    } else {
        Ok(n as usize)
    }
}

pub fn co_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt(unsafe { read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) })
}

pub fn co_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt(unsafe { write(fd, buf.as_ptr() as *const c_void, buf.len()) })
}

/// Accept one connection on a listening socket
pub fn co_accept(fd: RawFd) -> io::Result<RawFd> {
    let n = unsafe { accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    cvt(n as isize).map(|fd| fd as RawFd)
}

pub fn co_connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = raw_socket_addr(addr);
    let n = unsafe { connect(fd, &storage as *const _ as *const sockaddr, len) };
    cvt(n as isize).map(|_| ())
}

/// [`co_connect`] with its own deadline instead of the configured one
pub fn co_connect_timeout(fd: RawFd, addr: &SocketAddr, timeout: Duration) -> io::Result<()> {
    let (storage, len) = raw_socket_addr(addr);
    let addr = &storage as *const _ as *const sockaddr;
    let n = unsafe {
        if is_hook_enabled() {
            connect_with_timeout(fd, addr, len, timeout)
        } else {
            sys::connect(fd, addr, len)
        }
    };
    cvt(n as isize).map(|_| ())
}

pub fn co_sleep(duration: Duration) {
    if is_hook_enabled() {
        sleep_ms(duration.as_millis() as u64);
    } else {
        std::thread::sleep(duration);
    }
}

pub fn co_sleep_ms(ms: u64) {
    co_sleep(Duration::from_millis(ms));
}

fn raw_socket_addr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::CoroutinePool;
    use corio_core::{CoroutineState, ReactorType};
    use serial_test::serial;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Instant;

    fn spawn_reactor() -> (Arc<Reactor>, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let reactor = Reactor::get_reactor();
            reactor.set_reactor_type(ReactorType::Accepting);
            tx.send(Arc::clone(&reactor)).unwrap();
            reactor.run_loop();
        });
        (rx.recv().unwrap(), handle)
    }

    fn socket_pair() -> [RawFd; 2] {
        let mut fds = [0; 2];
        let rt = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rt, 0);
        fds
    }

    fn wait_until(mut pred: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_scheduler_context_passes_through() {
        let fds = socket_pair();
        unsafe {
            let flags = libc::fcntl(fds[0], libc::F_GETFL);
            libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        let mut buf = [0u8; 8];
        let err = co_read(fds[0], &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    #[serial]
    fn test_read_suspends_until_readable() {
        set_hook(true);
        let (reactor, handle) = spawn_reactor();
        let pool = CoroutinePool::new(1, 128 * 1024).unwrap();
        let fds = socket_pair();
        let rfd = fds[0];

        let got = Arc::new(Mutex::new(None));
        let resumes = Arc::new(AtomicUsize::new(0));
        let cor = pool.get_coroutine_instance().unwrap();
        {
            let got = got.clone();
            let resumes = resumes.clone();
            cor.set_callback(move || {
                let mut buf = [0u8; 16];
                let r = co_read(rfd, &mut buf).map(|n| buf[..n].to_vec());
                resumes.fetch_add(1, Ordering::SeqCst);
                *got.lock().unwrap() = Some(r);
            });
        }
        reactor.add_coroutine(cor.clone(), true);

        wait_until(|| cor.state() == CoroutineState::Suspended);
        assert!(got.lock().unwrap().is_none());
        assert!(reactor.is_registered(rfd));

        let n = unsafe { sys::write(fds[1], b"hello".as_ptr() as *const c_void, 5) };
        assert_eq!(n, 5);

        wait_until(|| got.lock().unwrap().is_some());
        let data = got.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(resumes.load(Ordering::SeqCst), 1);
        wait_until(|| cor.state() == CoroutineState::Terminated);
        assert!(!reactor.is_registered(rfd));

        reactor.stop();
        handle.join().unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    #[serial]
    fn test_retry_reports_peer_close() {
        set_hook(true);
        let (reactor, handle) = spawn_reactor();
        let pool = CoroutinePool::new(1, 128 * 1024).unwrap();
        let fds = socket_pair();
        let rfd = fds[0];

        let (tx, rx) = mpsc::channel();
        let cor = pool.get_coroutine_instance().unwrap();
        cor.set_callback(move || {
            let mut buf = [0u8; 4];
            tx.send(co_read(rfd, &mut buf).map_err(|e| e.kind())).unwrap();
        });
        reactor.add_coroutine(cor.clone(), true);
        wait_until(|| cor.state() == CoroutineState::Suspended);

        // hangup makes the fd readable with EOF, the single retry returns 0
        unsafe { libc::close(fds[1]) };
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(0));

        reactor.stop();
        handle.join().unwrap();
        unsafe { libc::close(rfd) };
    }

    #[test]
    #[serial]
    fn test_disabled_hook_does_not_suspend() {
        let (reactor, handle) = spawn_reactor();
        let pool = CoroutinePool::new(1, 128 * 1024).unwrap();
        let fds = socket_pair();
        let rfd = fds[0];
        unsafe {
            let flags = libc::fcntl(rfd, libc::F_GETFL);
            libc::fcntl(rfd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        set_hook(false);
        let (tx, rx) = mpsc::channel();
        let cor = pool.get_coroutine_instance().unwrap();
        cor.set_callback(move || {
            let mut buf = [0u8; 4];
            tx.send(co_read(rfd, &mut buf).map_err(|e| e.kind())).unwrap();
        });
        reactor.add_coroutine(cor, true);
        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        set_hook(true);
        assert_eq!(res, Err(io::ErrorKind::WouldBlock));

        reactor.stop();
        handle.join().unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    #[serial]
    fn test_accept_and_connect() {
        set_hook(true);
        let (reactor, handle) = spawn_reactor();
        let pool = CoroutinePool::new(2, 128 * 1024).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let lfd = listener.as_raw_fd();

        let (tx, rx) = mpsc::channel();
        let server = pool.get_coroutine_instance().unwrap();
        {
            let tx = tx.clone();
            server.set_callback(move || {
                let conn = co_accept(lfd).unwrap();
                let mut buf = [0u8; 8];
                let n = co_read(conn, &mut buf).unwrap();
                co_write(conn, &buf[..n]).unwrap();
                tx.send(format!("server {}", n)).unwrap();
                unsafe { libc::close(conn) };
            });
        }
        let client = pool.get_coroutine_instance().unwrap();
        client.set_callback(move || {
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
            co_connect(fd, &addr).unwrap();
            co_write(fd, b"ping").unwrap();
            let mut buf = [0u8; 8];
            let n = co_read(fd, &mut buf).unwrap();
            tx.send(String::from_utf8_lossy(&buf[..n]).into_owned()).unwrap();
            unsafe { libc::close(fd) };
        });

        reactor.add_coroutine(server, false);
        reactor.add_coroutine(client, true);

        let mut seen: Vec<String> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["ping".to_string(), "server 4".to_string()]);

        reactor.stop();
        handle.join().unwrap();
    }

    #[test]
    #[serial]
    fn test_sleep_ms_parks_coroutine() {
        set_hook(true);
        let (reactor, handle) = spawn_reactor();
        let pool = CoroutinePool::new(1, 128 * 1024).unwrap();
        let (tx, rx) = mpsc::channel();
        let cor = pool.get_coroutine_instance().unwrap();
        cor.set_callback(move || {
            let start = Instant::now();
            co_sleep_ms(30);
            tx.send(start.elapsed()).unwrap();
        });
        reactor.add_coroutine(cor, true);
        let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed >= Duration::from_millis(30));

        reactor.stop();
        handle.join().unwrap();
    }

    #[test]
    #[serial]
    fn test_sleep_ignores_spurious_resume() {
        set_hook(true);
        let (reactor, handle) = spawn_reactor();
        let pool = CoroutinePool::new(1, 128 * 1024).unwrap();
        let (tx, rx) = mpsc::channel();
        let cor = pool.get_coroutine_instance().unwrap();
        cor.set_callback(move || {
            let start = Instant::now();
            co_sleep_ms(200);
            tx.send(start.elapsed()).unwrap();
        });
        reactor.add_coroutine(cor.clone(), true);

        wait_until(|| cor.state() == CoroutineState::Suspended);
        thread::sleep(Duration::from_millis(30));
        // an unrelated wakeup must not end the sleep early
        reactor.add_coroutine(cor.clone(), true);

        let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed >= Duration::from_millis(200), "woke after {:?}", elapsed);
        wait_until(|| cor.state() == CoroutineState::Terminated);

        reactor.stop();
        handle.join().unwrap();
    }

    #[test]
    #[serial]
    fn test_connect_times_out() {
        set_hook(true);
        let (reactor, handle) = spawn_reactor();
        let pool = CoroutinePool::new(1, 128 * 1024).unwrap();

        // backlog 0 holds a single pending connection
        let lfd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(lfd >= 0);
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (storage, len) = raw_socket_addr(&bind_addr);
        unsafe {
            assert_eq!(libc::bind(lfd, &storage as *const _ as *const sockaddr, len), 0);
            assert_eq!(libc::listen(lfd, 0), 0);
        }
        let mut bound: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut bound_len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
        unsafe {
            libc::getsockname(lfd, &mut bound as *mut _ as *mut sockaddr, &mut bound_len);
        }
        let addr: SocketAddr = format!("127.0.0.1:{}", u16::from_be(bound.sin_port))
            .parse()
            .unwrap();

        // fill the accept queue; later handshakes are left unanswered
        let (fill_storage, fill_len) = raw_socket_addr(&addr);
        let fillers: Vec<RawFd> = (0..4)
            .map(|_| unsafe {
                let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
                libc::connect(fd, &fill_storage as *const _ as *const sockaddr, fill_len);
                fd
            })
            .collect();
        thread::sleep(Duration::from_millis(50));

        let (tx, rx) = mpsc::channel();
        let cor = pool.get_coroutine_instance().unwrap();
        cor.set_callback(move || {
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
            let start = Instant::now();
            let res = co_connect_timeout(fd, &addr, Duration::from_millis(200));
            tx.send((res.map_err(|e| e.raw_os_error()), start.elapsed())).unwrap();
            unsafe { libc::close(fd) };
        });
        reactor.add_coroutine(cor, true);

        let (res, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(res, Err(Some(libc::ETIMEDOUT)));
        assert!(elapsed >= Duration::from_millis(200), "gave up after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3));

        reactor.stop();
        handle.join().unwrap();
        unsafe {
            for fd in fillers {
                libc::close(fd);
            }
            libc::close(lfd);
        }
    }

    #[test]
    fn test_raw_socket_addr_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (storage, len) = raw_socket_addr(&addr);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
        assert_eq!(sin.sin_family as i32, libc::AF_INET);
        assert_eq!(u16::from_be(sin.sin_port), 8080);
    }
}
