//! corio echo server
//!
//! The main thread runs the accepting reactor: one coroutine accepts
//! connections and hands each to an io thread, where a handler coroutine
//! echoes with blocking-style `co_read`/`co_write`. Connections idle for
//! `COR_WHEEL_BUCKETS * COR_WHEEL_INTERVAL_S` seconds are shut down by the
//! time wheel.
//!
//! Usage:
//!     COR_LOG_LEVEL=debug cargo run --release -p corio-echo -- [port]
//!
//! Test with:
//!     nc 127.0.0.1 9999

use std::net::TcpListener;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use corio::{
    co_accept, co_read, co_write, get_coroutine_pool, kerror, kfatal, kinfo, kdebug,
    FdEventContainer, Reactor, ReactorType, Runtime, Slot, TimeWheel, TimerEvent,
};

struct Stats {
    accepts: AtomicU64,
    bytes: AtomicU64,
    active: AtomicU64,
    evicted: AtomicU64,
}

/// Owns the socket; closed when the last handle goes
struct Conn {
    fd: RawFd,
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Some(ev) = FdEventContainer::global().get_fd_event(self.fd) {
            ev.unregister_from_reactor();
        }
        unsafe { libc::close(self.fd) };
    }
}

impl Conn {
    /// Half-close: the handler's pending read returns EOF and it cleans up
    fn evict(&self, stats: &Stats) {
        kdebug!("evicting idle fd {}", self.fd);
        stats.evicted.fetch_add(1, Ordering::Relaxed);
        unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
    }
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = co_write(fd, buf)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
    }
    Ok(())
}

fn refresh(wheel: &TimeWheel<Conn>, conn: &Arc<Conn>, stats: &Arc<Stats>) {
    let stats = Arc::clone(stats);
    wheel.fresh(Slot::new(Arc::downgrade(conn), move |c: Arc<Conn>| c.evict(&stats)));
}

fn handle_client(fd: RawFd, wheel: Arc<TimeWheel<Conn>>, stats: Arc<Stats>) {
    stats.active.fetch_add(1, Ordering::Relaxed);
    let conn = Arc::new(Conn { fd });
    refresh(&wheel, &conn, &stats);

    let mut buf = [0u8; 4096];
    loop {
        match co_read(fd, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
                if let Err(e) = write_all(fd, &buf[..n]) {
                    kdebug!("fd {} write: {}", fd, e);
                    break;
                }
                refresh(&wheel, &conn, &stats);
            }
            Err(e) => {
                kdebug!("fd {} read: {}", fd, e);
                break;
            }
        }
    }

    // slots left in the wheel only hold weak handles
    drop(conn);
    stats.active.fetch_sub(1, Ordering::Relaxed);
}

fn main() {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(9999);

    let mut rt = match Runtime::from_env() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("corio-echo: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => l,
        Err(e) => kfatal!("bind 0.0.0.0:{}: {}", port, e),
    };
    let listen_fd = listener.into_raw_fd();

    let reactor = Reactor::get_reactor();
    reactor.set_reactor_type(ReactorType::Accepting);
    let wheel = Arc::new(TimeWheel::from_config(&reactor));
    let stats = Arc::new(Stats {
        accepts: AtomicU64::new(0),
        bytes: AtomicU64::new(0),
        active: AtomicU64::new(0),
        evicted: AtomicU64::new(0),
    });

    {
        let stats = Arc::clone(&stats);
        reactor.get_timer().add_timer_event(
            TimerEvent::new(5000, true, move || {
                kinfo!(
                    "accepts={} active={} bytes={} evicted={}",
                    stats.accepts.load(Ordering::Relaxed),
                    stats.active.load(Ordering::Relaxed),
                    stats.bytes.load(Ordering::Relaxed),
                    stats.evicted.load(Ordering::Relaxed),
                );
            }),
            true,
        );
    }

    rt.start();
    let rt = Arc::new(rt);

    let acceptor = match get_coroutine_pool().get_coroutine_instance() {
        Ok(cor) => cor,
        Err(e) => kfatal!("no coroutine for the acceptor: {}", e),
    };
    {
        let rt = Arc::clone(&rt);
        acceptor.set_callback(move || loop {
            let fd = match co_accept(listen_fd) {
                Ok(fd) => fd,
                Err(e) => {
                    kerror!("accept: {}", e);
                    continue;
                }
            };
            stats.accepts.fetch_add(1, Ordering::Relaxed);
            let index = rt.io_pool().get_io_thread().index();
            let wheel = Arc::clone(&wheel);
            let stats = Arc::clone(&stats);
            if let Err(e) = rt
                .io_pool()
                .add_coroutine_to_thread_by_index(index, move || handle_client(fd, wheel, stats))
            {
                kerror!("cannot schedule fd {}: {}", fd, e);
                unsafe { libc::close(fd) };
            }
        });
    }

    kinfo!("echo server listening on 0.0.0.0:{}", port);
    reactor.add_coroutine(acceptor, false);
    reactor.run_loop();
}
