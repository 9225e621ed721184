//! Per-descriptor event records
//!
//! One [`FdEvent`] exists per descriptor number for the life of the
//! process. It records which readiness the descriptor is waiting for, the
//! callbacks to run on readiness, the reactor it is armed on, and the
//! coroutine parked on it (if any). Descriptor numbers are reused by the
//! kernel, so records are recycled rather than destroyed.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use corio_core::constants::FD_REGISTRY_INITIAL;
use corio_core::{kdebug, kerror, CoError, CoResult, IoEvent};

use crate::coroutine::Coroutine;
use crate::reactor::Reactor;

/// Callback run by a reactor when a descriptor becomes ready
pub type IoCallback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct FdEventInner {
    listen_events: u32,
    read_cb: Option<IoCallback>,
    write_cb: Option<IoCallback>,
    reactor: Weak<Reactor>,
    coroutine: Option<Arc<Coroutine>>,
}

pub struct FdEvent {
    fd: RawFd,
    inner: Mutex<FdEventInner>,
}

impl FdEvent {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdEventInner::default()),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut FdEventInner) -> R) -> R {
        match self.inner.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Callback for one kind of readiness. Does not arm anything.
    pub fn set_callback<F>(&self, flag: IoEvent, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let cb: IoCallback = Arc::new(cb);
        self.with_inner(|inner| match flag {
            IoEvent::Read => inner.read_cb = Some(cb),
            IoEvent::Write => inner.write_cb = Some(cb),
        });
    }

    pub fn get_callback(&self, flag: IoEvent) -> Option<IoCallback> {
        self.with_inner(|inner| match flag {
            IoEvent::Read => inner.read_cb.clone(),
            IoEvent::Write => inner.write_cb.clone(),
        })
    }

    /// Currently listened epoll mask
    pub fn listen_events(&self) -> u32 {
        self.with_inner(|inner| inner.listen_events)
    }

    /// Add an interest and push the new mask to the reactor
    pub fn add_listen_events(&self, flag: IoEvent) -> CoResult<()> {
        self.with_inner(|inner| inner.listen_events |= flag.bits());
        self.update_to_reactor()
    }

    /// Drop an interest and push the new mask to the reactor. With no
    /// interest left the descriptor is removed from the reactor.
    pub fn del_listen_events(&self, flag: IoEvent) -> CoResult<()> {
        let had = self.with_inner(|inner| {
            let had = inner.listen_events & flag.bits() != 0;
            inner.listen_events &= !flag.bits();
            had
        });
        if !had {
            return Ok(());
        }
        self.update_to_reactor()
    }

    /// Register the current mask on the owning reactor, binding this record
    /// to the calling thread's reactor when it has none.
    pub fn update_to_reactor(&self) -> CoResult<()> {
        let (events, reactor) = self.with_inner(|inner| {
            let reactor = match inner.reactor.upgrade() {
                Some(reactor) => reactor,
                None => {
                    let reactor = Reactor::get_reactor();
                    inner.reactor = Arc::downgrade(&reactor);
                    reactor
                }
            };
            (inner.listen_events, reactor)
        });
        if events == 0 {
            reactor.del_event(self.fd, true)
        } else {
            reactor.add_event(self.fd, events, true)
        }
    }

    /// Remove the descriptor from its reactor and forget all interest and
    /// callbacks.
    pub fn unregister_from_reactor(&self) {
        let reactor = self.with_inner(|inner| {
            inner.listen_events = 0;
            inner.read_cb = None;
            inner.write_cb = None;
            std::mem::take(&mut inner.reactor).upgrade()
        });
        match reactor {
            Some(reactor) => {
                if let Err(e) = reactor.del_event(self.fd, true) {
                    kerror!("unregister fd {}: {}", self.fd, e);
                }
            }
            None => kdebug!("fd {} is not bound to any reactor", self.fd),
        }
    }

    pub fn set_reactor(&self, reactor: Option<&Arc<Reactor>>) {
        self.with_inner(|inner| {
            inner.reactor = reactor.map(Arc::downgrade).unwrap_or_default();
        });
    }

    pub fn reactor(&self) -> Option<Arc<Reactor>> {
        self.with_inner(|inner| inner.reactor.upgrade())
    }

    /// Park `cor` on this descriptor
    pub fn set_coroutine(&self, cor: Arc<Coroutine>) {
        self.with_inner(|inner| inner.coroutine = Some(cor));
    }

    pub fn get_coroutine(&self) -> Option<Arc<Coroutine>> {
        self.with_inner(|inner| inner.coroutine.clone())
    }

    pub fn has_coroutine(&self) -> bool {
        self.with_inner(|inner| inner.coroutine.is_some())
    }

    /// Detach the parked coroutine. Whoever gets `Some` owns the wakeup.
    pub fn take_coroutine(&self) -> Option<Arc<Coroutine>> {
        self.with_inner(|inner| inner.coroutine.take())
    }

    pub fn clear_coroutine(&self) {
        self.take_coroutine();
    }

    /// Put the descriptor into non-blocking mode (no-op if it already is)
    pub fn set_non_block(&self) -> CoResult<()> {
        let flags = fcntl(self.fd, FcntlArg::F_GETFL).map_err(|e| CoError::Os(e as i32))?;
        let flags = OFlag::from_bits_truncate(flags);
        if flags.contains(OFlag::O_NONBLOCK) {
            return Ok(());
        }
        fcntl(self.fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
            .map_err(|e| CoError::Os(e as i32))?;
        Ok(())
    }

    pub fn is_non_block(&self) -> bool {
        fcntl(self.fd, FcntlArg::F_GETFL)
            .map(|flags| OFlag::from_bits_truncate(flags).contains(OFlag::O_NONBLOCK))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for FdEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (events, parked) =
            self.with_inner(|inner| (inner.listen_events, inner.coroutine.as_ref().map(|c| c.id())));
        f.debug_struct("FdEvent")
            .field("fd", &self.fd)
            .field("listen_events", &events)
            .field("coroutine", &parked)
            .finish()
    }
}

/// Process-wide registry mapping descriptor numbers to their [`FdEvent`]
pub struct FdEventContainer {
    fds: RwLock<Vec<Arc<FdEvent>>>,
}

impl FdEventContainer {
    pub fn new(size: usize) -> Self {
        Self {
            fds: RwLock::new((0..size as RawFd).map(|fd| Arc::new(FdEvent::new(fd))).collect()),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static FdEventContainer {
        static CONTAINER: OnceLock<FdEventContainer> = OnceLock::new();
        CONTAINER.get_or_init(|| FdEventContainer::new(FD_REGISTRY_INITIAL))
    }

    /// Record for `fd`, growing the registry to 1.5x `fd` when needed.
    /// `None` for negative descriptors.
    pub fn get_fd_event(&self, fd: RawFd) -> Option<Arc<FdEvent>> {
        if fd < 0 {
            return None;
        }
        let index = fd as usize;
        {
            let fds = self.fds.read().ok()?;
            if let Some(ev) = fds.get(index) {
                return Some(Arc::clone(ev));
            }
        }

        let mut fds = self.fds.write().ok()?;
        if index >= fds.len() {
            let new_size = (index * 3 / 2).max(index + 1);
            let start = fds.len();
            fds.extend((start..new_size).map(|fd| Arc::new(FdEvent::new(fd as RawFd))));
            kdebug!("fd registry grown to {}", new_size);
        }
        fds.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.fds.read().map(|fds| fds.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_grows() {
        let container = FdEventContainer::new(4);
        assert_eq!(container.len(), 4);
        let ev = container.get_fd_event(10).unwrap();
        assert_eq!(ev.fd(), 10);
        assert_eq!(container.len(), 15);
        assert!(container.get_fd_event(-1).is_none());
    }

    #[test]
    fn test_same_record_per_fd() {
        let container = FdEventContainer::new(8);
        let a = container.get_fd_event(3).unwrap();
        let b = container.get_fd_event(3).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_callbacks() {
        let ev = FdEvent::new(99);
        assert!(ev.get_callback(IoEvent::Read).is_none());
        ev.set_callback(IoEvent::Read, || {});
        assert!(ev.get_callback(IoEvent::Read).is_some());
        assert!(ev.get_callback(IoEvent::Write).is_none());
    }

    #[test]
    fn test_set_non_block() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ev = FdEvent::new(fds[0]);
        assert!(!ev.is_non_block());
        ev.set_non_block().unwrap();
        assert!(ev.is_non_block());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_listen_events_on_own_reactor() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ev = FdEvent::new(fds[0]);
        let reactor = Reactor::get_reactor();

        ev.add_listen_events(IoEvent::Read).unwrap();
        assert_eq!(ev.listen_events(), IoEvent::Read.bits());
        assert!(reactor.is_registered(fds[0]));
        assert!(Arc::ptr_eq(&ev.reactor().unwrap(), &reactor));

        ev.del_listen_events(IoEvent::Read).unwrap();
        assert_eq!(ev.listen_events(), 0);
        assert!(!reactor.is_registered(fds[0]));

        ev.add_listen_events(IoEvent::Write).unwrap();
        ev.unregister_from_reactor();
        assert!(!reactor.is_registered(fds[0]));
        assert!(ev.reactor().is_none());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_take_coroutine_once() {
        let ev = FdEvent::new(5);
        let main = crate::coroutine::get_main_coroutine();
        ev.set_coroutine(main);
        assert!(ev.has_coroutine());
        assert!(ev.take_coroutine().is_some());
        assert!(ev.take_coroutine().is_none());
    }
}
