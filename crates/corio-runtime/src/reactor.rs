//! Per-thread epoll event loop
//!
//! Exactly one [`Reactor`] exists per OS thread, created on first access
//! through [`Reactor::get_reactor`]. Only the owning thread touches the
//! epoll registration; other threads submit additions, deletions and tasks
//! into a locked pending area and kick the loop through an eventfd.
//!
//! One loop iteration:
//!
//! 1. resume the coroutine captured first in the previous iteration
//! 2. (working reactors) drain the shared [`CoroutineTaskQueue`]
//! 3. run the pending tasks
//! 4. `epoll_wait`
//! 5. dispatch readiness (wakeup fd, timer fd, parked coroutines, callbacks)
//! 6. apply pending registrations

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};

use crossbeam_queue::SegQueue;

use corio_core::constants::MAX_EPOLL_EVENTS;
use corio_core::{kdebug, kerror, kfatal, kinfo, ktrace, kwarn, CoError, CoResult, ReactorType};

use crate::config;
use crate::coroutine::{self, Coroutine};
use crate::fd_event::{FdEvent, FdEventContainer};
use crate::hook::sys;
use crate::timer::Timer;

/// Work submitted to a reactor from any thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;

// ============================================================================
// Shared ready queue
// ============================================================================

/// Fd events whose parked coroutine is ready to run on any working reactor
pub struct CoroutineTaskQueue {
    queue: SegQueue<Arc<FdEvent>>,
}

impl CoroutineTaskQueue {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    /// The process-wide queue shared by all working reactors
    pub fn global() -> &'static CoroutineTaskQueue {
        static QUEUE: OnceLock<CoroutineTaskQueue> = OnceLock::new();
        QUEUE.get_or_init(CoroutineTaskQueue::new)
    }

    pub fn push(&self, ev: Arc<FdEvent>) {
        self.queue.push(ev);
    }

    /// `None` when the queue is empty
    pub fn pop(&self) -> Option<Arc<FdEvent>> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for CoroutineTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Reactor
// ============================================================================

#[derive(Default)]
struct Pending {
    add: HashMap<RawFd, u32>,
    del: Vec<RawFd>,
    tasks: Vec<Task>,
}

pub struct Reactor {
    epfd: RawFd,
    wake_fd: RawFd,
    thread: ThreadId,
    tid: i32,
    role: AtomicU8,
    stop_flag: AtomicBool,
    looping: AtomicBool,
    /// Descriptors currently in the epoll set (wakeup fd excluded)
    fds: Mutex<HashSet<RawFd>>,
    pending: Mutex<Pending>,
    timer: OnceLock<Arc<Timer>>,
    epoll_timeout_ms: i32,
}

thread_local! {
    static REACTOR: RefCell<Option<Arc<Reactor>>> = const { RefCell::new(None) };
    static REACTOR_CREATED: Cell<bool> = const { Cell::new(false) };
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Reactor {
    fn new() -> Reactor {
        if REACTOR_CREATED.with(|c| c.replace(true)) {
            kfatal!("a reactor already exists on this thread");
        }

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            kfatal!("epoll_create1 failed, errno={}", sys::errno());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            kfatal!("eventfd failed, errno={}", sys::errno());
        }

        let mut ev = libc::epoll_event {
            events: EPOLLIN,
            u64: wake_fd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) } != 0 {
            kfatal!("cannot register wakeup fd, errno={}", sys::errno());
        }

        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
        kdebug!("reactor created on tid {}, epfd {}, wake_fd {}", tid, epfd, wake_fd);

        Reactor {
            epfd,
            wake_fd,
            thread: thread::current().id(),
            tid,
            role: AtomicU8::new(ReactorType::default() as u8),
            stop_flag: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            fds: Mutex::new(HashSet::new()),
            pending: Mutex::new(Pending::default()),
            timer: OnceLock::new(),
            epoll_timeout_ms: config::global().epoll_timeout_ms(),
        }
    }

    /// The calling thread's reactor, created on first use
    #[inline(never)]
    pub fn get_reactor() -> Arc<Reactor> {
        if let Some(reactor) = REACTOR.with(|r| r.borrow().clone()) {
            return reactor;
        }
        let reactor = Arc::new(Reactor::new());
        REACTOR.with(|r| *r.borrow_mut() = Some(Arc::clone(&reactor)));
        reactor
    }

    #[inline]
    pub fn tid(&self) -> i32 {
        self.tid
    }

    #[inline]
    pub fn epfd(&self) -> RawFd {
        self.epfd
    }

    /// Whether the caller runs on the thread owning this reactor
    #[inline]
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub fn set_reactor_type(&self, role: ReactorType) {
        self.role.store(role as u8, Ordering::Release);
    }

    pub fn reactor_type(&self) -> ReactorType {
        ReactorType::from(self.role.load(Ordering::Acquire))
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// Whether `fd` is in this reactor's epoll set
    pub fn is_registered(&self, fd: RawFd) -> bool {
        lock(&self.fds).contains(&fd)
    }

    /// The reactor's timer, created and registered on first use
    pub fn get_timer(&self) -> Arc<Timer> {
        let timer = self.timer.get_or_init(|| match Timer::new() {
            Ok(timer) => Arc::new(timer),
            Err(e) => kfatal!("cannot create timer: {}", e),
        });
        if !self.is_registered(timer.fd()) {
            if let Err(e) = self.add_event(timer.fd(), EPOLLIN, true) {
                kerror!("cannot register timer fd {}: {}", timer.fd(), e);
            }
        }
        Arc::clone(timer)
    }

    fn timer_fd(&self) -> Option<RawFd> {
        self.timer.get().map(|t| t.fd())
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Listen for `events` on `fd`. Applied at once on the loop thread,
    /// queued and signalled from any other thread.
    pub fn add_event(&self, fd: RawFd, events: u32, is_wakeup: bool) -> CoResult<()> {
        if self.is_loop_thread() {
            return self.add_event_in_loop_thread(fd, events);
        }
        {
            let mut pending = lock(&self.pending);
            pending.del.retain(|&d| d != fd);
            pending.add.insert(fd, events);
        }
        if is_wakeup {
            self.wakeup();
        }
        Ok(())
    }

    /// Stop listening on `fd`. Same threading rules as [`add_event`](Self::add_event).
    pub fn del_event(&self, fd: RawFd, is_wakeup: bool) -> CoResult<()> {
        if self.is_loop_thread() {
            return self.del_event_in_loop_thread(fd);
        }
        {
            let mut pending = lock(&self.pending);
            pending.add.remove(&fd);
            pending.del.push(fd);
        }
        if is_wakeup {
            self.wakeup();
        }
        Ok(())
    }

    fn add_event_in_loop_thread(&self, fd: RawFd, events: u32) -> CoResult<()> {
        let mut fds = lock(&self.fds);
        let op = if fds.contains(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let errno = sys::errno();
            kerror!("epoll_ctl add fd {} events {:#x} failed, errno={}", fd, events, errno);
            fds.remove(&fd);
            return Err(CoError::Os(errno));
        }
        fds.insert(fd);
        ktrace!("fd {} listening {:#x}", fd, events);
        Ok(())
    }

    fn del_event_in_loop_thread(&self, fd: RawFd) -> CoResult<()> {
        let mut fds = lock(&self.fds);
        if !fds.remove(&fd) {
            return Ok(());
        }
        let rt = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rt != 0 {
            let errno = sys::errno();
            // the descriptor may already be closed
            if errno != libc::EBADF && errno != libc::ENOENT {
                kerror!("epoll_ctl del fd {} failed, errno={}", fd, errno);
                return Err(CoError::Os(errno));
            }
        }
        ktrace!("fd {} removed", fd);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    pub fn add_task<F>(&self, task: F, is_wakeup: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.pending).tasks.push(Box::new(task));
        if is_wakeup {
            self.wakeup();
        }
    }

    pub fn add_tasks(&self, batch: Vec<Task>, is_wakeup: bool) {
        if batch.is_empty() {
            return;
        }
        lock(&self.pending).tasks.extend(batch);
        if is_wakeup {
            self.wakeup();
        }
    }

    /// Resume `cor` on this reactor's thread
    pub fn add_coroutine(&self, cor: Arc<Coroutine>, is_wakeup: bool) {
        self.add_task(
            move || {
                coroutine::resume(&cor);
            },
            is_wakeup,
        );
    }

    /// Interrupt a blocked `epoll_wait`
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            sys::write(
                self.wake_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let errno = sys::errno();
            // counter saturated, a wakeup is already pending
            if errno != libc::EAGAIN {
                kerror!("wakeup write failed, errno={}", errno);
            }
        }
    }

    fn drain_wakeup(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe { sys::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Ask the loop to exit after the current iteration
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.wakeup();
    }

    // ------------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------------

    /// Run the event loop on the owning thread until [`stop`](Self::stop)
    pub fn run_loop(self: &Arc<Self>) {
        if !self.is_loop_thread() {
            kerror!("run_loop: reactor of tid {} driven from another thread", self.tid);
            return;
        }
        if self.looping.swap(true, Ordering::AcqRel) {
            kerror!("run_loop: reactor of tid {} is already looping", self.tid);
            return;
        }
        coroutine::get_main_coroutine();
        kinfo!("reactor loop started, tid {}, role {}", self.tid, self.reactor_type());

        let mut first_coroutine: Option<Arc<Coroutine>> = None;
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EPOLL_EVENTS];

        while !self.stop_flag.load(Ordering::Acquire) {
            if let Some(cor) = first_coroutine.take() {
                coroutine::resume(&cor);
            }

            if self.reactor_type() == ReactorType::Working {
                while let Some(ev) = CoroutineTaskQueue::global().pop() {
                    ev.set_reactor(Some(self));
                    if let Some(cor) = ev.take_coroutine() {
                        coroutine::resume(&cor);
                    }
                }
            }

            let tasks = std::mem::take(&mut lock(&self.pending).tasks);
            for task in tasks {
                task();
            }

            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }

            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    MAX_EPOLL_EVENTS as i32,
                    self.epoll_timeout_ms,
                )
            };
            if n < 0 {
                let errno = sys::errno();
                if errno != libc::EINTR {
                    kerror!("epoll_wait failed, errno={}", errno);
                }
            }

            for ev in events.iter().take(n.max(0) as usize) {
                let fd = ev.u64 as RawFd;
                let revents = ev.events;
                if fd == self.wake_fd {
                    self.drain_wakeup();
                } else if Some(fd) == self.timer_fd() {
                    if let Some(timer) = self.timer.get() {
                        timer.on_timer();
                    }
                } else {
                    self.dispatch(fd, revents, &mut first_coroutine);
                }
            }

            self.apply_pending();
        }

        // a captured coroutine must not be lost
        if let Some(cor) = first_coroutine.take() {
            coroutine::resume(&cor);
        }
        self.apply_pending();
        self.looping.store(false, Ordering::Release);
        kinfo!("reactor loop stopped, tid {}", self.tid);
    }

    fn dispatch(
        self: &Arc<Self>,
        fd: RawFd,
        revents: u32,
        first_coroutine: &mut Option<Arc<Coroutine>>,
    ) {
        let Some(fd_event) = FdEventContainer::global().get_fd_event(fd) else {
            kwarn!("readiness on unknown fd {}", fd);
            return;
        };

        if let Some(cor) = fd_event.take_coroutine() {
            if first_coroutine.is_none() {
                *first_coroutine = Some(cor);
                return;
            }
            match self.reactor_type() {
                ReactorType::Working => {
                    // hand it to whichever working reactor drains the queue first
                    if let Err(e) = self.del_event_in_loop_thread(fd) {
                        kwarn!("fd {} handoff: {}", fd, e);
                    }
                    fd_event.set_reactor(None);
                    fd_event.set_coroutine(cor);
                    CoroutineTaskQueue::global().push(fd_event);
                }
                ReactorType::Accepting => {
                    coroutine::resume(&cor);
                }
            }
            return;
        }

        let mut queued = false;
        if revents & EPOLLIN != 0 {
            if let Some(cb) = fd_event.get_callback(corio_core::IoEvent::Read) {
                self.add_task(move || cb(), false);
                queued = true;
            }
        }
        if revents & EPOLLOUT != 0 {
            if let Some(cb) = fd_event.get_callback(corio_core::IoEvent::Write) {
                self.add_task(move || cb(), false);
                queued = true;
            }
        }
        if !queued && revents & (EPOLLERR | EPOLLHUP) != 0 {
            kwarn!("fd {} reported error/hangup ({:#x}), removing", fd, revents);
            if let Err(e) = self.del_event_in_loop_thread(fd) {
                kerror!("fd {}: {}", fd, e);
            }
        }
    }

    fn apply_pending(&self) {
        let (add, del) = {
            let mut pending = lock(&self.pending);
            (
                std::mem::take(&mut pending.add),
                std::mem::take(&mut pending.del),
            )
        };
        for fd in del {
            // failures are logged inside and the fd dropped
            let _ = self.del_event_in_loop_thread(fd);
        }
        for (fd, events) in add {
            let _ = self.add_event_in_loop_thread(fd, events);
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("tid", &self.tid)
            .field("epfd", &self.epfd)
            .field("role", &self.reactor_type())
            .field("looping", &self.is_looping())
            .finish()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_fd);
        }
    }
}
