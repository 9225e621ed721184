//! Working-reactor threads
//!
//! An [`IoThread`] owns one OS thread running a working reactor. The thread
//! sets up its reactor and scheduler context, reports back, and then waits
//! for [`IoThread::start`] before entering the loop, so callers can
//! register work on every reactor before any of them runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};

use rand::Rng;

use corio_core::{kdebug, kerror, kinfo, CoError, CoResult, ReactorType};

use crate::coroutine::{self, Coroutine};
use crate::pool::get_coroutine_pool;
use crate::reactor::Reactor;

pub struct IoThread {
    index: usize,
    reactor: Arc<Reactor>,
    thread_id: ThreadId,
    start_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IoThread {
    /// Spawn the thread and wait until its reactor exists
    pub fn new(index: usize) -> CoResult<Self> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (start_tx, start_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(format!("corio-io-{}", index))
            .spawn(move || {
                let reactor = Reactor::get_reactor();
                reactor.set_reactor_type(ReactorType::Working);
                coroutine::get_main_coroutine();
                if ready_tx.send(Arc::clone(&reactor)).is_err() {
                    return;
                }
                // sender dropped without start: shut down quietly
                if start_rx.recv().is_err() {
                    return;
                }
                reactor.run_loop();
            })
            .map_err(|_| CoError::SpawnFailed)?;

        let thread_id = handle.thread().id();
        let reactor = ready_rx.recv().map_err(|_| CoError::SpawnFailed)?;
        kdebug!("io thread {} ready, tid {}", index, reactor.tid());

        Ok(Self {
            index,
            reactor,
            thread_id,
            start_tx: Some(start_tx),
            handle: Some(handle),
        })
    }

    /// Let the thread enter its event loop. Idempotent.
    pub fn start(&mut self) {
        if let Some(tx) = self.start_tx.take() {
            let _ = tx.send(());
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Whether the caller is this io thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stop the loop and join the thread
    pub fn stop(&mut self) {
        self.start_tx = None;
        self.reactor.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                kerror!("io thread {} panicked", self.index);
            }
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `cb` in a pooled coroutine that goes back to the pool when done
fn pooled_coroutine<F>(cb: F) -> CoResult<Arc<Coroutine>>
where
    F: FnOnce() + Send + 'static,
{
    let cor = get_coroutine_pool().get_coroutine_instance()?;
    cor.set_callback(move || {
        cb();
        get_coroutine_pool().return_coroutine(coroutine::get_current_coroutine());
    });
    Ok(cor)
}

/// Fixed set of working reactors
pub struct IoThreadPool {
    threads: Vec<IoThread>,
    next: AtomicUsize,
}

impl IoThreadPool {
    pub fn new(size: usize) -> CoResult<Self> {
        if size == 0 {
            return Err(CoError::Config("io thread pool size must be > 0"));
        }
        let threads = (0..size).map(IoThread::new).collect::<CoResult<Vec<_>>>()?;
        Ok(Self {
            threads,
            next: AtomicUsize::new(0),
        })
    }

    /// Start every thread's event loop
    pub fn start(&mut self) {
        for t in self.threads.iter_mut() {
            t.start();
        }
        kinfo!("io thread pool started with {} threads", self.threads.len());
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Next thread in round-robin order
    pub fn get_io_thread(&self) -> &IoThread {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        &self.threads[i]
    }

    pub fn io_thread(&self, index: usize) -> Option<&IoThread> {
        self.threads.get(index)
    }

    /// Queue `task` on every thread
    pub fn broadcast_task<F>(&self, task: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        for t in &self.threads {
            let task = Arc::clone(&task);
            t.reactor().add_task(move || task(), true);
        }
    }

    pub fn add_task_by_index<F>(&self, index: usize, task: F) -> CoResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let t = self.threads.get(index).ok_or(CoError::InvalidIndex(index))?;
        t.reactor().add_task(task, true);
        Ok(())
    }

    /// Run `cb` in a pooled coroutine on a random thread. Unless
    /// `use_self_thread`, the calling io thread is avoided.
    pub fn add_coroutine_to_random_thread<F>(
        &self,
        cb: F,
        use_self_thread: bool,
    ) -> CoResult<Arc<Coroutine>>
    where
        F: FnOnce() + Send + 'static,
    {
        let cor = pooled_coroutine(cb)?;
        let index = self.pick_random(use_self_thread);
        self.threads[index].reactor().add_coroutine(Arc::clone(&cor), true);
        Ok(cor)
    }

    fn pick_random(&self, use_self_thread: bool) -> usize {
        let size = self.threads.len();
        if size == 1 {
            return 0;
        }
        let i = rand::thread_rng().gen_range(0..size);
        if !use_self_thread && self.threads[i].is_current() {
            (i + 1) % size
        } else {
            i
        }
    }

    pub fn add_coroutine_to_thread_by_index<F>(&self, index: usize, cb: F) -> CoResult<Arc<Coroutine>>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(t) = self.threads.get(index) else {
            kerror!("add_coroutine_to_thread_by_index: invalid index {}", index);
            return Err(CoError::InvalidIndex(index));
        };
        let cor = pooled_coroutine(cb)?;
        t.reactor().add_coroutine(Arc::clone(&cor), true);
        Ok(cor)
    }

    /// Run a copy of `cb` in its own coroutine on every thread
    pub fn add_coroutine_to_each_thread<F>(&self, cb: F) -> CoResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let cb = Arc::new(cb);
        for t in &self.threads {
            let cb = Arc::clone(&cb);
            let cor = pooled_coroutine(move || cb())?;
            t.reactor().add_coroutine(cor, true);
        }
        Ok(())
    }

    /// Stop and join every thread
    pub fn stop(&mut self) {
        for t in self.threads.iter_mut() {
            t.stop();
        }
    }
}
