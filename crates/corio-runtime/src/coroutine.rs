//! Stackful asymmetric coroutines
//!
//! Every OS thread has one *scheduler context*, the main coroutine
//! (id 0), which runs on the thread's own stack. Transfers only happen
//! between the scheduler context and a worker coroutine:
//!
//! - [`resume`] switches from the scheduler context into a worker
//! - [`yield_now`] switches from a worker back to the scheduler context of
//!   whatever thread it is currently running on
//!
//! A worker whose callback returns is parked in [`CoroutineState::Terminated`]
//! by the entry trampoline; it never runs off the end of its stack. A new
//! callback re-arms it.
//!
//! State changes that follow a switch *out* of a worker (Suspended,
//! Terminated, leaving the callback) are published by the scheduler side
//! once the swap has returned, so no other thread can grab a coroutine
//! whose registers are still being saved.
//!
//! Coroutines may migrate: one suspended on thread A can be resumed by the
//! scheduler context of thread B. All thread-local lookups go through
//! `#[inline(never)]` accessors so the TLS address is recomputed after a
//! switch instead of being cached from the previous thread.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use corio_core::kprint::{self, LogContext};
use corio_core::{kdebug, kerror, CoroutineId, CoroutineState};

use crate::arch::{self, Context};
use crate::memory::Stack;

/// Work run by a coroutine
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Per-call record of the request a coroutine is serving
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunTime {
    /// Correlation id of the message being processed
    pub msg_no: String,
    /// Name of the interface being served
    pub interface_name: String,
}

pub struct Coroutine {
    id: CoroutineId,
    ctx: UnsafeCell<Context>,
    /// `None` for the scheduler context
    stack: Option<Stack>,
    callback: Mutex<Option<Callback>>,
    state: AtomicU8,
    in_cofunc: AtomicBool,
    /// Set by the trampoline right before its final yield
    finishing: AtomicBool,
    /// Slot in the coroutine pool, -1 when not pool-owned
    index: isize,
    run_time: Mutex<RunTime>,
}

// `ctx` is only written by the context switch of the thread that is
// switching into or out of this coroutine, and the state machine below
// admits exactly one such thread at a time.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

thread_local! {
    static MAIN_COROUTINE: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
    static CURRENT_COROUTINE: Cell<*const Coroutine> = const { Cell::new(ptr::null()) };
}

impl Coroutine {
    /// Build a suspended coroutine on `stack`. Attach work with
    /// [`set_callback`](Self::set_callback) before resuming it.
    pub fn new(stack: Stack) -> Arc<Coroutine> {
        Self::with_index(stack, -1)
    }

    /// Build a coroutine and attach `cb` in one step
    pub fn with_callback<F>(stack: Stack, cb: F) -> Arc<Coroutine>
    where
        F: FnOnce() + Send + 'static,
    {
        let cor = Self::new(stack);
        cor.set_callback(cb);
        cor
    }

    pub(crate) fn with_index(stack: Stack, index: isize) -> Arc<Coroutine> {
        let cor = Arc::new(Coroutine {
            id: CoroutineId::allocate(),
            ctx: UnsafeCell::new(Context::default()),
            stack: Some(stack),
            callback: Mutex::new(None),
            state: AtomicU8::new(CoroutineState::Idle as u8),
            in_cofunc: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            index,
            run_time: Mutex::new(RunTime::default()),
        });
        kdebug!("coroutine {} created, stack {:?}", cor.id, cor.stack);
        cor
    }

    fn new_main() -> Arc<Coroutine> {
        Arc::new(Coroutine {
            id: CoroutineId::MAIN,
            ctx: UnsafeCell::new(Context::default()),
            stack: None,
            callback: Mutex::new(None),
            state: AtomicU8::new(CoroutineState::Running as u8),
            in_cofunc: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            index: -1,
            run_time: Mutex::new(RunTime::default()),
        })
    }

    /// Attach the work this coroutine runs on its next resume.
    ///
    /// Rejected on a scheduler context and while the coroutine is inside
    /// its current callback.
    pub fn set_callback<F>(&self, cb: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(stack) = self.stack.as_ref() else {
            kerror!("set_callback: coroutine {} is a scheduler context", self.id);
            return false;
        };
        if self.in_cofunc.load(Ordering::Acquire) {
            kerror!("set_callback: coroutine {} is still inside its callback", self.id);
            return false;
        }
        let Ok(mut slot) = self.callback.lock() else {
            return false;
        };
        *slot = Some(Box::new(cb));
        drop(slot);

        // Not running (in_cofunc is false) and reachable only through this
        // Arc, so nobody else is touching ctx.
        unsafe {
            arch::init_context(
                &mut *self.ctx.get(),
                stack.top(),
                coroutine_entry,
                self as *const Coroutine as usize,
            );
        }
        self.set_state(CoroutineState::Fresh);
        true
    }

    #[inline]
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    /// Pool slot, -1 when the coroutine is not pool-owned
    #[inline]
    pub fn index(&self) -> isize {
        self.index
    }

    #[inline]
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    #[inline]
    pub fn state(&self) -> CoroutineState {
        CoroutineState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: CoroutineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether [`resume`] would switch into this coroutine
    #[inline]
    pub fn can_resume(&self) -> bool {
        !self.is_main() && self.state().is_resumable()
    }

    /// Whether the coroutine is between entering and leaving its callback
    #[inline]
    pub fn is_in_cofunc(&self) -> bool {
        self.in_cofunc.load(Ordering::Acquire)
    }

    pub fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }

    pub fn run_time(&self) -> RunTime {
        self.run_time.lock().map(|rt| rt.clone()).unwrap_or_default()
    }

    pub fn set_msg_no(&self, msg_no: impl Into<String>) {
        if let Ok(mut rt) = self.run_time.lock() {
            rt.msg_no = msg_no.into();
        }
    }

    pub fn msg_no(&self) -> String {
        self.run_time.lock().map(|rt| rt.msg_no.clone()).unwrap_or_default()
    }

    pub fn set_interface_name(&self, name: impl Into<String>) {
        if let Ok(mut rt) = self.run_time.lock() {
            rt.interface_name = name.into();
        }
    }

    /// Claim the right to switch in: Fresh/Suspended -> Running
    fn try_start(&self) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if !CoroutineState::from(cur).is_resumable() {
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                CoroutineState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("index", &self.index)
            .field("in_cofunc", &self.is_in_cofunc())
            .finish()
    }
}

// ============================================================================
// Entry trampoline
// ============================================================================

extern "C" fn coroutine_entry(arg: usize) {
    // `arg` is the address of the Arc-owned coroutine that was switched
    // into; the resumer holds a strong reference for the whole run.
    let cor = unsafe { &*(arg as *const Coroutine) };

    cor.in_cofunc.store(true, Ordering::Release);
    let cb = cor.callback.lock().ok().and_then(|mut slot| slot.take());
    if let Some(cb) = cb {
        if panic::catch_unwind(AssertUnwindSafe(cb)).is_err() {
            kerror!("coroutine {} panicked inside its callback", cor.id);
        }
    }
    cor.finishing.store(true, Ordering::Release);

    loop {
        yield_now();
        kerror!("coroutine {} resumed after its callback returned", cor.id);
    }
}

// ============================================================================
// Thread-local scheduler state
// ============================================================================

#[inline(never)]
fn current_ptr() -> *const Coroutine {
    CURRENT_COROUTINE.with(|c| c.get())
}

#[inline(never)]
fn set_current_ptr(cor: *const Coroutine) {
    CURRENT_COROUTINE.with(|c| c.set(cor));
}

#[inline(never)]
fn main_ptr() -> *const Coroutine {
    MAIN_COROUTINE.with(|m| m.borrow().as_ref().map_or(ptr::null(), Arc::as_ptr))
}

/// The calling thread's scheduler context, created on first use
#[inline(never)]
pub fn get_main_coroutine() -> Arc<Coroutine> {
    MAIN_COROUTINE.with(|m| {
        let mut slot = m.borrow_mut();
        if let Some(main) = slot.as_ref() {
            return Arc::clone(main);
        }
        kprint::set_context_provider(log_context);
        let main = Coroutine::new_main();
        CURRENT_COROUTINE.with(|c| {
            if c.get().is_null() {
                c.set(Arc::as_ptr(&main));
            }
        });
        *slot = Some(Arc::clone(&main));
        main
    })
}

/// The coroutine running on this thread (the scheduler context when no
/// worker is running)
pub fn get_current_coroutine() -> Arc<Coroutine> {
    let cur = current_ptr();
    if cur.is_null() {
        return get_main_coroutine();
    }
    // A current coroutine is kept alive by whoever resumed it.
    unsafe {
        Arc::increment_strong_count(cur);
        Arc::from_raw(cur)
    }
}

/// Whether the caller is running in this thread's scheduler context
pub fn is_main_coroutine() -> bool {
    let cur = current_ptr();
    cur.is_null() || cur == main_ptr()
}

/// Run-time record of the running worker, `None` in a scheduler context
pub fn get_current_run_time() -> Option<RunTime> {
    if is_main_coroutine() {
        return None;
    }
    Some(get_current_coroutine().run_time())
}

fn log_context() -> LogContext {
    let cur = current_ptr();
    if cur.is_null() {
        return LogContext::default();
    }
    let cor = unsafe { &*cur };
    let msg_no = if cor.is_main() {
        None
    } else {
        cor.run_time.try_lock().ok().map(|rt| rt.msg_no.clone())
    };
    LogContext {
        coroutine: cor.id.as_u32(),
        msg_no,
    }
}

// ============================================================================
// Transfers
// ============================================================================

/// Switch back to the scheduler context of the current thread.
///
/// Logged no-op when there is no scheduler context or the caller already
/// is one.
pub fn yield_now() -> bool {
    let main = main_ptr();
    if main.is_null() {
        kerror!("yield: no scheduler context on this thread");
        return false;
    }
    let cur = current_ptr();
    if cur.is_null() || cur == main {
        kerror!("yield: called from the scheduler context");
        return false;
    }

    let cor = unsafe { &*cur };
    set_current_ptr(main);
    unsafe { arch::swap_context(cor.ctx.get(), (*main).ctx.get()) };
    true
}

/// Switch from the scheduler context into `target`.
///
/// Returns once `target` yields (or finishes). Logged no-op returning
/// `false` when called from a worker or when `target` is not resumable.
pub fn resume(target: &Arc<Coroutine>) -> bool {
    let main = get_main_coroutine();
    if current_ptr() != Arc::as_ptr(&main) {
        kerror!("resume: must be called from the scheduler context");
        return false;
    }
    if Arc::ptr_eq(target, &main) {
        return true;
    }
    if !target.try_start() {
        kerror!(
            "resume: coroutine {} is not resumable ({:?})",
            target.id,
            target.state()
        );
        return false;
    }

    set_current_ptr(Arc::as_ptr(target));
    unsafe { arch::swap_context(main.ctx.get(), target.ctx.get()) };

    // `target` is fully switched out now
    if target.finishing.swap(false, Ordering::AcqRel) {
        // state first: clearing in_cofunc makes it reusable by the pool
        target.set_state(CoroutineState::Terminated);
        target.in_cofunc.store(false, Ordering::Release);
    } else {
        target.set_state(CoroutineState::Suspended);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use std::sync::atomic::AtomicUsize;

    fn arena() -> Arc<Memory> {
        Arc::new(Memory::new(64 * 1024, 8).unwrap())
    }

    #[test]
    fn test_resume_yield_round_trip() {
        let memory = arena();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let cor = Coroutine::with_callback(Stack::from_arena(&memory).unwrap(), move || {
            s.fetch_add(1, Ordering::SeqCst);
            assert!(!is_main_coroutine());
            yield_now();
            s.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(cor.state(), CoroutineState::Fresh);
        assert!(resume(&cor));
        assert!(is_main_coroutine());
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(cor.state(), CoroutineState::Suspended);
        assert!(cor.is_in_cofunc());

        assert!(resume(&cor));
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(cor.state(), CoroutineState::Terminated);
        assert!(!cor.is_in_cofunc());
        assert!(!cor.can_resume());
    }

    #[test]
    fn test_current_coroutine_inside_callback() {
        let memory = arena();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let cor = Coroutine::new(Stack::from_arena(&memory).unwrap());
        let expected = cor.id().as_u32() as usize;
        cor.set_callback(move || {
            s.store(get_current_coroutine().id().as_u32() as usize, Ordering::SeqCst);
        });
        resume(&cor);
        assert_eq!(seen.load(Ordering::SeqCst), expected);
        assert!(get_current_coroutine().is_main());
    }

    #[test]
    fn test_yield_from_main_is_rejected() {
        get_main_coroutine();
        assert!(!yield_now());
    }

    #[test]
    fn test_set_callback_on_main_is_rejected() {
        let main = get_main_coroutine();
        assert!(!main.set_callback(|| {}));
        assert!(!main.can_resume());
    }

    #[test]
    fn test_set_callback_while_in_callback_is_rejected() {
        let memory = arena();
        let cor = Coroutine::with_callback(Stack::from_arena(&memory).unwrap(), || {
            yield_now();
        });
        resume(&cor);
        assert!(cor.is_in_cofunc());
        assert!(!cor.set_callback(|| {}));
        resume(&cor);
        assert!(cor.set_callback(|| {}));
    }

    #[test]
    fn test_nested_resume_is_rejected() {
        let memory = arena();
        let inner = Coroutine::with_callback(Stack::from_arena(&memory).unwrap(), || {});
        let inner2 = inner.clone();
        let result = Arc::new(AtomicBool::new(true));
        let r = result.clone();
        let outer = Coroutine::with_callback(Stack::from_arena(&memory).unwrap(), move || {
            r.store(resume(&inner2), Ordering::SeqCst);
        });
        resume(&outer);
        assert!(!result.load(Ordering::SeqCst));
        assert_eq!(inner.state(), CoroutineState::Fresh);
    }

    #[test]
    fn test_terminated_coroutine_can_be_rearmed() {
        let memory = arena();
        let runs = Arc::new(AtomicUsize::new(0));
        let cor = Coroutine::new(Stack::from_arena(&memory).unwrap());
        assert!(!resume(&cor));

        for _ in 0..3 {
            let r = runs.clone();
            assert!(cor.set_callback(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }));
            assert!(resume(&cor));
            assert!(!resume(&cor));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panic_in_callback_is_contained() {
        let memory = arena();
        let cor = Coroutine::with_callback(Stack::from_arena(&memory).unwrap(), || {
            panic!("boom");
        });
        assert!(resume(&cor));
        assert_eq!(cor.state(), CoroutineState::Terminated);
        assert!(!cor.is_in_cofunc());
    }

    #[test]
    fn test_resume_on_another_thread() {
        let memory = arena();
        let threads = Arc::new(Mutex::new(Vec::new()));
        let t = threads.clone();
        let cor = Coroutine::with_callback(Stack::from_arena(&memory).unwrap(), move || {
            t.lock().unwrap().push(std::thread::current().id());
            yield_now();
            t.lock().unwrap().push(std::thread::current().id());
        });

        resume(&cor);
        let cor2 = cor.clone();
        std::thread::spawn(move || {
            assert!(resume(&cor2));
            assert!(is_main_coroutine());
        })
        .join()
        .unwrap();

        let threads = threads.lock().unwrap();
        assert_eq!(threads.len(), 2);
        assert_ne!(threads[0], threads[1]);
        assert_eq!(cor.state(), CoroutineState::Terminated);
    }

    #[test]
    fn test_run_time_record() {
        let memory = arena();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let cor = Coroutine::new(Stack::from_arena(&memory).unwrap());
        cor.set_msg_no("000123");
        cor.set_callback(move || {
            *s.lock().unwrap() = get_current_run_time();
        });
        assert!(get_current_run_time().is_none());
        resume(&cor);
        let rt = seen.lock().unwrap().clone().unwrap();
        assert_eq!(rt.msg_no, "000123");
    }

    #[test]
    fn test_stack_returned_when_coroutine_dropped() {
        let memory = arena();
        let cor = Coroutine::with_callback(Stack::from_arena(&memory).unwrap(), || {});
        resume(&cor);
        assert_eq!(memory.ref_count(), 1);
        drop(cor);
        assert_eq!(memory.ref_count(), 0);
    }
}
