//! Coroutine-aware mutex
//!
//! Unlike `std::sync::Mutex`, a contended [`CoroutineMutex`] parks the
//! calling coroutine and yields instead of blocking the OS thread. Waiters
//! are served strictly in arrival order. On unlock the lock is handed
//! straight to the first waiter (it never becomes free in between), and the
//! waiter is resumed through the task queue of the reactor it parked on, so
//! unlocking from another thread is fine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use corio_core::{kerror, ktrace, kwarn};

use crate::coroutine::{self, Coroutine};
use crate::reactor::Reactor;

struct Waiter {
    cor: Arc<Coroutine>,
    reactor: Arc<Reactor>,
    granted: Arc<AtomicBool>,
}

#[derive(Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
pub struct CoroutineMutex {
    state: Mutex<LockState>,
}

impl CoroutineMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Acquire the lock, parking the coroutine while it is held elsewhere.
    ///
    /// Logged no-op from a scheduler context, which must never yield.
    pub fn lock(&self) {
        if coroutine::is_main_coroutine() {
            kerror!("CoroutineMutex::lock called from the scheduler context");
            return;
        }

        let granted = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state();
            if !state.locked {
                state.locked = true;
                return;
            }
            state.waiters.push_back(Waiter {
                cor: coroutine::get_current_coroutine(),
                reactor: Reactor::get_reactor(),
                granted: Arc::clone(&granted),
            });
            ktrace!("mutex contended, {} waiting", state.waiters.len());
        }

        // the grant always arrives as a resume task, so yield at least once
        loop {
            coroutine::yield_now();
            if granted.load(Ordering::Acquire) {
                break;
            }
        }
    }

    /// Acquire only if free. Usable from any context.
    pub fn try_lock(&self) -> bool {
        let mut state = self.state();
        if state.locked {
            return false;
        }
        state.locked = true;
        true
    }

    /// Release the lock, handing it to the longest waiter if there is one.
    ///
    /// Allowed from a scheduler context and from plain threads, so a lock
    /// taken with [`try_lock`](Self::try_lock) outside any coroutine can be
    /// released there. Unlocking never yields.
    pub fn unlock(&self) {
        let next = {
            let mut state = self.state();
            if !state.locked {
                kwarn!("CoroutineMutex::unlock on an unlocked mutex");
                return;
            }
            let next = state.waiters.pop_front();
            if next.is_none() {
                state.locked = false;
            }
            next
        };

        if let Some(waiter) = next {
            waiter.granted.store(true, Ordering::Release);
            waiter.reactor.add_coroutine(waiter.cor, true);
        }
    }

    /// Lock and return a guard that unlocks on drop
    pub fn guard(&self) -> CoroutineMutexGuard<'_> {
        self.lock();
        CoroutineMutexGuard { mutex: self }
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// Coroutines currently parked on the lock
    pub fn waiters(&self) -> usize {
        self.state().waiters.len()
    }
}

impl std::fmt::Debug for CoroutineMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("CoroutineMutex")
            .field("locked", &state.locked)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

pub struct CoroutineMutexGuard<'a> {
    mutex: &'a CoroutineMutex,
}

impl Drop for CoroutineMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
