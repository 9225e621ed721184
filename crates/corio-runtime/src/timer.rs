//! Deadline-triggered callbacks on a timerfd
//!
//! Each reactor owns at most one [`Timer`]. Events sit in a map ordered by
//! absolute arrival time; the timerfd is always programmed for the
//! earliest one. When it fires, the reactor calls [`Timer::on_timer`],
//! which collects every due event, re-arms the repeating ones and then runs
//! the callbacks outside the lock.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use corio_core::{kdebug, kerror, ktrace, CoError, CoResult};

use crate::hook::sys;

/// Milliseconds on a monotonic clock, counted from first use
pub fn now_ms() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as i64
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

pub type TimerTask = Box<dyn Fn() + Send + Sync + 'static>;

/// A one-shot or repeating deadline
pub struct TimerEvent {
    arrive_time: AtomicI64,
    interval: i64,
    is_repeated: bool,
    is_cancelled: AtomicBool,
    seq: u64,
    task: TimerTask,
}

impl TimerEvent {
    /// Event due `interval_ms` from now
    pub fn new<F>(interval_ms: i64, is_repeated: bool, task: F) -> Arc<TimerEvent>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let interval = interval_ms.max(0);
        Arc::new(TimerEvent {
            arrive_time: AtomicI64::new(now_ms() + interval),
            interval,
            is_repeated,
            is_cancelled: AtomicBool::new(false),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            task: Box::new(task),
        })
    }

    #[inline]
    pub fn arrive_time(&self) -> i64 {
        self.arrive_time.load(Ordering::Acquire)
    }

    #[inline]
    pub fn interval(&self) -> i64 {
        self.interval
    }

    #[inline]
    pub fn is_repeated(&self) -> bool {
        self.is_repeated
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.is_cancelled.store(true, Ordering::Release);
    }

    /// Clear the cancelled flag
    pub fn resume(&self) {
        self.is_cancelled.store(false, Ordering::Release);
    }

    /// Push the deadline to `interval` from now
    pub fn reset_time(&self) {
        self.arrive_time.store(now_ms() + self.interval, Ordering::Release);
    }

    fn key(&self) -> (i64, u64) {
        (self.arrive_time(), self.seq)
    }
}

impl std::fmt::Debug for TimerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEvent")
            .field("arrive_time", &self.arrive_time())
            .field("interval", &self.interval)
            .field("repeated", &self.is_repeated)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub struct Timer {
    fd: RawFd,
    events: Mutex<BTreeMap<(i64, u64), Arc<TimerEvent>>>,
}

impl Timer {
    pub fn new() -> CoResult<Timer> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(CoError::last_os_error());
        }
        kdebug!("timer fd {} created", fd);
        Ok(Timer {
            fd,
            events: Mutex::new(BTreeMap::new()),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Pending (not yet fired) events
    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `event`. With `need_reset`, reprogram the timerfd when the new
    /// deadline is the earliest one.
    pub fn add_timer_event(&self, event: Arc<TimerEvent>, need_reset: bool) {
        let Ok(mut events) = self.events.lock() else {
            return;
        };
        let key = event.key();
        let earliest = match events.first_key_value() {
            None => true,
            Some((first, _)) => key < *first,
        };
        events.insert(key, event);
        if need_reset && earliest {
            self.reset_arrive_time(&events);
        }
    }

    /// Cancel `event` and drop it from the pending set. Safe to call twice.
    pub fn del_timer_event(&self, event: &Arc<TimerEvent>) {
        event.cancel();
        let Ok(mut events) = self.events.lock() else {
            return;
        };
        if events.remove(&event.key()).is_some() {
            return;
        }
        // the deadline moved after insertion
        let stale = events
            .iter()
            .find(|(_, ev)| Arc::ptr_eq(ev, event))
            .map(|(key, _)| *key);
        if let Some(key) = stale {
            events.remove(&key);
        }
    }

    /// Program the timerfd for the earliest deadline. Deadlines already in
    /// the past are armed 1ns out so the fd still fires.
    fn reset_arrive_time(&self, events: &BTreeMap<(i64, u64), Arc<TimerEvent>>) {
        let Some(((first, _), _)) = events.first_key_value() else {
            return;
        };
        let wait = first - now_ms();
        let value = if wait <= 0 {
            libc::timespec {
                tv_sec: 0,
                tv_nsec: 1,
            }
        } else {
            libc::timespec {
                tv_sec: (wait / 1000) as libc::time_t,
                tv_nsec: ((wait % 1000) * 1_000_000) as libc::c_long,
            }
        };
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };
        let rt = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if rt != 0 {
            kerror!("timerfd_settime failed, errno={}", sys::errno());
        } else {
            ktrace!("timer armed for {}ms", wait.max(0));
        }
    }

    /// Fire every due event. Called by the reactor on timerfd readiness.
    pub fn on_timer(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe { sys::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }

        let now = now_ms();
        let mut due = Vec::new();
        {
            let Ok(mut events) = self.events.lock() else {
                return;
            };
            while let Some(entry) = events.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let ev = entry.remove();
                if !ev.is_cancelled() {
                    due.push(ev);
                }
            }
            for ev in due.iter().filter(|ev| ev.is_repeated()) {
                ev.reset_time();
                events.insert(ev.key(), Arc::clone(ev));
            }
            self.reset_arrive_time(&events);
        }

        for ev in due {
            // may have been cancelled by an earlier callback in this batch
            if !ev.is_cancelled() {
                (ev.task)();
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn wait_past(ms: i64) {
        std::thread::sleep(Duration::from_millis(ms as u64 + 5));
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let timer = Timer::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for delay in [30, 10, 20] {
            let o = order.clone();
            timer.add_timer_event(
                TimerEvent::new(delay, false, move || o.lock().unwrap().push(delay)),
                true,
            );
        }
        wait_past(30);
        timer.on_timer();
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_cancelled_event_never_fires() {
        let timer = Timer::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let ev = TimerEvent::new(5, false, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        timer.add_timer_event(ev.clone(), true);
        timer.del_timer_event(&ev);
        timer.del_timer_event(&ev);
        wait_past(5);
        timer.on_timer();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(ev.is_cancelled());
    }

    #[test]
    fn test_cancel_flag_checked_at_fire_time() {
        let timer = Timer::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let ev = TimerEvent::new(0, false, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        timer.add_timer_event(ev.clone(), false);
        ev.cancel();
        timer.on_timer();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_repeating_event_is_rearmed() {
        let timer = Timer::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let ev = TimerEvent::new(5, true, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        timer.add_timer_event(ev.clone(), true);
        for _ in 0..3 {
            wait_past(5);
            timer.on_timer();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(timer.len(), 1);
        assert!(ev.arrive_time() > now_ms() - 5);

        timer.del_timer_event(&ev);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_not_yet_due_stays_pending() {
        let timer = Timer::new().unwrap();
        timer.add_timer_event(TimerEvent::new(60_000, false, || {}), true);
        timer.on_timer();
        assert_eq!(timer.len(), 1);
    }

    #[test]
    fn test_resume_clears_cancel() {
        let ev = TimerEvent::new(10, false, || {});
        ev.cancel();
        assert!(ev.is_cancelled());
        ev.resume();
        assert!(!ev.is_cancelled());
    }
}
