//! Idle-connection time wheel
//!
//! A fixed ring of buckets, rotated by a repeating timer. Each rotation
//! drops the oldest bucket and opens a fresh one at the tail. Connections
//! register a [`Slot`] holding a weak handle to themselves; refreshing is a
//! plain append of a new slot to the tail. When the last slot for a
//! connection falls off the head, the slot's drop runs the eviction
//! callback, but only if the connection is still alive.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use corio_core::{kdebug, ktrace};

use crate::config;
use crate::reactor::Reactor;
use crate::timer::{Timer, TimerEvent};

pub type EvictFn<T> = Box<dyn Fn(Arc<T>) + Send + Sync + 'static>;

/// Registration of one connection in a bucket
pub struct Slot<T> {
    weak: Weak<T>,
    cb: EvictFn<T>,
}

impl<T> Slot<T> {
    pub fn new<F>(weak: Weak<T>, cb: F) -> Arc<Slot<T>>
    where
        F: Fn(Arc<T>) + Send + Sync + 'static,
    {
        Arc::new(Slot {
            weak,
            cb: Box::new(cb),
        })
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.weak.upgrade() {
            (self.cb)(conn);
        }
    }
}

type Buckets<T> = Arc<Mutex<VecDeque<Vec<Arc<Slot<T>>>>>>;

fn lock<T>(buckets: &Mutex<VecDeque<Vec<Arc<Slot<T>>>>>) -> MutexGuard<'_, VecDeque<Vec<Arc<Slot<T>>>>> {
    match buckets.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn rotate_buckets<T>(buckets: &Mutex<VecDeque<Vec<Arc<Slot<T>>>>>) {
    let expired = {
        let mut wheel = lock(buckets);
        let expired = wheel.pop_front();
        wheel.push_back(Vec::new());
        expired
    };
    // eviction callbacks run without the wheel lock held
    if let Some(expired) = expired {
        ktrace!("time wheel rotated, {} slots released", expired.len());
        drop(expired);
    }
}

pub struct TimeWheel<T: Send + Sync + 'static> {
    buckets: Buckets<T>,
    bucket_count: usize,
    interval: Duration,
    timer: Arc<Timer>,
    event: Arc<TimerEvent>,
}

impl<T: Send + Sync + 'static> TimeWheel<T> {
    /// Wheel of `bucket_count` buckets rotated every `interval` by the
    /// timer of `reactor`
    pub fn new(reactor: &Arc<Reactor>, bucket_count: usize, interval: Duration) -> Self {
        let bucket_count = bucket_count.max(1);
        let buckets: Buckets<T> = Arc::new(Mutex::new(
            (0..bucket_count).map(|_| Vec::new()).collect(),
        ));

        let weak = Arc::downgrade(&buckets);
        let event = TimerEvent::new(interval.as_millis() as i64, true, move || {
            if let Some(buckets) = weak.upgrade() {
                rotate_buckets(&buckets);
            }
        });
        let timer = reactor.get_timer();
        timer.add_timer_event(Arc::clone(&event), true);
        kdebug!(
            "time wheel started, {} buckets every {:?}",
            bucket_count,
            interval
        );

        Self {
            buckets,
            bucket_count,
            interval,
            timer,
            event,
        }
    }

    /// Wheel sized from the runtime configuration
    pub fn from_config(reactor: &Arc<Reactor>) -> Self {
        let cfg = config::global();
        Self::new(reactor, cfg.wheel_buckets, cfg.wheel_interval)
    }

    /// Register `slot` in the newest bucket
    pub fn fresh(&self, slot: Arc<Slot<T>>) {
        let mut wheel = lock(&self.buckets);
        if let Some(tail) = wheel.back_mut() {
            tail.push(slot);
        }
    }

    /// Drop the oldest bucket and open a new one. The timer does this every
    /// interval.
    pub fn rotate(&self) {
        rotate_buckets(&self.buckets);
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Slots currently held across all buckets
    pub fn slot_count(&self) -> usize {
        lock(&self.buckets).iter().map(Vec::len).sum()
    }
}

impl<T: Send + Sync + 'static> Drop for TimeWheel<T> {
    fn drop(&mut self) {
        self.timer.del_timer_event(&self.event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corio_core::ReactorType;
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    struct Conn {
        evicted: AtomicUsize,
    }

    fn conn() -> Arc<Conn> {
        Arc::new(Conn {
            evicted: AtomicUsize::new(0),
        })
    }

    fn slot(c: &Arc<Conn>) -> Arc<Slot<Conn>> {
        Slot::new(Arc::downgrade(c), |c: Arc<Conn>| {
            c.evicted.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn idle_wheel(buckets: usize) -> TimeWheel<Conn> {
        // long interval: the tests rotate by hand
        TimeWheel::new(&Reactor::get_reactor(), buckets, Duration::from_secs(3600))
    }

    #[test]
    fn test_unrefreshed_connection_evicted_once() {
        let wheel = idle_wheel(3);
        let c = conn();
        wheel.fresh(slot(&c));

        wheel.rotate();
        wheel.rotate();
        assert_eq!(c.evicted.load(Ordering::SeqCst), 0);
        wheel.rotate();
        assert_eq!(c.evicted.load(Ordering::SeqCst), 1);
        for _ in 0..5 {
            wheel.rotate();
        }
        assert_eq!(c.evicted.load(Ordering::SeqCst), 1);
        assert_eq!(wheel.slot_count(), 0);
    }

    #[test]
    fn test_refreshed_connection_survives() {
        let wheel = idle_wheel(3);
        let c = conn();
        wheel.fresh(slot(&c));
        for _ in 0..20 {
            wheel.rotate();
            wheel.fresh(slot(&c));
        }
        assert_eq!(c.evicted.load(Ordering::SeqCst), 0);

        // only the last of several slots triggers eviction
        for _ in 0..3 {
            wheel.rotate();
        }
        assert_eq!(c.evicted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dead_connection_not_evicted() {
        let wheel = idle_wheel(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let c = conn();
        let h = hits.clone();
        wheel.fresh(Slot::new(Arc::downgrade(&c), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        drop(c);
        wheel.rotate();
        wheel.rotate();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_removes_timer_event() {
        let reactor = Reactor::get_reactor();
        let timer = reactor.get_timer();
        let before = timer.len();
        let wheel: TimeWheel<Conn> = TimeWheel::new(&reactor, 2, Duration::from_secs(3600));
        assert_eq!(timer.len(), before + 1);
        drop(wheel);
        assert_eq!(timer.len(), before);
    }

    #[test]
    #[serial]
    fn test_timer_driven_eviction() {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let reactor = Reactor::get_reactor();
            reactor.set_reactor_type(ReactorType::Accepting);
            tx.send(Arc::clone(&reactor)).unwrap();
            reactor.run_loop();
        });
        let reactor = rx.recv().unwrap();

        let wheel = TimeWheel::new(&reactor, 2, Duration::from_millis(10));
        let (evict_tx, evict_rx) = mpsc::channel();
        let evict_tx = Mutex::new(evict_tx);
        let c = conn();
        wheel.fresh(Slot::new(Arc::downgrade(&c), move |_: Arc<Conn>| {
            let _ = evict_tx.lock().unwrap().send(());
        }));
        assert!(evict_rx.recv_timeout(Duration::from_secs(5)).is_ok());

        drop(wheel);
        reactor.stop();
        handle.join().unwrap();
    }
}
