//! Basic corio example
//!
//! Resumes a coroutine by hand on the main thread, then spawns coroutines
//! on the io threads that sleep and take turns on a shared
//! [`CoroutineMutex`].
//!
//! # Environment Variables
//!
//! - `COR_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `COR_IO_THREADS=4` - Number of working reactors
//! - `COR_HOOK=0` - Disable the syscall hooks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use corio::{
    co_sleep_ms, get_coroutine_pool, get_current_coroutine, kdebug, kfatal, kinfo, resume,
    yield_now, CoroutineMutex, Runtime,
};

const WORKERS: usize = 6;
const ROUNDS: usize = 3;

// COR_LOG_LEVEL=debug cargo run -p corio-basic
fn main() {
    println!("=== corio basic example ===\n");

    let mut runtime = match Runtime::from_env() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("basic: {}", e);
            std::process::exit(1);
        }
    };

    // Manual resume/yield: the main thread is the scheduler here
    let cor = match get_coroutine_pool().get_coroutine_instance() {
        Ok(cor) => cor,
        Err(e) => kfatal!("no coroutine: {}", e),
    };
    cor.set_callback(|| {
        for step in 0..3 {
            kinfo!("[{}] step {}", get_current_coroutine().id(), step);
            yield_now();
        }
    });
    while cor.can_resume() {
        resume(&cor);
        kdebug!("back on main, state {:?}", cor.state());
    }
    get_coroutine_pool().return_coroutine(cor);

    runtime.start();

    let mutex = Arc::new(CoroutineMutex::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    for i in 0..WORKERS {
        let mutex = Arc::clone(&mutex);
        let counter = Arc::clone(&counter);
        let tx = tx.clone();
        let spawned = runtime.spawn(move || {
            for round in 0..ROUNDS {
                co_sleep_ms(10 * (i as u64 + 1));
                let _guard = mutex.guard();
                // the holder may suspend; no one else enters meanwhile
                let before = counter.load(Ordering::Relaxed);
                co_sleep_ms(1);
                counter.store(before + 1, Ordering::Relaxed);
                kdebug!("worker {} round {} -> {}", i, round, before + 1);
            }
            let _ = tx.send(i);
        });
        if let Err(e) = spawned {
            kfatal!("spawn worker {}: {}", i, e);
        }
    }
    drop(tx);

    for _ in 0..WORKERS {
        match rx.recv_timeout(Duration::from_secs(10)) {
            Ok(i) => kinfo!("worker {} done", i),
            Err(e) => kfatal!("workers stalled: {}", e),
        }
    }

    let total = counter.load(Ordering::Relaxed);
    println!("\ncounter = {} (expected {})", total, WORKERS * ROUNDS);
    runtime.shutdown();
    println!("=== done ===");
}
