//! Coroutine pool
//!
//! Keeps `pool_size` warm coroutines whose stacks live in one arena
//! region. When all of them are checked out, overflow coroutines are built
//! on blocks of additional regions. Overflow coroutines are transient:
//! their stack block goes back to its region when the last handle is
//! dropped.

use std::sync::{Arc, Mutex, OnceLock};

use corio_core::{kdebug, kfatal, kwarn, CoError, CoResult, MemoryError};

use crate::config;
use crate::coroutine::Coroutine;
use crate::memory::{Memory, Stack};

struct PoolInner {
    /// Warm coroutines and their checked-out flag, indexed by pool slot
    free: Vec<(Arc<Coroutine>, bool)>,
    /// Region 0 backs the warm coroutines, the rest serve overflow
    memory: Vec<Arc<Memory>>,
}

pub struct CoroutinePool {
    pool_size: usize,
    stack_size: usize,
    inner: Mutex<PoolInner>,
}

impl CoroutinePool {
    /// Map one region and pre-create `pool_size` coroutines on it
    pub fn new(pool_size: usize, stack_size: usize) -> CoResult<Self> {
        if pool_size == 0 {
            return Err(CoError::Config("pool_size must be > 0"));
        }
        let memory = Arc::new(Memory::new(stack_size, pool_size)?);
        let mut free = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let stack = Stack::from_arena(&memory).ok_or(MemoryError::Exhausted)?;
            free.push((Coroutine::with_index(stack, i as isize), false));
        }
        kdebug!("coroutine pool ready, {} x {} bytes", pool_size, stack_size);

        Ok(Self {
            pool_size,
            stack_size,
            inner: Mutex::new(PoolInner {
                free,
                memory: vec![memory],
            }),
        })
    }

    /// Check out a coroutine.
    ///
    /// Prefers an idle warm coroutine; otherwise builds an unpooled one on
    /// a free overflow block, mapping a new region when every region is
    /// full. Only fails when that mapping fails.
    pub fn get_coroutine_instance(&self) -> CoResult<Arc<Coroutine>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| CoError::WrongContext("coroutine pool lock poisoned"))?;

        for (cor, checked_out) in inner.free.iter_mut() {
            if !*checked_out && !cor.is_in_cofunc() {
                *checked_out = true;
                return Ok(Arc::clone(cor));
            }
        }

        for memory in inner.memory.iter().skip(1) {
            if let Some(stack) = Stack::from_arena(memory) {
                return Ok(Coroutine::new(stack));
            }
        }

        let memory = Arc::new(Memory::new(self.stack_size, self.pool_size)?);
        let stack = Stack::from_arena(&memory).ok_or(MemoryError::Exhausted)?;
        inner.memory.push(memory);
        kwarn!(
            "coroutine pool exhausted, mapped overflow region #{}",
            inner.memory.len() - 1
        );
        Ok(Coroutine::new(stack))
    }

    /// Hand a coroutine back.
    ///
    /// Warm coroutines become available again. Unpooled ones are released;
    /// their stack block returns to its region once no handle is left.
    pub fn return_coroutine(&self, cor: Arc<Coroutine>) {
        let index = cor.index();
        if index < 0 {
            kdebug!("releasing unpooled coroutine {}", cor.id());
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.free.get_mut(index as usize) {
            Some((warm, checked_out)) if Arc::ptr_eq(warm, &cor) => *checked_out = false,
            _ => kwarn!("return_coroutine: coroutine {} does not belong to this pool", cor.id()),
        }
    }

    #[inline]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Warm coroutines currently checked out
    pub fn checked_out(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.free.iter().filter(|(_, used)| *used).count())
            .unwrap_or(0)
    }

    /// Overflow stack blocks currently held by live unpooled coroutines
    pub fn overflow_in_use(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.memory.iter().skip(1).map(|m| m.ref_count()).sum())
            .unwrap_or(0)
    }
}

static POOL: OnceLock<CoroutinePool> = OnceLock::new();

/// Process-wide pool sized from the runtime configuration
pub fn get_coroutine_pool() -> &'static CoroutinePool {
    POOL.get_or_init(|| {
        let cfg = config::global();
        match CoroutinePool::new(cfg.pool_size, cfg.stack_size) {
            Ok(pool) => pool,
            Err(e) => kfatal!("cannot create coroutine pool: {}", e),
        }
    })
}
