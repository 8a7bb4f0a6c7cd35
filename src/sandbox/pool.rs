use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info};

use super::isolate::IsolatedEnvironment;
use super::limits::{ContextLimits, MAX_POOL_SIZE};
use crate::error::Result;

/// Counters describing pool traffic since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Environments currently idle in the pool
    pub pooled: usize,
    pub created: u64,
    pub reused: u64,
    pub disposed: u64,
}

/// Bounded collection of idle, reusable environments.
///
/// Idle environments are matched to requests by memory ceiling, newest
/// first. The pool never holds more than [`MAX_POOL_SIZE`] entries.
pub struct IsolatePool {
    idle: Mutex<Vec<IsolatedEnvironment>>,
    limits: ContextLimits,
    next_id: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    disposed: AtomicU64,
    drained: AtomicBool,
}

impl IsolatePool {
    pub fn new(limits: ContextLimits) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
            limits,
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
            drained: AtomicBool::new(false),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<IsolatedEnvironment>> {
        // a panic while holding the lock cannot leave the Vec half-updated
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check out an environment with the given ceiling.
    pub fn acquire(&self, memory_limit_mb: u32) -> Result<IsolatedEnvironment> {
        let reused = {
            let mut idle = self.idle();
            let matching = idle
                .iter()
                .rposition(|env| env.memory_limit_mb() == memory_limit_mb);
            matching.map(|index| idle.remove(index))
        };

        if let Some(env) = reused {
            self.reused.fetch_add(1, Ordering::Relaxed);
            debug!(isolate_id = env.id(), memory_limit_mb, "reusing pooled environment");
            return Ok(env);
        }

        self.create(memory_limit_mb)
    }

    /// Build a fresh environment that bypasses the idle list.
    pub fn create(&self, memory_limit_mb: u32) -> Result<IsolatedEnvironment> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let env = IsolatedEnvironment::spawn(id, memory_limit_mb, self.limits)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(env)
    }

    /// Return a healthy environment. It is disposed instead when the pool is
    /// full, drained, or the environment is already torn down.
    pub fn release(&self, env: IsolatedEnvironment) {
        if env.is_disposed() {
            self.disposed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.is_drained() {
            self.dispose(env);
            return;
        }

        let overflow = {
            let mut idle = self.idle();
            if idle.len() < MAX_POOL_SIZE {
                debug!(isolate_id = env.id(), pooled = idle.len() + 1, "environment returned to pool");
                idle.push(env);
                None
            } else {
                Some(env)
            }
        };

        if let Some(env) = overflow {
            debug!(isolate_id = env.id(), "pool full, disposing environment");
            self.dispose(env);
        }
    }

    /// Tear down an environment that must not be reused.
    pub fn dispose(&self, mut env: IsolatedEnvironment) {
        env.dispose();
        self.disposed.fetch_add(1, Ordering::Relaxed);
    }

    /// Dispose every idle environment and stop pooling. Returns how many were
    /// torn down; repeated calls return 0.
    pub fn drain_all(&self) -> usize {
        self.drained.store(true, Ordering::Release);
        let drained: Vec<IsolatedEnvironment> = std::mem::take(&mut *self.idle());
        let count = drained.len();
        for mut env in drained {
            env.dispose_and_join();
            self.disposed.fetch_add(1, Ordering::Relaxed);
        }
        if count > 0 {
            info!(count, "drained environment pool");
        }
        count
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pooled: self.idle().len(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for IsolatePool {
    fn drop(&mut self) {
        self.drain_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_caps_at_five() {
        let pool = IsolatePool::new(ContextLimits::default());
        let envs: Vec<_> = (0..6).map(|_| pool.acquire(32).unwrap()).collect();
        assert_eq!(pool.stats().created, 6);

        for env in envs {
            pool.release(env);
        }

        let stats = pool.stats();
        assert_eq!(stats.pooled, MAX_POOL_SIZE);
        assert_eq!(stats.disposed, 1);
    }

    #[test]
    fn test_acquire_reuses_most_recent_with_same_ceiling() {
        let pool = IsolatePool::new(ContextLimits::default());
        let first = pool.acquire(32).unwrap();
        let second = pool.acquire(32).unwrap();
        let other = pool.acquire(64).unwrap();
        let second_id = second.id();
        let other_id = other.id();

        pool.release(first);
        pool.release(second);
        pool.release(other);

        let reused = pool.acquire(32).unwrap();
        assert_eq!(reused.id(), second_id);
        let reused_other = pool.acquire(64).unwrap();
        assert_eq!(reused_other.id(), other_id);
        assert_eq!(pool.stats().reused, 2);

        let fresh = pool.acquire(128).unwrap();
        assert_eq!(fresh.memory_limit_mb(), 128);
        assert_eq!(pool.stats().created, 4);
    }

    #[test]
    fn test_disposed_environment_is_not_pooled() {
        let pool = IsolatePool::new(ContextLimits::default());
        let mut env = pool.acquire(32).unwrap();
        env.dispose();
        pool.release(env);
        assert_eq!(pool.stats().pooled, 0);
        assert_eq!(pool.stats().disposed, 1);
    }

    #[test]
    fn test_drain_is_idempotent() {
        let pool = IsolatePool::new(ContextLimits::default());
        let a = pool.acquire(32).unwrap();
        let b = pool.acquire(32).unwrap();
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.drain_all(), 2);
        assert_eq!(pool.drain_all(), 0);
        assert_eq!(pool.stats().pooled, 0);

        let late = pool.acquire(32).unwrap();
        pool.release(late);
        assert_eq!(pool.stats().pooled, 0);
        assert!(pool.is_drained());
    }
}
