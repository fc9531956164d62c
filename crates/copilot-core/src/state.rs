use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::config::{Config, StateBackend};
use crate::state_memory::{MemoryDedup, MemoryLock, MemoryResultStore};
use crate::state_redis::{self, RedisDedup, RedisLock, RedisLockGuard, RedisResultStore};

// Key prefixes namespace the three store roles inside one backend.
pub const LOCK_PREFIX: &str = "lock:";
pub const DEDUP_PREFIX: &str = "dedup:";
pub const RESULT_PREFIX: &str = "result:";

/// Tracks whether keys have been seen. Backends may degrade gracefully:
/// `is_seen` tolerates occasional duplicates by answering false on
/// connectivity failure, and `mark_seen` is best-effort.
#[async_trait]
pub trait DeduplicationStore: Send + Sync {
    async fn is_seen(&self, key: &str) -> bool;
    async fn mark_seen(&self, key: &str, ttl_seconds: u64);
}

/// Hands task results from workers back to dispatchers. Same degradation
/// policy as the dedup store.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64);
}

/// Named mutexes with a lease TTL, serializing work per repository.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, key: &str, ttl_seconds: u64) -> LockGuard;
}

/// Scoped lock handle; the lease is released when the guard drops.
pub struct LockGuard {
    #[allow(dead_code)]
    pub(crate) inner: GuardInner,
}

// Held only for its drop behavior.
#[allow(dead_code)]
pub(crate) enum GuardInner {
    Memory(OwnedMutexGuard<()>),
    Redis(RedisLockGuard),
}

// ── Factories ────────────────────────────────────────────────────────────

pub async fn create_lock(config: &Config) -> Result<Arc<dyn DistributedLock>> {
    match config.state_backend {
        StateBackend::Redis => {
            let conn = state_redis::connect(config).await?;
            Ok(Arc::new(RedisLock::new(conn)))
        }
        StateBackend::Memory => Ok(Arc::new(MemoryLock::default())),
    }
}

pub async fn create_dedup(config: &Config) -> Result<Arc<dyn DeduplicationStore>> {
    match config.state_backend {
        StateBackend::Redis => {
            let conn = state_redis::connect(config).await?;
            Ok(Arc::new(RedisDedup::new(conn)))
        }
        StateBackend::Memory => Ok(Arc::new(MemoryDedup::default())),
    }
}

pub async fn create_result_store(config: &Config) -> Result<Arc<dyn ResultStore>> {
    match config.state_backend {
        StateBackend::Redis => {
            let conn = state_redis::connect(config).await?;
            Ok(Arc::new(RedisResultStore::new(conn)))
        }
        StateBackend::Memory => Ok(Arc::new(MemoryResultStore::default())),
    }
}
