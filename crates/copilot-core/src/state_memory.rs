use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;
use tracing::warn;

use crate::state::{DeduplicationStore, DistributedLock, GuardInner, LockGuard, ResultStore};

const DEFAULT_MAX_LOCKS: usize = 1024;
const DEFAULT_MAX_ENTRIES: usize = 10_000;

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

/// Insertion-ordered map with optional per-entry TTL and oldest-half
/// eviction. Shared plumbing for the in-memory dedup and result stores.
struct OrderedTtlMap<V> {
    entries: HashMap<String, Entry<V>>,
    order: VecDeque<String>,
}

impl<V> OrderedTtlMap<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<&V> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|d| Instant::now() > d),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|e| &e.value)
    }

    fn insert(&mut self, key: &str, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| Instant::now() + d);
        if self
            .entries
            .insert(key.to_string(), Entry { value, expires_at })
            .is_none()
        {
            self.order.push_back(key.to_string());
        }
    }

    /// Evict the oldest half of entries once max_size is exceeded.
    /// Returns the evicted count.
    fn evict_if_needed(&mut self, max_size: usize) -> usize {
        if self.entries.len() <= max_size {
            return 0;
        }
        let target = max_size / 2;
        let mut evicted = 0;
        while self.entries.len() > target {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Dedup ────────────────────────────────────────────────────────────────

pub struct MemoryDedup {
    max_size: usize,
    inner: TokioMutex<OrderedTtlMap<()>>,
}

impl MemoryDedup {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: TokioMutex::new(OrderedTtlMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for MemoryDedup {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl DeduplicationStore for MemoryDedup {
    async fn is_seen(&self, key: &str) -> bool {
        self.inner.lock().await.get(key).is_some()
    }

    async fn mark_seen(&self, key: &str, ttl_seconds: u64) {
        let mut map = self.inner.lock().await;
        map.insert(key, (), Some(Duration::from_secs(ttl_seconds)));
        let evicted = map.evict_if_needed(self.max_size);
        if evicted > 0 {
            warn!(
                evicted,
                retained = map.len(),
                max_size = self.max_size,
                "dedup store evicted oldest entries"
            );
        }
    }
}

// ── Results ──────────────────────────────────────────────────────────────

pub struct MemoryResultStore {
    max_size: usize,
    inner: TokioMutex<OrderedTtlMap<String>>,
}

impl MemoryResultStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: TokioMutex::new(OrderedTtlMap::new()),
        }
    }
}

impl Default for MemoryResultStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) {
        let mut map = self.inner.lock().await;
        map.insert(
            key,
            value.to_string(),
            Some(Duration::from_secs(ttl_seconds)),
        );
        let evicted = map.evict_if_needed(self.max_size);
        if evicted > 0 {
            warn!(
                evicted,
                retained = map.len(),
                max_size = self.max_size,
                "result store evicted oldest entries"
            );
        }
    }
}

// ── Locks ────────────────────────────────────────────────────────────────

struct LockTable {
    locks: HashMap<String, Arc<TokioMutex<()>>>,
    order: VecDeque<String>,
}

/// In-memory per-key mutexes with LRU eviction. Held locks are never
/// evicted; the TTL is meaningless within one process and ignored.
pub struct MemoryLock {
    max_size: usize,
    inner: TokioMutex<LockTable>,
}

impl MemoryLock {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: TokioMutex::new(LockTable {
                locks: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.locks.len()
    }
}

impl Default for MemoryLock {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOCKS)
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str, _ttl_seconds: u64) -> LockGuard {
        let lock = {
            let mut table = self.inner.lock().await;
            let lock = table
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone();
            table.order.retain(|k| k != key);
            table.order.push_back(key.to_string());

            if table.locks.len() > self.max_size {
                let mut evicted = 0;
                let candidates: Vec<String> = table.order.iter().cloned().collect();
                for candidate in candidates {
                    if table.locks.len() <= self.max_size {
                        break;
                    }
                    if candidate == key {
                        continue;
                    }
                    let safe = table
                        .locks
                        .get(&candidate)
                        // Only the table holds it, and nothing has it locked.
                        .map(|l| Arc::strong_count(l) == 1 && l.try_lock().is_ok())
                        .unwrap_or(false);
                    if safe {
                        table.locks.remove(&candidate);
                        table.order.retain(|k| k != &candidate);
                        evicted += 1;
                    }
                }
                if evicted > 0 {
                    warn!(
                        evicted,
                        retained = table.locks.len(),
                        max_size = self.max_size,
                        "lock table evicted unheld entries"
                    );
                }
            }
            lock
        };

        let guard = lock.lock_owned().await;
        LockGuard {
            inner: GuardInner::Memory(guard),
        }
    }
}

// ── Processed-key trackers ───────────────────────────────────────────────

/// Bounded in-memory set of processed keys (issue keys, reviewed MRs).
/// Restart clears it; the workflow status transition keeps already-picked
/// issues out of the trigger query.
pub struct ProcessedSet {
    max_size: usize,
    inner: std::sync::Mutex<OrderedTtlMap<()>>,
}

impl ProcessedSet {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: std::sync::Mutex::new(OrderedTtlMap::new()),
        }
    }

    pub fn is_processed(&self, key: &str) -> bool {
        match self.inner.lock() {
            Ok(mut map) => map.get(key).is_some(),
            Err(_) => false,
        }
    }

    pub fn mark(&self, key: &str) {
        let Ok(mut map) = self.inner.lock() else {
            return;
        };
        map.insert(key, (), None);
        let evicted = map.evict_if_needed(self.max_size);
        if evicted > 0 {
            warn!(
                evicted,
                retained = map.len(),
                max_size = self.max_size,
                "processed set evicted oldest entries"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessedSet {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}
