use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::state::{
    DeduplicationStore, DistributedLock, GuardInner, LockGuard, ResultStore, DEDUP_PREFIX,
    LOCK_PREFIX, RESULT_PREFIX,
};

// Atomically release only if we still own the lock.
const UNLOCK_SCRIPT: &str =
    r#"if redis.call("get", KEYS[1]) == ARGV[1] then return redis.call("del", KEYS[1]) else return 0 end"#;
// Extend the TTL only if we still own the lock.
const EXTEND_SCRIPT: &str =
    r#"if redis.call("get", KEYS[1]) == ARGV[1] then return redis.call("expire", KEYS[1], ARGV[2]) else return 0 end"#;

const ACQUIRE_BASE_DELAY: Duration = Duration::from_millis(10);
const ACQUIRE_MAX_DELAY: Duration = Duration::from_secs(1);

/// Connect to a Redis endpoint by URL.
pub async fn connect_url(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url).context("invalid Redis URL")?;
    let conn = ConnectionManager::new(client)
        .await
        .context("Redis connection failed")?;
    Ok(conn)
}

/// Connect using either `REDIS_URL` or the TLS host/port pair.
pub async fn connect(config: &Config) -> Result<ConnectionManager> {
    let url = if !config.redis_url.is_empty() {
        config.redis_url.clone()
    } else {
        format!("rediss://{}:{}/", config.redis_host, config.redis_port)
    };
    connect_url(&url).await
}

// ── Dedup ────────────────────────────────────────────────────────────────

/// Redis-backed deduplication via `SET` + TTL. Connection failures degrade:
/// `is_seen` answers false (tolerate rare duplicates), `mark_seen` is
/// best-effort.
pub struct RedisDedup {
    conn: ConnectionManager,
}

impl RedisDedup {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DeduplicationStore for RedisDedup {
    async fn is_seen(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = redis::cmd("EXISTS")
            .arg(format!("{DEDUP_PREFIX}{key}"))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(n) => n > 0,
            Err(e) => {
                warn!(key, error = %e, "dedup store unreachable on is_seen");
                false
            }
        }
    }

    async fn mark_seen(&self, key: &str, ttl_seconds: u64) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(format!("{DEDUP_PREFIX}{key}"))
            .arg("1")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(key, error = %e, "dedup store unreachable on mark_seen");
        }
    }
}

// ── Results ──────────────────────────────────────────────────────────────

/// Redis-backed task result store with the same graceful degradation.
pub struct RedisResultStore {
    conn: ConnectionManager,
}

impl RedisResultStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<String>> = redis::cmd("GET")
            .arg(format!("{RESULT_PREFIX}{key}"))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "result store unreachable on get");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(format!("{RESULT_PREFIX}{key}"))
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(key, error = %e, "result store unreachable on set");
        }
    }
}

// ── Lock ─────────────────────────────────────────────────────────────────

/// Distributed lock via `SET NX EX` (single-instance Redlock): spin-acquire
/// with capped exponential backoff, random token, Lua compare-and-delete
/// release, and a renewal task extending the lease at half the TTL.
pub struct RedisLock {
    conn: ConnectionManager,
}

impl RedisLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, ttl_seconds: u64) -> LockGuard {
        let lock_key = format!("{LOCK_PREFIX}{key}");
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let mut delay = ACQUIRE_BASE_DELAY;

        loop {
            let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
                .arg(&lock_key)
                .arg(&token)
                .arg("NX")
                .arg("EX")
                .arg(ttl_seconds)
                .query_async(&mut conn)
                .await;
            match result {
                Ok(Some(_)) => break,
                Ok(None) => {}
                Err(e) => warn!(key = %lock_key, error = %e, "lock acquire attempt failed"),
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(ACQUIRE_MAX_DELAY);
        }
        debug!(key = %lock_key, ttl_seconds, "lock acquired");

        let renewal = tokio::spawn(renew_loop(
            self.conn.clone(),
            lock_key.clone(),
            token.clone(),
            ttl_seconds,
        ));

        LockGuard {
            inner: GuardInner::Redis(RedisLockGuard {
                conn: self.conn.clone(),
                lock_key,
                token,
                renewal,
            }),
        }
    }
}

/// Periodically extend the lease while the guard is alive. A failed renewal
/// logs and stops; the critical section is not interrupted.
async fn renew_loop(mut conn: ConnectionManager, lock_key: String, token: String, ttl_seconds: u64) {
    let interval = Duration::from_secs((ttl_seconds / 2).max(1));
    loop {
        tokio::time::sleep(interval).await;
        let result: redis::RedisResult<i64> = Script::new(EXTEND_SCRIPT)
            .key(&lock_key)
            .arg(&token)
            .arg(ttl_seconds)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(_) => {}
            Err(e) => {
                warn!(key = %lock_key, error = %e, "lock renewal failed");
                return;
            }
        }
    }
}

pub(crate) struct RedisLockGuard {
    conn: ConnectionManager,
    lock_key: String,
    token: String,
    renewal: JoinHandle<()>,
}

impl Drop for RedisLockGuard {
    // Must drop inside the tokio runtime: release fires on a spawned task.
    fn drop(&mut self) {
        self.renewal.abort();
        let mut conn = self.conn.clone();
        let lock_key = std::mem::take(&mut self.lock_key);
        let token = std::mem::take(&mut self.token);
        tokio::spawn(async move {
            let result: redis::RedisResult<i64> = Script::new(UNLOCK_SCRIPT)
                .key(&lock_key)
                .arg(&token)
                .invoke_async(&mut conn)
                .await;
            match result {
                Ok(released) => debug!(key = %lock_key, released, "lock released"),
                Err(e) => warn!(key = %lock_key, error = %e, "lock release failed"),
            }
        });
    }
}
