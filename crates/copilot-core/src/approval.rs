use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tracing::warn;

use crate::config::{Config, StateBackend};
use crate::state_redis;

const APPROVAL_PREFIX: &str = "approval:";

/// A `/copilot` command parked until a second reviewer approves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub task_id: String,
    /// User who issued the command; cannot approve their own request.
    pub requester_id: u64,
    pub prompt: String,
    pub project_id: u64,
    pub mr_iid: u64,
    /// Unix timestamp.
    pub created_at: i64,
    pub timeout_s: u64,
}

/// Storage for pending approvals. Expired entries are invisible and never
/// executed.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn store(&self, approval: &PendingApproval);
    async fn get(&self, project_id: u64, mr_iid: u64) -> Option<PendingApproval>;
    async fn delete(&self, project_id: u64, mr_iid: u64);
}

fn approval_key(project_id: u64, mr_iid: u64) -> String {
    format!("{project_id}:{mr_iid}")
}

#[derive(Default)]
pub struct MemoryApprovalStore {
    inner: TokioMutex<HashMap<String, (PendingApproval, Instant)>>,
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn store(&self, approval: &PendingApproval) {
        let key = approval_key(approval.project_id, approval.mr_iid);
        let expires_at = Instant::now() + Duration::from_secs(approval.timeout_s);
        self.inner
            .lock()
            .await
            .insert(key, (approval.clone(), expires_at));
    }

    async fn get(&self, project_id: u64, mr_iid: u64) -> Option<PendingApproval> {
        let key = approval_key(project_id, mr_iid);
        let mut map = self.inner.lock().await;
        match map.get(&key) {
            Some((_, expires_at)) if Instant::now() > *expires_at => {
                map.remove(&key);
                None
            }
            Some((approval, _)) => Some(approval.clone()),
            None => None,
        }
    }

    async fn delete(&self, project_id: u64, mr_iid: u64) {
        self.inner
            .lock()
            .await
            .remove(&approval_key(project_id, mr_iid));
    }
}

pub struct RedisApprovalStore {
    conn: ConnectionManager,
}

#[async_trait]
impl ApprovalStore for RedisApprovalStore {
    async fn store(&self, approval: &PendingApproval) {
        let Ok(value) = serde_json::to_string(approval) else {
            return;
        };
        let key = format!(
            "{APPROVAL_PREFIX}{}",
            approval_key(approval.project_id, approval.mr_iid)
        );
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("EX")
            .arg(approval.timeout_s)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(key, error = %e, "approval store unreachable on store");
        }
    }

    async fn get(&self, project_id: u64, mr_iid: u64) -> Option<PendingApproval> {
        let key = format!("{APPROVAL_PREFIX}{}", approval_key(project_id, mr_iid));
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<String>> =
            redis::cmd("GET").arg(&key).query_async(&mut conn).await;
        match result {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "approval store unreachable on get");
                None
            }
        }
    }

    async fn delete(&self, project_id: u64, mr_iid: u64) {
        let key = format!("{APPROVAL_PREFIX}{}", approval_key(project_id, mr_iid));
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> =
            redis::cmd("DEL").arg(&key).query_async(&mut conn).await;
        if let Err(e) = result {
            warn!(key, error = %e, "approval store unreachable on delete");
        }
    }
}

pub async fn create_approval_store(config: &Config) -> Result<Arc<dyn ApprovalStore>> {
    match config.state_backend {
        StateBackend::Redis => {
            let conn = state_redis::connect(config).await?;
            Ok(Arc::new(RedisApprovalStore { conn }))
        }
        StateBackend::Memory => Ok(Arc::new(MemoryApprovalStore::default())),
    }
}
