use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use copilot_core::config::Config;
use copilot_core::executor::{parse_result, TaskExecutor, RESULT_TTL_SECONDS};
use copilot_core::state::ResultStore;
use copilot_core::types::{TaskKind, TaskResult, TaskSpec};
use tracing::debug;

use crate::session::CopilotSession;

/// Runs agent sessions directly in the service process.
///
/// Expects `task.repo_path` to point at a local checkout. Coding results
/// carry no patch; the files are already on disk.
pub struct LocalExecutor {
    session: CopilotSession,
    store: Arc<dyn ResultStore>,
}

impl LocalExecutor {
    pub fn new(config: &Config, store: Arc<dyn ResultStore>) -> Self {
        Self {
            session: CopilotSession::from_config(config),
            store,
        }
    }
}

#[async_trait]
impl TaskExecutor for LocalExecutor {
    async fn execute(&self, task: &TaskSpec) -> Result<TaskResult> {
        if let Some(cached) = self.store.get(&task.task_id).await {
            debug!(task_id = %task.task_id, "returning cached result");
            return Ok(parse_result(&cached, task.kind));
        }

        let repo_path = task
            .repo_path
            .as_deref()
            .ok_or_else(|| anyhow!("in-process executor requires task.repo_path"))?;

        let summary = self
            .session
            .run(repo_path, &task.system_prompt, &task.user_prompt)
            .await?;

        let result = match task.kind {
            TaskKind::Review => TaskResult::Review { summary },
            TaskKind::Coding => TaskResult::Coding {
                summary,
                patch: String::new(),
                base_sha: String::new(),
            },
        };
        if let Ok(serialized) = serde_json::to_string(&result) {
            self.store
                .set(&task.task_id, &serialized, RESULT_TTL_SECONDS)
                .await;
        }
        Ok(result)
    }
}
