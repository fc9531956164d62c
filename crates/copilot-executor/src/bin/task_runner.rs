//! One-shot worker entrypoint for remote job executions.
//!
//! Reads the task from the environment contract, clones the repo, runs the
//! agent session, and hands the serialized result back through the result
//! store (or stdout), then exits.

use anyhow::{anyhow, bail, Context, Result};
use copilot_core::executor::RESULT_TTL_SECONDS;
use copilot_core::git::Git;
use copilot_core::state::ResultStore;
use copilot_core::state_redis::{self, RedisResultStore};
use copilot_core::types::{TaskKind, TaskResult};
use copilot_core::workspace;
use copilot_executor::session::CopilotSession;
use serde_json::Value;
use tracing::{error, info};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("required environment variable {key} is not set"))
}

fn session_from_env() -> CopilotSession {
    CopilotSession {
        copilot_bin: env_or("COPILOT_BIN", "copilot"),
        model: env_or("COPILOT_MODEL", "gpt-4"),
        timeout_s: env_or("COPILOT_TIMEOUT", "300").parse().unwrap_or(300),
        github_token: env_or("GITHUB_TOKEN", ""),
        provider_type: env_or("COPILOT_PROVIDER_TYPE", ""),
        provider_base_url: env_or("COPILOT_PROVIDER_BASE_URL", ""),
        provider_api_key: env_or("COPILOT_PROVIDER_API_KEY", ""),
    }
}

async fn write_result(task_id: &str, result: &TaskResult) -> Result<()> {
    let serialized = serde_json::to_string(result).context("serialize result")?;
    let backend = env_or("RESULT_BACKEND", "stdout");
    if backend == "redis" {
        let redis_url = required_env("REDIS_URL")
            .context("REDIS_URL is required when RESULT_BACKEND=redis")?;
        let conn = state_redis::connect_url(&redis_url).await?;
        let store = RedisResultStore::new(conn);
        store.set(task_id, &serialized, RESULT_TTL_SECONDS).await;
        info!(task_id, backend = "redis", "result written");
    } else {
        println!("{serialized}");
        info!(task_id, backend = "stdout", "result written");
    }
    Ok(())
}

async fn run_task() -> Result<()> {
    let task_type = required_env("TASK_TYPE")?;
    let task_id = required_env("TASK_ID")?;
    let repo_url = required_env("REPO_URL")?;
    let branch = required_env("BRANCH")?;
    let gitlab_token = env_or("GITLAB_TOKEN", "");

    let kind = match task_type.as_str() {
        "review" => TaskKind::Review,
        "coding" => TaskKind::Coding,
        other => bail!("invalid TASK_TYPE {other:?} (expected review or coding)"),
    };

    // Prompts arrive as dedicated vars, with the JSON payload as fallback.
    let payload: Value = serde_json::from_str(&env_or("TASK_PAYLOAD", "{}"))
        .context("TASK_PAYLOAD is not valid JSON")?;
    let system_prompt = env_or(
        "SYSTEM_PROMPT",
        payload["system_prompt"].as_str().unwrap_or(""),
    );
    let user_prompt = env_or("USER_PROMPT", payload["user_prompt"].as_str().unwrap_or(""));
    if user_prompt.is_empty() {
        bail!("no user prompt provided");
    }

    info!(task_id, task_type, branch, "task started");

    let ws = workspace::clone_with_retries(&repo_url, &branch, &gitlab_token, "", 3, 5).await?;
    let git = Git::new(ws.path(), &gitlab_token);
    let base_sha = git.head_sha().await?;

    let session = session_from_env();
    let summary = session.run(ws.path(), &system_prompt, &user_prompt).await?;

    let result = match kind {
        TaskKind::Review => TaskResult::Review { summary },
        TaskKind::Coding => {
            // Capture everything the agent touched as a binary-safe patch;
            // the dispatcher applies it against its own clone.
            git.stage_all().await?;
            let patch = git.diff_cached_binary().await?;
            TaskResult::Coding {
                summary,
                patch,
                base_sha,
            }
        }
    };

    write_result(&task_id, &result).await?;
    info!(task_id, "task completed");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "copilot_executor=info,copilot_core=info".into()),
        )
        .init();

    if let Err(e) = run_task().await {
        error!("task failed: {e:#}");
        std::process::exit(1);
    }
}
