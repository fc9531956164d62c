use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use copilot_core::config::Config;
use copilot_core::error::AgentError;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Env vars safe to forward to the agent subprocess. Service secrets
/// (GITLAB_TOKEN, JIRA_*, webhook secret) are deliberately not in this list.
const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "TERM", "TMPDIR", "USER"];

/// Runs the Copilot CLI as a subprocess against a local checkout and
/// collects the final assistant message from its stream-JSON output.
pub struct CopilotSession {
    /// Path to the `copilot` CLI binary.
    pub copilot_bin: String,
    pub model: String,
    /// Kill the subprocess and fail after this many seconds.
    pub timeout_s: u64,
    pub github_token: String,
    pub provider_type: String,
    pub provider_base_url: String,
    pub provider_api_key: String,
}

impl CopilotSession {
    pub fn from_config(config: &Config) -> Self {
        Self {
            copilot_bin: config.copilot_bin.clone(),
            model: config.copilot_model.clone(),
            timeout_s: config.copilot_timeout_s,
            github_token: config.github_token.clone(),
            provider_type: config.copilot_provider_type.clone(),
            provider_base_url: config.copilot_provider_base_url.clone(),
            provider_api_key: config.copilot_provider_api_key.clone(),
        }
    }

    /// Run one agent session and return the last assistant message.
    pub async fn run(
        &self,
        repo_path: &Path,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String> {
        let mut args: Vec<String> = vec![
            "--model".into(),
            self.model.clone(),
            "--output-format".into(),
            "stream-json".into(),
        ];
        if !system_prompt.is_empty() {
            args.push("--append-system-prompt".into());
            args.push(system_prompt.to_string());
        }
        args.push("--print".into());
        args.push(user_prompt.to_string());

        let mut cmd = Command::new(&self.copilot_bin);
        cmd.args(&args);
        cmd.current_dir(repo_path);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        // Minimal environment: allowlist plus LLM auth only.
        cmd.env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        if !self.github_token.is_empty() {
            cmd.env("GITHUB_TOKEN", &self.github_token);
        }
        if !self.provider_type.is_empty() {
            cmd.env("COPILOT_PROVIDER_TYPE", &self.provider_type);
            cmd.env("COPILOT_PROVIDER_BASE_URL", &self.provider_base_url);
            cmd.env("COPILOT_PROVIDER_API_KEY", &self.provider_api_key);
        }

        info!(repo = %repo_path.display(), model = %self.model, "spawning copilot subprocess");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.copilot_bin))?;

        let stdout = child.stdout.take().context("copilot stdout missing")?;
        let stderr = child.stderr.take().context("copilot stderr missing")?;

        // Drain stderr concurrently so the child never blocks on a full pipe.
        let stderr_tail: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let stderr_task = {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock().await;
                    tail.push(line);
                    if tail.len() > 50 {
                        tail.remove(0);
                    }
                }
            })
        };

        let mut messages: Vec<String> = Vec::new();
        let mut lines = BufReader::new(stdout).lines();
        let drained = tokio::time::timeout(Duration::from_secs(self.timeout_s), async {
            while let Some(line) = lines.next_line().await.context("read copilot stdout")? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                if event["type"] == "assistant.message" {
                    if let Some(content) = event["content"].as_str() {
                        if !content.is_empty() {
                            messages.push(content.to_string());
                        }
                    }
                }
            }
            anyhow::Ok(())
        })
        .await;

        match drained {
            Err(_) => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(AgentError::ExecutionTimeout {
                    seconds: self.timeout_s,
                }
                .into());
            }
            Ok(result) => result?,
        }

        let status = child.wait().await.context("copilot wait failed")?;
        let _ = stderr_task.await;
        if !status.success() {
            let tail = stderr_tail.lock().await.join("\n");
            warn!(exit = status.code().unwrap_or(1), "copilot subprocess failed");
            return Err(AgentError::ExecutionFailure {
                message: format!(
                    "copilot exited with {}: {tail}",
                    status.code().unwrap_or(1)
                ),
            }
            .into());
        }

        messages
            .pop()
            .ok_or_else(|| anyhow!("copilot produced no assistant message"))
    }
}
