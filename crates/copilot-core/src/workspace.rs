use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::config::Config;
use crate::error::AgentError;
use crate::git;

/// Prefix for workspace directories; stale ones are swept at startup.
pub const CLONE_DIR_PREFIX: &str = "mr-review-";

/// A short-lived checkout owned by exactly one orchestrator.
///
/// The underlying directory is removed when the workspace drops, on every
/// exit path.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn clone_base_dir(clone_dir: &str) -> PathBuf {
    if clone_dir.is_empty() {
        std::env::temp_dir()
    } else {
        PathBuf::from(clone_dir)
    }
}

/// Clone `clone_url` at `branch` into a fresh workspace, retrying transient
/// failures with exponential backoff. Exhaustion surfaces
/// [`AgentError::TransientClone`] so callers can decline to mark the task as
/// processed.
pub async fn clone_with_retries(
    clone_url: &str,
    branch: &str,
    token: &str,
    clone_dir: &str,
    max_retries: u32,
    backoff_base_s: u64,
) -> Result<Workspace> {
    let base = clone_base_dir(clone_dir);
    let attempts = max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let dir = tempfile::Builder::new()
            .prefix(CLONE_DIR_PREFIX)
            .tempdir_in(&base)
            .context("failed to create workspace dir")?;

        match git::clone_into(clone_url, branch, token, dir.path()).await {
            Ok(()) => return Ok(Workspace { dir }),
            Err(e) => {
                // The failed checkout is removed when `dir` drops here.
                last_error = git::redact_token(&format!("{e:#}"), token);
                if attempt < attempts {
                    let delay = backoff_base_s.saturating_mul(1 << (attempt - 1));
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_s = delay,
                        error = %last_error,
                        "clone failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }

    Err(AgentError::TransientClone {
        attempts,
        message: last_error,
    }
    .into())
}

/// Clone using the service configuration's token, base dir, and retry policy.
pub async fn clone_workspace(config: &Config, clone_url: &str, branch: &str) -> Result<Workspace> {
    clone_with_retries(
        clone_url,
        branch,
        &config.gitlab_token,
        &config.clone_dir,
        config.git_clone_max_retries,
        config.git_clone_backoff_base_s,
    )
    .await
}

/// Remove leftover workspace directories from prior crashes. Returns the
/// number of directories removed.
pub fn cleanup_stale(clone_dir: &str) -> usize {
    let base = clone_base_dir(clone_dir);
    let Ok(entries) = std::fs::read_dir(&base) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(CLONE_DIR_PREFIX) && entry.path().is_dir() {
            if std::fs::remove_dir_all(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        tracing::info!(removed, base = %base.display(), "removed stale workspaces");
    }
    removed
}
