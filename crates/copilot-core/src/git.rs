use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::AgentError;

/// Wall-clock timeout for ordinary git commands.
const GIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Clones get longer; shallow clones of large repos can still take a while.
const CLONE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Replace every occurrence of *token* with `***`.
///
/// Applied to every error string before it leaves this module, so embedded
/// `oauth2:{token}@` clone credentials never reach logs or posted comments.
pub fn redact_token(text: &str, token: &str) -> String {
    if token.is_empty() {
        return text.to_string();
    }
    text.replace(token, "***")
}

/// Git CLI operations against a single checkout.
pub struct Git {
    repo_path: PathBuf,
    token: String,
}

impl Git {
    pub fn new(repo_path: impl Into<PathBuf>, token: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            token: token.into(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn redact(&self, text: &str) -> String {
        redact_token(text, &self.token)
    }

    async fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        self.exec_with_stdin(args, None, GIT_TIMEOUT).await
    }

    async fn exec_with_stdin(
        &self,
        args: &[&str],
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo_path);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .await
                    .context("failed to write git stdin")?;
            }
        }

        // kill_on_drop reaps the child when the timeout drops the future.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                anyhow!(
                    "git {} timed out after {}s",
                    args.first().copied().unwrap_or(""),
                    timeout.as_secs()
                )
            })?
            .with_context(|| format!("git {} did not complete", args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    async fn exec_checked(&self, args: &[&str]) -> Result<ExecResult> {
        let result = self.exec(args).await?;
        if !result.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                self.redact(result.combined_output().trim())
            ));
        }
        Ok(result)
    }

    pub async fn head_sha(&self) -> Result<String> {
        let result = self.exec_checked(&["rev-parse", "HEAD"]).await?;
        Ok(result.stdout.trim().to_string())
    }

    /// Create and check out a new local branch.
    pub async fn create_branch(&self, branch: &str) -> Result<()> {
        self.exec_checked(&["checkout", "-b", branch]).await?;
        tracing::info!(branch, repo = %self.repo_path.display(), "branch created");
        Ok(())
    }

    /// True when `origin` already has a branch with this name.
    pub async fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let refspec = format!("refs/heads/{branch}");
        let result = self
            .exec_checked(&["ls-remote", "--heads", "origin", &refspec])
            .await?;
        Ok(!result.stdout.trim().is_empty())
    }

    /// Stage all changes and commit. Returns false when there is nothing to
    /// commit.
    pub async fn commit_all(
        &self,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<bool> {
        self.exec_checked(&["add", "-A"]).await?;
        let status = self.exec_checked(&["status", "--porcelain"]).await?;
        if status.stdout.trim().is_empty() {
            tracing::info!(repo = %self.repo_path.display(), "nothing to commit");
            return Ok(false);
        }
        let name_arg = format!("user.name={author_name}");
        let email_arg = format!("user.email={author_email}");
        self.exec_checked(&["-c", &name_arg, "-c", &email_arg, "commit", "-m", message])
            .await?;
        tracing::info!(message, repo = %self.repo_path.display(), "committed");
        Ok(true)
    }

    pub async fn push(&self, branch: &str) -> Result<()> {
        self.exec_checked(&["push", "origin", "--", branch]).await?;
        tracing::info!(branch, repo = %self.repo_path.display(), "pushed");
        Ok(())
    }

    pub async fn stage_all(&self) -> Result<()> {
        self.exec_checked(&["add", "-A"]).await?;
        Ok(())
    }

    /// Capture the staged diff, binary-safe, for result passback from remote
    /// workers.
    pub async fn diff_cached_binary(&self) -> Result<String> {
        let result = self
            .exec_checked(&["diff", "--cached", "--binary"])
            .await?;
        Ok(result.stdout)
    }

    /// Three-way apply a patch produced by a remote worker.
    ///
    /// File-header paths are validated before git runs; a malicious patch
    /// must not be able to write outside the checkout.
    pub async fn apply_patch(&self, patch: &str) -> Result<()> {
        validate_patch_paths(patch)?;
        let result = self
            .exec_with_stdin(&["apply", "--3way"], Some(patch), GIT_TIMEOUT)
            .await?;
        if !result.success() {
            return Err(anyhow!(
                "git apply --3way failed: {}",
                self.redact(result.combined_output().trim())
            ));
        }
        tracing::info!(repo = %self.repo_path.display(), "patch applied");
        Ok(())
    }
}

/// Reject patches whose file headers contain `..` path components.
pub fn validate_patch_paths(patch: &str) -> Result<(), AgentError> {
    fn has_traversal(path: &str) -> bool {
        let trimmed = path
            .trim_start_matches("a/")
            .trim_start_matches("b/")
            .trim_matches('"');
        trimmed.split('/').any(|part| part == "..")
    }

    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if rest.split_whitespace().any(has_traversal) {
                return Err(AgentError::InvalidPatch(format!(
                    "path traversal in patch header: {line}"
                )));
            }
        } else if let Some(rest) = line
            .strip_prefix("--- ")
            .or_else(|| line.strip_prefix("+++ "))
        {
            let path = rest.split_whitespace().next().unwrap_or("");
            if path != "/dev/null" && has_traversal(path) {
                return Err(AgentError::InvalidPatch(format!(
                    "path traversal in patch header: {line}"
                )));
            }
        }
    }
    Ok(())
}

/// Shallow-clone `clone_url` at `branch` into `dest`. Single attempt; the
/// retry policy lives in [`crate::workspace`].
pub async fn clone_into(clone_url: &str, branch: &str, token: &str, dest: &Path) -> Result<()> {
    let auth_url = if token.is_empty() {
        clone_url.to_string()
    } else {
        clone_url.replace("https://", &format!("https://oauth2:{token}@"))
    };

    let mut cmd = Command::new("git");
    cmd.args(["clone", "--depth=1", "--branch", branch, "--", &auth_url]);
    cmd.arg(dest);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd.spawn().context("failed to spawn git clone")?;
    let output = tokio::time::timeout(CLONE_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| anyhow!("git clone timed out after {}s", CLONE_TIMEOUT.as_secs()))?
        .context("git clone did not complete")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "git clone failed: {}",
            redact_token(stderr.trim(), token)
        ));
    }
    tracing::info!(path = %dest.display(), branch, "repo cloned");
    Ok(())
}

const PYTHON_IGNORES: &[&str] = &[
    "__pycache__/",
    "*.pyc",
    ".pytest_cache/",
    "*.egg-info/",
    "dist/",
    "build/",
    ".venv/",
];
const NODE_IGNORES: &[&str] = &["node_modules/", "dist/", "build/", "*.log"];
const RUST_IGNORES: &[&str] = &["target/", "*.rs.bk"];

fn ignore_patterns_for(repo_root: &Path) -> &'static [&'static str] {
    if repo_root.join("pyproject.toml").exists() || repo_root.join("requirements.txt").exists() {
        PYTHON_IGNORES
    } else if repo_root.join("package.json").exists() {
        NODE_IGNORES
    } else if repo_root.join("Cargo.toml").exists() {
        RUST_IGNORES
    } else {
        PYTHON_IGNORES
    }
}

/// Ensure the checkout has an ignore file with standard patterns for its
/// language. Additive only. Returns true when the file was created or
/// extended. Refuses symlinks and paths resolving outside the checkout.
pub fn ensure_ignore_file(repo_root: &Path) -> Result<bool> {
    let path = repo_root.join(".gitignore");
    if path.is_symlink() {
        return Ok(false);
    }
    if path.exists() {
        let resolved = path.canonicalize().context(".gitignore canonicalize")?;
        let root = repo_root.canonicalize().context("repo root canonicalize")?;
        if !resolved.starts_with(&root) {
            return Ok(false);
        }
    }

    let content = if path.exists() {
        std::fs::read_to_string(&path).context("read .gitignore")?
    } else {
        String::new()
    };
    let existing: std::collections::HashSet<&str> = content.lines().collect();
    let missing: Vec<&str> = ignore_patterns_for(repo_root)
        .iter()
        .copied()
        .filter(|p| !existing.contains(p))
        .collect();
    if missing.is_empty() {
        return Ok(false);
    }

    let mut updated = content.clone();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&missing.join("\n"));
    updated.push('\n');
    std::fs::write(&path, updated).context("write .gitignore")?;
    Ok(true)
}
