use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use copilot_clients::gitlab::{GitLabClient, NoteEvent};
use copilot_clients::jira::{JiraClient, JiraIssue};
use copilot_core::approval::PendingApproval;
use copilot_core::config::{Config, JiraConfig};
use copilot_core::error::AgentError;
use copilot_core::executor::TaskExecutor;
use copilot_core::git::{ensure_ignore_file, Git};
use copilot_core::prompts::{self, PromptKind};
use copilot_core::state::DistributedLock;
use copilot_core::state_memory::ProcessedSet;
use copilot_core::types::{ProjectMapping, TaskKind, TaskResult, TaskSpec};
use copilot_core::workspace;
use tracing::{error, info, warn};

use crate::{AppState, REPO_LOCK_TTL_SECONDS};

pub const COPILOT_PREFIX: &str = "/copilot ";
pub const AGENT_AUTHOR_NAME: &str = "Copilot Agent";
pub const AGENT_AUTHOR_EMAIL: &str = "copilot-agent@noreply";

const APPROVAL_TTL_SECONDS: u64 = 3600;
const COMMAND_FAILED_NOTE: &str = "❌ Agent encountered an error processing your request.";

/// Extract the instruction from a `/copilot` command; None when the note is
/// not a command. Prefix match is case-insensitive.
pub fn parse_copilot_command(note: &str) -> Option<String> {
    let stripped = note.trim();
    let prefix = stripped.get(..COPILOT_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(COPILOT_PREFIX) {
        return None;
    }
    let instruction = stripped[COPILOT_PREFIX.len()..].trim();
    if instruction.is_empty() {
        None
    } else {
        Some(instruction.to_string())
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn short_sha(sha: &str) -> String {
    truncate_chars(sha, 12)
}

/// Apply a remote coding result's patch to the local clone.
///
/// In-process results carry no patch (files are already on disk). Remote
/// patches are refused when the clone has diverged from the worker's base.
pub async fn apply_coding_result(git: &Git, result: &TaskResult) -> Result<()> {
    let TaskResult::Coding { patch, base_sha, .. } = result else {
        return Ok(());
    };
    if patch.is_empty() {
        return Ok(());
    }
    let local_head = git.head_sha().await?;
    if !base_sha.is_empty() && *base_sha != local_head {
        return Err(AgentError::DivergedClone {
            remote_sha: short_sha(base_sha),
            local_sha: short_sha(&local_head),
        }
        .into());
    }
    git.apply_patch(patch).await
}

// ── /copilot MR-comment path ─────────────────────────────────────────────

/// Handle a `/copilot` command from an MR comment, including the optional
/// approval gate.
pub async fn handle_copilot_comment(state: &AppState, event: &NoteEvent) -> Result<()> {
    let Some(instruction) = parse_copilot_command(&event.object_attributes.note) else {
        return Ok(());
    };
    let project = &event.project;
    let mr = &event.merge_request;

    if !state.config.copilot_approval_required {
        let task_id = format!("mr-{}-{}-{}", project.id, mr.iid, event.object_attributes.id);
        return run_mr_command(state, event, &instruction, task_id).await;
    }

    if instruction.eq_ignore_ascii_case("approve") {
        let Some(pending) = state.approvals.get(project.id, mr.iid).await else {
            state
                .gitlab
                .post_mr_note(project.id, mr.iid, "ℹ️ No pending command to approve.")
                .await?;
            return Ok(());
        };
        if pending.requester_id == event.user.id {
            state
                .gitlab
                .post_mr_note(
                    project.id,
                    mr.iid,
                    "ℹ️ A command cannot be approved by its requester.",
                )
                .await?;
            return Ok(());
        }
        state.approvals.delete(project.id, mr.iid).await;
        return run_mr_command(state, event, &pending.prompt, pending.task_id).await;
    }

    let approval = PendingApproval {
        task_id: format!("mr-{}-{}-{}", project.id, mr.iid, event.object_attributes.id),
        requester_id: event.user.id,
        prompt: instruction,
        project_id: project.id,
        mr_iid: mr.iid,
        created_at: Utc::now().timestamp(),
        timeout_s: APPROVAL_TTL_SECONDS,
    };
    state.approvals.store(&approval).await;
    state
        .gitlab
        .post_mr_note(
            project.id,
            mr.iid,
            "⏸️ Command stored. Another user can reply `/copilot approve` to run it.",
        )
        .await?;
    Ok(())
}

async fn run_mr_command(
    state: &AppState,
    event: &NoteEvent,
    instruction: &str,
    task_id: String,
) -> Result<()> {
    let project = &event.project;
    let mr = &event.merge_request;
    info!(
        project_id = project.id,
        mr_iid = mr.iid,
        instruction = %truncate_chars(instruction, 100),
        "copilot command received"
    );

    let _lock = state
        .repo_locks
        .acquire(&project.git_http_url, REPO_LOCK_TTL_SECONDS)
        .await;

    let outcome = async {
        let ws =
            workspace::clone_workspace(&state.config, &project.git_http_url, &mr.source_branch)
                .await?;
        let git = Git::new(ws.path(), &state.config.gitlab_token);

        let task = TaskSpec {
            kind: TaskKind::Coding,
            task_id,
            repo_url: project.git_http_url.clone(),
            branch: mr.source_branch.clone(),
            system_prompt: prompts::get_prompt(&state.config, PromptKind::MrComment),
            user_prompt: prompts::build_mr_coding_prompt(
                instruction,
                &mr.title,
                &mr.source_branch,
                &mr.target_branch,
            ),
            repo_path: Some(ws.path().to_path_buf()),
        };
        let result = state.executor.execute(&task).await?;
        info!(summary = %truncate_chars(result.summary(), 200), "copilot coding complete");

        apply_coding_result(&git, &result).await?;

        let message = format!("fix: {}", truncate_chars(instruction, 50));
        let changed = git
            .commit_all(&message, AGENT_AUTHOR_NAME, AGENT_AUTHOR_EMAIL)
            .await?;
        if !changed {
            state
                .gitlab
                .post_mr_note(
                    project.id,
                    mr.iid,
                    &format!("ℹ️ No file changes needed.\n\n{}", result.summary()),
                )
                .await?;
            return Ok(());
        }

        git.push(&mr.source_branch).await?;
        state
            .gitlab
            .post_mr_note(
                project.id,
                mr.iid,
                &format!("✅ Changes pushed.\n\n{}", result.summary()),
            )
            .await?;
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            info!(project_id = project.id, mr_iid = mr.iid, "copilot command complete");
            Ok(())
        }
        Err(e) => {
            error!(
                project_id = project.id,
                mr_iid = mr.iid,
                error = %format!("{e:#}"),
                "copilot command failed"
            );
            if let Err(post_err) = state
                .gitlab
                .post_mr_note(project.id, mr.iid, COMMAND_FAILED_NOTE)
                .await
            {
                error!(error = %post_err, "error comment failed");
            }
            Err(e)
        }
    }
}

// ── Issue-driven path ────────────────────────────────────────────────────

/// Jira issue → clone → agent → branch/commit/push → MR → workflow updates.
pub struct CodingOrchestrator {
    config: Arc<Config>,
    jira_config: JiraConfig,
    gitlab: Arc<GitLabClient>,
    jira: Arc<JiraClient>,
    executor: Arc<dyn TaskExecutor>,
    repo_locks: Arc<dyn DistributedLock>,
    processed: Arc<ProcessedSet>,
}

impl CodingOrchestrator {
    pub fn new(
        config: Arc<Config>,
        jira_config: JiraConfig,
        gitlab: Arc<GitLabClient>,
        jira: Arc<JiraClient>,
        executor: Arc<dyn TaskExecutor>,
        repo_locks: Arc<dyn DistributedLock>,
        processed: Arc<ProcessedSet>,
    ) -> Self {
        Self {
            config,
            jira_config,
            gitlab,
            jira,
            executor,
            repo_locks,
            processed,
        }
    }

    pub async fn handle(&self, issue: &JiraIssue, mapping: &ProjectMapping) -> Result<()> {
        if self.processed.is_processed(&issue.key) {
            return Ok(());
        }

        let _lock = self
            .repo_locks
            .acquire(&mapping.clone_url, REPO_LOCK_TTL_SECONDS)
            .await;
        info!(
            issue_key = %issue.key,
            project_id = mapping.gitlab_project_id,
            "coding task started"
        );

        match self.run(issue, mapping).await {
            Ok(()) => {
                self.processed.mark(&issue.key);
                Ok(())
            }
            Err(e) => {
                error!(issue_key = %issue.key, error = %format!("{e:#}"), "coding task failed");
                let comment = match e.downcast_ref::<AgentError>() {
                    Some(AgentError::TransientClone { attempts, .. }) => format!(
                        "⚠️ Could not clone the repository after {attempts} attempts. \
                         The agent will retry on the next poll cycle."
                    ),
                    _ => "⚠️ Automated implementation failed. Check service logs for details."
                        .to_string(),
                };
                // Guarded: the comment must never mask the original error.
                if let Err(post_err) = self.jira.add_comment(&issue.key, &comment).await {
                    error!(issue_key = %issue.key, error = %post_err, "failure comment post failed");
                }
                Err(e)
            }
        }
    }

    async fn run(&self, issue: &JiraIssue, mapping: &ProjectMapping) -> Result<()> {
        self.jira
            .transition_issue(&issue.key, &self.jira_config.in_progress_status)
            .await?;

        let ws =
            workspace::clone_workspace(&self.config, &mapping.clone_url, &mapping.target_branch)
                .await?;
        let git = Git::new(ws.path(), &self.config.gitlab_token);

        let branch = self.agent_branch(&git, &issue.key).await?;
        git.create_branch(&branch).await?;
        if ensure_ignore_file(ws.path())? {
            info!(issue_key = %issue.key, "ignore file created or extended");
        }

        let task = TaskSpec {
            kind: TaskKind::Coding,
            task_id: issue.key.clone(),
            repo_url: mapping.clone_url.clone(),
            branch: mapping.target_branch.clone(),
            system_prompt: prompts::get_prompt(&self.config, PromptKind::Coding),
            user_prompt: prompts::build_issue_coding_prompt(
                &issue.key,
                &issue.fields.summary,
                issue.description_text(),
            ),
            repo_path: Some(ws.path().to_path_buf()),
        };
        let result = self.executor.execute(&task).await?;
        info!(
            issue_key = %issue.key,
            summary = %truncate_chars(result.summary(), 200),
            "coding complete"
        );

        apply_coding_result(&git, &result).await?;

        let title = format!(
            "feat({}): {}",
            issue.key.to_lowercase(),
            issue.fields.summary
        );
        let changed = git
            .commit_all(&title, AGENT_AUTHOR_NAME, AGENT_AUTHOR_EMAIL)
            .await?;
        if !changed {
            self.jira
                .add_comment(&issue.key, "Agent found no changes to make.")
                .await?;
            warn!(issue_key = %issue.key, "no changes to commit");
            return Ok(());
        }

        git.push(&branch).await?;
        let description = format!(
            "Automated implementation for {}.\n\n{}",
            issue.key,
            result.summary()
        );
        let created = self
            .gitlab
            .create_merge_request(
                mapping.gitlab_project_id,
                &branch,
                &mapping.target_branch,
                &title,
                &description,
            )
            .await?;

        // Best-effort: a failed in-review transition never rolls back the MR.
        if let Err(e) = self
            .jira
            .transition_issue(&issue.key, &self.jira_config.in_review_status)
            .await
        {
            warn!(issue_key = %issue.key, error = %e, "in-review transition failed, MR stands");
        }

        self.jira
            .add_comment(&issue.key, &format!("MR created: {}", created.web_url))
            .await?;
        info!(issue_key = %issue.key, mr_iid = created.iid, "coding task complete");
        Ok(())
    }

    /// `agent/{key-lower}`, suffixed `-2`, `-3`, ... when the remote branch
    /// already exists.
    async fn agent_branch(&self, git: &Git, issue_key: &str) -> Result<String> {
        let base = format!("agent/{}", issue_key.to_lowercase());
        if !git.remote_branch_exists(&base).await? {
            return Ok(base);
        }
        for suffix in 2..=20 {
            let candidate = format!("{base}-{suffix}");
            if !git.remote_branch_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        bail!("no free agent branch name for {issue_key}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_copilot_command() {
        assert_eq!(
            parse_copilot_command("/copilot rename X to Y").as_deref(),
            Some("rename X to Y")
        );
        assert_eq!(
            parse_copilot_command("  /COPILOT fix the tests  ").as_deref(),
            Some("fix the tests")
        );
        assert_eq!(parse_copilot_command("/copilot    "), None);
        assert_eq!(parse_copilot_command("looks good to me"), None);
        assert_eq!(parse_copilot_command("/copilotfix"), None);
    }

    #[test]
    fn test_truncate_chars_is_boundary_safe() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(truncate_chars("short", 50), "short");
    }

    #[tokio::test]
    async fn test_apply_coding_result_ignores_empty_patch() {
        // No patch means nothing to verify; the git repo is never touched.
        let git = Git::new("/nonexistent", "");
        let result = TaskResult::Coding {
            summary: "done".into(),
            patch: String::new(),
            base_sha: String::new(),
        };
        apply_coding_result(&git, &result).await.unwrap();

        let review = TaskResult::Review { summary: "fine".into() };
        apply_coding_result(&git, &review).await.unwrap();
    }
}
