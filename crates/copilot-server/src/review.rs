use anyhow::Result;
use copilot_clients::gitlab::{GitLabClient, MergeRequestEvent};
use copilot_core::prompts::{self, PromptKind, ReviewRequest};
use copilot_core::review::{diff_positions, parse_review, ParsedReview, ReviewFinding};
use copilot_core::types::{MrChange, MrDetails, TaskKind, TaskSpec};
use copilot_core::workspace;
use tracing::{error, info, warn};

use crate::{AppState, DEDUP_TTL_SECONDS, REPO_LOCK_TTL_SECONDS};

const REVIEW_FAILED_NOTE: &str = "⚠️ Automated review failed. Check service logs for details.";

/// Dedup granularity follows `GITLAB_REVIEW_ON_PUSH`: per head commit when
/// re-reviews are wanted, per MR otherwise.
pub fn review_dedup_key(
    review_on_push: bool,
    project_id: u64,
    mr_iid: u64,
    head_sha: &str,
) -> String {
    if review_on_push {
        format!("review:{project_id}:{mr_iid}:{head_sha}")
    } else {
        format!("review:{project_id}:{mr_iid}")
    }
}

fn build_diff_text(changes: &[MrChange]) -> String {
    changes
        .iter()
        .map(|c| format!("--- a/{}\n+++ b/{}\n{}", c.old_path, c.new_path, c.diff))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Full review pipeline: dedup → lock → clone → agent → parse → post.
pub async fn handle_review(state: &AppState, event: &MergeRequestEvent) -> Result<()> {
    let project = &event.project;
    let mr = &event.object_attributes;

    let dedup_key = review_dedup_key(
        state.config.gitlab_review_on_push,
        project.id,
        mr.iid,
        &mr.last_commit.id,
    );
    if state.dedup.is_seen(&dedup_key).await {
        info!(project_id = project.id, mr_iid = mr.iid, "already reviewed, skipping");
        return Ok(());
    }

    info!(project_id = project.id, mr_iid = mr.iid, "review started");
    let _lock = state
        .repo_locks
        .acquire(&project.git_http_url, REPO_LOCK_TTL_SECONDS)
        .await;

    let outcome = run_review(state, event).await;
    match outcome {
        Ok(()) => {
            state.dedup.mark_seen(&dedup_key, DEDUP_TTL_SECONDS).await;
            info!(project_id = project.id, mr_iid = mr.iid, "review comments posted");
            Ok(())
        }
        Err(e) => {
            error!(
                project_id = project.id,
                mr_iid = mr.iid,
                error = %format!("{e:#}"),
                "review failed"
            );
            // The failure note must never mask the original error.
            if let Err(post_err) = state
                .gitlab
                .post_mr_note(project.id, mr.iid, REVIEW_FAILED_NOTE)
                .await
            {
                error!(error = %post_err, "failure note post failed");
            }
            Err(e)
        }
    }
}

async fn run_review(state: &AppState, event: &MergeRequestEvent) -> Result<()> {
    let project = &event.project;
    let mr = &event.object_attributes;

    let ws = workspace::clone_workspace(&state.config, &project.git_http_url, &mr.source_branch)
        .await?;

    let details = state.gitlab.get_mr_details(project.id, mr.iid).await?;
    let diff_text = build_diff_text(&details.changes);

    let request = ReviewRequest {
        title: mr.title.clone(),
        description: mr.description.clone(),
        source_branch: mr.source_branch.clone(),
        target_branch: mr.target_branch.clone(),
    };
    let task = TaskSpec {
        kind: TaskKind::Review,
        task_id: format!("review:{}:{}:{}", project.id, mr.iid, mr.last_commit.id),
        repo_url: project.git_http_url.clone(),
        branch: mr.source_branch.clone(),
        system_prompt: prompts::get_prompt(&state.config, PromptKind::Review),
        user_prompt: prompts::build_review_prompt(&request, Some(&diff_text)),
        repo_path: Some(ws.path().to_path_buf()),
    };

    let result = state.executor.execute(&task).await?;
    let parsed = parse_review(result.summary());
    info!(
        project_id = project.id,
        mr_iid = mr.iid,
        findings = parsed.findings.len(),
        "review complete"
    );

    post_review(&state.gitlab, project.id, mr.iid, &details, &parsed).await?;
    Ok(())
}

/// Body of an inline comment: severity tag, text, optional suggestion fence.
pub(crate) fn finding_body(finding: &ReviewFinding) -> String {
    let mut body = format!("**[{}]** {}", finding.severity.tag(), finding.comment);
    if let Some(suggestion) = &finding.suggestion {
        body.push_str(&format!(
            "\n\n```suggestion:-{}+{}\n{suggestion}\n```",
            finding.suggestion_start_offset, finding.suggestion_end_offset
        ));
    }
    body
}

/// Fallback note body for findings outside the diff's hunk coverage.
pub(crate) fn fallback_body(body: &str, finding: &ReviewFinding) -> String {
    format!("{body}\n\n`{}:{}`", finding.file, finding.line)
}

/// Post inline discussions for findings landing inside the diff, fallback
/// notes for the rest, then one summary note. Per-finding post failures log
/// and continue.
async fn post_review(
    gitlab: &GitLabClient,
    project_id: u64,
    mr_iid: u64,
    details: &MrDetails,
    review: &ParsedReview,
) -> Result<()> {
    let positions = diff_positions(&details.changes);

    for finding in &review.findings {
        let body = finding_body(finding);

        if !positions.contains(&(finding.file.clone(), finding.line)) {
            warn!(
                file = %finding.file,
                line = finding.line,
                "position not in diff, posting fallback note"
            );
            if let Err(e) = gitlab
                .post_mr_note(project_id, mr_iid, &fallback_body(&body, finding))
                .await
            {
                warn!(file = %finding.file, line = finding.line, error = %e, "fallback note failed");
            }
            continue;
        }

        if let Err(e) = gitlab
            .post_inline_discussion(
                project_id,
                mr_iid,
                &details.diff_refs,
                &finding.file,
                finding.line,
                &body,
            )
            .await
        {
            warn!(file = %finding.file, line = finding.line, error = %e, "inline comment failed");
            if let Err(e) = gitlab
                .post_mr_note(project_id, mr_iid, &fallback_body(&body, finding))
                .await
            {
                warn!(file = %finding.file, line = finding.line, error = %e, "fallback note also failed");
            }
        }
    }

    gitlab
        .post_mr_note(
            project_id,
            mr_iid,
            &format!("## Code Review Summary\n\n{}", review.summary),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use copilot_core::review::Severity;

    fn finding(suggestion: Option<&str>) -> ReviewFinding {
        ReviewFinding {
            file: "src/x.py".into(),
            line: 10,
            severity: Severity::Info,
            comment: "prefer a named constant".into(),
            suggestion: suggestion.map(str::to_string),
            suggestion_start_offset: 1,
            suggestion_end_offset: 2,
        }
    }

    #[test]
    fn test_dedup_key_granularity_follows_flag() {
        assert_eq!(review_dedup_key(true, 42, 7, "abc"), "review:42:7:abc");
        assert_eq!(review_dedup_key(false, 42, 7, "abc"), "review:42:7");
    }

    #[test]
    fn test_finding_body_severity_tag() {
        let body = finding_body(&finding(None));
        assert!(body.starts_with("**[INFO]** "));
        assert!(!body.contains("suggestion"));
    }

    #[test]
    fn test_finding_body_suggestion_fence_carries_offsets() {
        let body = finding_body(&finding(Some("LIMIT = 10")));
        assert!(body.contains("```suggestion:-1+2\nLIMIT = 10\n```"));
    }

    #[test]
    fn test_fallback_body_ends_with_position() {
        let f = finding(None);
        let body = fallback_body(&finding_body(&f), &f);
        assert!(body.ends_with("`src/x.py:10`"));
    }

    #[test]
    fn test_build_diff_text_joins_files() {
        let changes = vec![
            MrChange {
                old_path: "a.py".into(),
                new_path: "a.py".into(),
                diff: "@@ -1 +1 @@\n-x\n+y\n".into(),
                new_file: false,
                deleted_file: false,
                renamed_file: false,
            },
            MrChange {
                old_path: "b.py".into(),
                new_path: "b.py".into(),
                diff: "@@ -0,0 +1 @@\n+z\n".into(),
                new_file: true,
                deleted_file: false,
                renamed_file: false,
            },
        ];
        let text = build_diff_text(&changes);
        assert!(text.contains("--- a/a.py\n+++ b/a.py"));
        assert!(text.contains("--- a/b.py\n+++ b/b.py"));
    }
}
