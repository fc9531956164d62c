use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use copilot_clients::gitlab::{
    LastCommit, MergeRequestEvent, MrAttributes, MrListItem, NoteEvent, NoteAttributes,
    NoteMergeRequest, WebhookProject,
};
use copilot_clients::jira::{JiraClient, JiraIssue};
use copilot_core::config::JiraConfig;
use tracing::{error, info};

use crate::coding::{self, CodingOrchestrator};
use crate::review::{self, review_dedup_key};
use crate::{AppState, DEDUP_TTL_SECONDS};

const MAX_BACKOFF: Duration = Duration::from_secs(300);

fn backoff(interval_s: u64, failures: u32) -> Duration {
    let exp = Duration::from_secs(interval_s.saturating_mul(1u64 << failures.min(16)));
    exp.min(MAX_BACKOFF)
}

/// Project descriptor for synthetic events, derived from the MR's web URL
/// (`https://gitlab.example.com/group/project/-/merge_requests/1`).
fn synthetic_project(gitlab_url: &str, project_id: u64, mr: &MrListItem) -> WebhookProject {
    let project_url = mr.web_url.split("/-/").next().unwrap_or(&mr.web_url);
    let namespace = project_url
        .strip_prefix(gitlab_url)
        .unwrap_or(project_url)
        .trim_matches('/')
        .to_string();
    WebhookProject {
        id: project_id,
        path_with_namespace: namespace,
        git_http_url: format!("{project_url}.git"),
    }
}

/// Trigger query across all mapped project keys, or None when nothing is
/// mapped.
fn trigger_jql(trigger_status: &str, map: &copilot_core::types::ProjectMap) -> Option<String> {
    let mut keys: Vec<&String> = map.keys().collect();
    if keys.is_empty() {
        return None;
    }
    keys.sort();
    let project_list = keys
        .iter()
        .map(|k| format!("\"{k}\""))
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!(
        "status = \"{trigger_status}\" AND project IN ({project_list})"
    ))
}

// ── GitLab MR poller ─────────────────────────────────────────────────────

/// Discovers new and updated MRs (and `/copilot` notes, for deployments
/// without webhooks) against a timestamp watermark that advances only after
/// a complete cycle.
pub struct MrPoller {
    state: Arc<AppState>,
    project_ids: Vec<u64>,
    watermark: DateTime<Utc>,
    failures: u32,
}

impl MrPoller {
    pub fn new(state: Arc<AppState>, project_ids: Vec<u64>) -> Self {
        let lookback = chrono::Duration::minutes(state.config.gitlab_poll_lookback_mins);
        Self {
            state,
            project_ids,
            watermark: Utc::now() - lookback,
            failures: 0,
        }
    }

    pub async fn run(mut self) {
        let interval = self.state.config.gitlab_poll_interval_s;
        loop {
            match self.poll_once().await {
                Ok(()) => self.failures = 0,
                Err(e) => {
                    self.failures += 1;
                    error!(failures = self.failures, error = %format!("{e:#}"), "gitlab poll error");
                }
            }
            tokio::time::sleep(backoff(interval, self.failures)).await;
        }
    }

    async fn poll_once(&mut self) -> Result<()> {
        let cycle_start = Utc::now();
        for &project_id in &self.project_ids {
            let mrs = self
                .state
                .gitlab
                .list_project_mrs(project_id, "opened", Some(self.watermark))
                .await?;
            for mr in &mrs {
                self.process_mr(project_id, mr).await?;
                self.scan_notes(project_id, mr).await?;
            }
        }
        self.watermark = cycle_start;
        Ok(())
    }

    async fn process_mr(&self, project_id: u64, mr: &MrListItem) -> Result<()> {
        let key = review_dedup_key(
            self.state.config.gitlab_review_on_push,
            project_id,
            mr.iid,
            &mr.sha,
        );
        if self.state.dedup.is_seen(&key).await {
            return Ok(());
        }
        let event = self.synthetic_mr_event(project_id, mr);
        review::handle_review(&self.state, &event).await
    }

    /// In polling mode there are no note webhooks; discover `/copilot`
    /// commands from the MR's recent notes instead.
    async fn scan_notes(&self, project_id: u64, mr: &MrListItem) -> Result<()> {
        let notes = self
            .state
            .gitlab
            .list_mr_notes(project_id, mr.iid, Some(self.watermark))
            .await?;
        for note in notes {
            if note.system {
                continue;
            }
            if coding::parse_copilot_command(&note.body).is_none() {
                continue;
            }
            let agent_username = &self.state.config.agent_gitlab_username;
            if !agent_username.is_empty() && note.author.username == *agent_username {
                continue;
            }
            let key = format!("mr-{project_id}-{}-{}", mr.iid, note.id);
            if self.state.dedup.is_seen(&key).await {
                continue;
            }

            let event = NoteEvent {
                object_kind: "note".to_string(),
                user: note.author.clone(),
                project: synthetic_project(&self.state.config.gitlab_url, project_id, mr),
                object_attributes: NoteAttributes {
                    id: note.id,
                    note: note.body.clone(),
                    noteable_type: "MergeRequest".to_string(),
                },
                merge_request: NoteMergeRequest {
                    iid: mr.iid,
                    title: mr.title.clone(),
                    source_branch: mr.source_branch.clone(),
                    target_branch: mr.target_branch.clone(),
                },
            };
            coding::handle_copilot_comment(&self.state, &event).await?;
            self.state.dedup.mark_seen(&key, DEDUP_TTL_SECONDS).await;
        }
        Ok(())
    }

    fn synthetic_mr_event(&self, project_id: u64, mr: &MrListItem) -> MergeRequestEvent {
        MergeRequestEvent {
            object_kind: "merge_request".to_string(),
            user: mr.author.clone(),
            project: synthetic_project(&self.state.config.gitlab_url, project_id, mr),
            object_attributes: MrAttributes {
                iid: mr.iid,
                title: mr.title.clone(),
                description: mr.description.clone(),
                action: "update".to_string(),
                source_branch: mr.source_branch.clone(),
                target_branch: mr.target_branch.clone(),
                last_commit: LastCommit {
                    id: mr.sha.clone(),
                    message: String::new(),
                },
                url: mr.web_url.clone(),
            },
        }
    }
}

// ── Jira issue poller ────────────────────────────────────────────────────

/// Runs the trigger-status query across configured project keys and hands
/// mapped issues to the coding orchestrator.
pub struct IssuePoller {
    jira: Arc<JiraClient>,
    jira_config: JiraConfig,
    orchestrator: Arc<CodingOrchestrator>,
    failures: u32,
}

impl IssuePoller {
    pub fn new(
        jira: Arc<JiraClient>,
        jira_config: JiraConfig,
        orchestrator: Arc<CodingOrchestrator>,
    ) -> Self {
        Self {
            jira,
            jira_config,
            orchestrator,
            failures: 0,
        }
    }

    pub async fn run(mut self) {
        let interval = self.jira_config.poll_interval_s;
        loop {
            match self.poll_once().await {
                Ok(()) => self.failures = 0,
                Err(e) => {
                    self.failures += 1;
                    error!(failures = self.failures, error = %format!("{e:#}"), "jira poll error");
                }
            }
            tokio::time::sleep(backoff(interval, self.failures)).await;
        }
    }

    async fn poll_once(&mut self) -> Result<()> {
        let Some(jql) = trigger_jql(
            &self.jira_config.trigger_status,
            &self.jira_config.project_map,
        ) else {
            return Ok(());
        };
        let issues = self.jira.search_issues(&jql).await?;
        if !issues.is_empty() {
            info!(count = issues.len(), "trigger-status issues discovered");
        }

        for issue in &issues {
            self.dispatch(issue).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, issue: &JiraIssue) -> Result<()> {
        let Some(mapping) = self.jira_config.project_map.get(issue.project_key()) else {
            return Ok(());
        };
        self.orchestrator.handle(issue, mapping).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copilot_core::types::ProjectMap;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff(30, 0), Duration::from_secs(30));
        assert_eq!(backoff(30, 1), Duration::from_secs(60));
        assert_eq!(backoff(30, 2), Duration::from_secs(120));
        assert_eq!(backoff(30, 3), Duration::from_secs(240));
        // Capped at five minutes no matter how many failures pile up.
        assert_eq!(backoff(30, 4), Duration::from_secs(300));
        assert_eq!(backoff(30, 60), Duration::from_secs(300));
    }

    fn sample_mr() -> MrListItem {
        serde_json::from_value(serde_json::json!({
            "iid": 7,
            "title": "Add search",
            "description": "adds a search box",
            "sha": "abc123",
            "source_branch": "feature/search",
            "target_branch": "main",
            "web_url": "https://gitlab.example.com/group/app/-/merge_requests/7",
            "author": {"id": 9, "username": "dev"},
            "updated_at": "2024-05-01T12:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn test_synthetic_project_derives_namespace_and_clone_url() {
        let project = synthetic_project("https://gitlab.example.com", 42, &sample_mr());
        assert_eq!(project.id, 42);
        assert_eq!(project.path_with_namespace, "group/app");
        assert_eq!(
            project.git_http_url,
            "https://gitlab.example.com/group/app.git"
        );
    }

    #[test]
    fn test_trigger_jql_quotes_and_sorts_keys() {
        let map: ProjectMap = serde_json::from_value(serde_json::json!({
            "mappings": {
                "ZED": {"gitlab_project_id": 2, "clone_url": "https://g/z.git"},
                "PROJ": {"gitlab_project_id": 1, "clone_url": "https://g/p.git"}
            }
        }))
        .unwrap();
        assert_eq!(
            trigger_jql("AI Ready", &map).unwrap(),
            "status = \"AI Ready\" AND project IN (\"PROJ\", \"ZED\")"
        );
        assert!(trigger_jql("AI Ready", &ProjectMap::default()).is_none());
    }
}
