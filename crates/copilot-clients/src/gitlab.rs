use chrono::{DateTime, Utc};
use copilot_core::types::{DiffRefs, MrDetails};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum GitLabError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("GitLab API error: {status} - {message}")]
    Api { status: u16, message: String },
}

// ── Webhook payloads ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookUser {
    pub id: u64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookProject {
    /// Numeric project ID for API calls.
    pub id: u64,
    pub path_with_namespace: String,
    pub git_http_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastCommit {
    /// Head commit SHA.
    pub id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrAttributes {
    /// MR number within the project.
    pub iid: u64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Trigger action: open, update, merge, close, ...
    #[serde(default)]
    pub action: String,
    pub source_branch: String,
    pub target_branch: String,
    pub last_commit: LastCommit,
    pub url: String,
}

/// GitLab MR webhook payload (relevant fields only). Also synthesized by the
/// MR poller for discovered merge requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequestEvent {
    pub object_kind: String,
    pub user: WebhookUser,
    pub project: WebhookProject,
    pub object_attributes: MrAttributes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteAttributes {
    /// Note ID; part of the `/copilot` task identity.
    pub id: u64,
    /// Comment body text.
    pub note: String,
    /// MergeRequest, Issue, Commit, ...
    pub noteable_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteMergeRequest {
    pub iid: u64,
    pub title: String,
    pub source_branch: String,
    pub target_branch: String,
}

/// GitLab note webhook payload for MR comments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteEvent {
    pub object_kind: String,
    pub user: WebhookUser,
    pub project: WebhookProject,
    pub object_attributes: NoteAttributes,
    pub merge_request: NoteMergeRequest,
}

// ── List models ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct MrListItem {
    pub iid: u64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Head commit SHA.
    pub sha: String,
    pub source_branch: String,
    pub target_branch: String,
    pub web_url: String,
    pub author: WebhookUser,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoteListItem {
    pub id: u64,
    pub body: String,
    pub author: WebhookUser,
    /// True for GitLab-generated notes (pushes, status changes).
    #[serde(default)]
    pub system: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MrCreated {
    pub iid: u64,
    pub web_url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ProjectInfo {
    id: u64,
}

// ── Client ───────────────────────────────────────────────────────────────

/// GitLab REST v4 client authenticated with a private token.
pub struct GitLabClient {
    base_url: String,
    token: String,
    http: Client,
}

impl GitLabClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: {
                let url: String = base_url.into();
                url.trim_end_matches('/').to_string()
            },
            token: token.into(),
            http: Client::new(),
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v4{path}", self.base_url)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("PRIVATE-TOKEN", &self.token)
            .header("Accept", "application/json")
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, GitLabError> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GitLabError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    /// MR metadata, diff anchors, and per-file unified diffs.
    pub async fn get_mr_details(
        &self,
        project_id: u64,
        mr_iid: u64,
    ) -> Result<MrDetails, GitLabError> {
        let url = self.api(&format!("/projects/{project_id}/merge_requests/{mr_iid}/changes"));
        let response = Self::check(self.request(self.http.get(&url)).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Unanchored MR comment.
    pub async fn post_mr_note(
        &self,
        project_id: u64,
        mr_iid: u64,
        body: &str,
    ) -> Result<(), GitLabError> {
        let url = self.api(&format!("/projects/{project_id}/merge_requests/{mr_iid}/notes"));
        let payload = serde_json::json!({ "body": body });
        Self::check(self.request(self.http.post(&url)).json(&payload).send().await?).await?;
        Ok(())
    }

    /// Inline discussion anchored to the `{base, start, head}` commit triple
    /// at a new-side line.
    pub async fn post_inline_discussion(
        &self,
        project_id: u64,
        mr_iid: u64,
        refs: &DiffRefs,
        file: &str,
        line: u32,
        body: &str,
    ) -> Result<(), GitLabError> {
        let url = self.api(&format!(
            "/projects/{project_id}/merge_requests/{mr_iid}/discussions"
        ));
        let payload = serde_json::json!({
            "body": body,
            "position": {
                "base_sha": refs.base_sha,
                "start_sha": refs.start_sha,
                "head_sha": refs.head_sha,
                "position_type": "text",
                "old_path": file,
                "new_path": file,
                "new_line": line,
            },
        });
        Self::check(self.request(self.http.post(&url)).json(&payload).send().await?).await?;
        Ok(())
    }

    pub async fn create_branch(
        &self,
        project_id: u64,
        branch: &str,
        from_ref: &str,
    ) -> Result<(), GitLabError> {
        let url = self.api(&format!("/projects/{project_id}/repository/branches"));
        let payload = serde_json::json!({ "branch": branch, "ref": from_ref });
        Self::check(self.request(self.http.post(&url)).json(&payload).send().await?).await?;
        Ok(())
    }

    pub async fn create_merge_request(
        &self,
        project_id: u64,
        source_branch: &str,
        target_branch: &str,
        title: &str,
        description: &str,
    ) -> Result<MrCreated, GitLabError> {
        let url = self.api(&format!("/projects/{project_id}/merge_requests"));
        let payload = serde_json::json!({
            "source_branch": source_branch,
            "target_branch": target_branch,
            "title": title,
            "description": description,
        });
        let response =
            Self::check(self.request(self.http.post(&url)).json(&payload).send().await?).await?;
        let created: MrCreated = response.json().await?;
        info!(project_id, mr_iid = created.iid, "merge request created");
        Ok(created)
    }

    pub async fn list_project_mrs(
        &self,
        project_id: u64,
        state: &str,
        updated_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<MrListItem>, GitLabError> {
        let url = self.api(&format!("/projects/{project_id}/merge_requests"));
        let mut request = self
            .request(self.http.get(&url))
            .query(&[("state", state), ("per_page", "100")]);
        if let Some(after) = updated_after {
            request = request.query(&[("updated_after", after.to_rfc3339())]);
        }
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn list_mr_notes(
        &self,
        project_id: u64,
        mr_iid: u64,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<NoteListItem>, GitLabError> {
        let url = self.api(&format!("/projects/{project_id}/merge_requests/{mr_iid}/notes"));
        let mut request = self
            .request(self.http.get(&url))
            .query(&[("per_page", "100"), ("sort", "asc")]);
        if let Some(after) = created_after {
            request = request.query(&[("created_after", after.to_rfc3339())]);
        }
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Resolve a project path or numeric ID to the numeric project ID.
    pub async fn resolve_project(&self, project_ref: &str) -> Result<u64, GitLabError> {
        if let Ok(id) = project_ref.parse::<u64>() {
            return Ok(id);
        }
        let url = self.api(&format!("/projects/{}", urlencoding::encode(project_ref)));
        let response = Self::check(self.request(self.http.get(&url)).send().await?).await?;
        let info: ProjectInfo = response.json().await?;
        Ok(info.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mr_event_deserializes() {
        let raw = serde_json::json!({
            "object_kind": "merge_request",
            "user": {"id": 9, "username": "dev"},
            "project": {
                "id": 42,
                "path_with_namespace": "group/app",
                "git_http_url": "https://gitlab.example.com/group/app.git",
                "extra_field": "ignored"
            },
            "object_attributes": {
                "iid": 7,
                "title": "Add search",
                "description": null,
                "action": "open",
                "source_branch": "feature/search",
                "target_branch": "main",
                "last_commit": {"id": "abc123", "message": "wip"},
                "url": "https://gitlab.example.com/group/app/-/merge_requests/7"
            }
        });
        let event: MergeRequestEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.project.id, 42);
        assert_eq!(event.object_attributes.action, "open");
        assert_eq!(event.object_attributes.last_commit.id, "abc123");
        assert!(event.object_attributes.description.is_none());
    }

    #[test]
    fn test_note_event_deserializes() {
        let raw = serde_json::json!({
            "object_kind": "note",
            "user": {"id": 3, "username": "reviewer"},
            "project": {
                "id": 42,
                "path_with_namespace": "group/app",
                "git_http_url": "https://gitlab.example.com/group/app.git"
            },
            "object_attributes": {
                "id": 555,
                "note": "/copilot rename X to Y",
                "noteable_type": "MergeRequest"
            },
            "merge_request": {
                "iid": 7,
                "title": "Add search",
                "source_branch": "feature/search",
                "target_branch": "main"
            }
        });
        let event: NoteEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.object_attributes.id, 555);
        assert_eq!(event.merge_request.iid, 7);
    }

    #[test]
    fn test_mr_details_parses_changes_payload() {
        let raw = serde_json::json!({
            "title": "Add search",
            "description": "adds a search box",
            "diff_refs": {"base_sha": "b", "start_sha": "s", "head_sha": "h"},
            "changes": [{
                "old_path": "src/x.py",
                "new_path": "src/x.py",
                "diff": "@@ -1 +1,2 @@\n line\n+new\n",
                "new_file": false,
                "deleted_file": false,
                "renamed_file": false
            }]
        });
        let details: MrDetails = serde_json::from_value(raw).unwrap();
        assert_eq!(details.diff_refs.head_sha, "h");
        assert_eq!(details.changes.len(), 1);
    }
}
