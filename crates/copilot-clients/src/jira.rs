use std::time::Duration;

use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum JiraError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Jira API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("no transition to {status:?} for {issue}; available: {available:?}")]
    NoTransition {
        issue: String,
        status: String,
        available: Vec<String>,
    },
    #[error("client construction failed: {0}")]
    Build(String),
}

// ── Models ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct JiraStatus {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JiraIssueFields {
    pub summary: String,
    /// Plain text or an Atlassian document (ADF) value.
    #[serde(default)]
    pub description: Option<Value>,
    pub status: JiraStatus,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JiraIssue {
    pub id: String,
    /// Issue key, e.g. `PROJ-123`.
    pub key: String,
    pub fields: JiraIssueFields,
}

impl JiraIssue {
    /// Project key portion of the issue key (`PROJ` from `PROJ-123`).
    pub fn project_key(&self) -> &str {
        self.key.rsplit_once('-').map(|(p, _)| p).unwrap_or(&self.key)
    }

    /// The description as plain text, when it is one. ADF documents are
    /// passed to the agent as absent rather than half-rendered.
    pub fn description_text(&self) -> Option<&str> {
        self.fields.description.as_ref().and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct JiraSearchResponse {
    #[serde(default)]
    issues: Vec<JiraIssue>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JiraTransition {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct JiraTransitionsResponse {
    #[serde(default)]
    transitions: Vec<JiraTransition>,
}

/// Case-insensitive transition lookup by target status name.
pub fn find_transition<'a>(
    transitions: &'a [JiraTransition],
    target_status: &str,
) -> Option<&'a JiraTransition> {
    transitions
        .iter()
        .find(|t| t.name.eq_ignore_ascii_case(target_status))
}

// ── Client ───────────────────────────────────────────────────────────────

/// Jira REST v3 client using basic auth (email + API token).
pub struct JiraClient {
    base_url: String,
    http: Client,
}

impl JiraClient {
    pub fn new(base_url: &str, email: &str, api_token: &str) -> Result<Self, JiraError> {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{email}:{api_token}"));
        let mut headers = HeaderMap::new();
        let mut auth_value = HeaderValue::from_str(&format!("Basic {auth}"))
            .map_err(|e| JiraError::Build(e.to_string()))?;
        auth_value.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| JiraError::Build(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/rest/api/3{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, JiraError> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(JiraError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    /// JQL search, following `nextPageToken` pagination to the end.
    pub async fn search_issues(&self, jql: &str) -> Result<Vec<JiraIssue>, JiraError> {
        let mut all_issues = Vec::new();
        let mut next_page_token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> =
                vec![("jql", jql.to_string()), ("maxResults", "50".to_string())];
            if let Some(token) = &next_page_token {
                query.push(("nextPageToken", token.clone()));
            }

            let response = Self::check(
                self.http
                    .get(self.api("/search/jql"))
                    .query(&query)
                    .send()
                    .await?,
            )
            .await?;
            let page: JiraSearchResponse = response.json().await?;
            all_issues.extend(page.issues);

            match page.next_page_token {
                Some(token) => next_page_token = Some(token),
                None => break,
            }
        }

        info!(jql, count = all_issues.len(), "jira search complete");
        Ok(all_issues)
    }

    /// Transition an issue to the target status by name.
    pub async fn transition_issue(
        &self,
        issue_key: &str,
        target_status: &str,
    ) -> Result<(), JiraError> {
        let response = Self::check(
            self.http
                .get(self.api(&format!("/issue/{issue_key}/transitions")))
                .send()
                .await?,
        )
        .await?;
        let available: JiraTransitionsResponse = response.json().await?;

        let Some(transition) = find_transition(&available.transitions, target_status) else {
            return Err(JiraError::NoTransition {
                issue: issue_key.to_string(),
                status: target_status.to_string(),
                available: available.transitions.into_iter().map(|t| t.name).collect(),
            });
        };

        let payload = serde_json::json!({ "transition": { "id": transition.id } });
        Self::check(
            self.http
                .post(self.api(&format!("/issue/{issue_key}/transitions")))
                .json(&payload)
                .send()
                .await?,
        )
        .await?;
        info!(issue = issue_key, status = target_status, "jira issue transitioned");
        Ok(())
    }

    /// Add a plain-text comment in ADF form.
    pub async fn add_comment(&self, issue_key: &str, body: &str) -> Result<(), JiraError> {
        let payload = serde_json::json!({
            "body": {
                "type": "doc",
                "version": 1,
                "content": [{
                    "type": "paragraph",
                    "content": [{"type": "text", "text": body}],
                }],
            },
        });
        Self::check(
            self.http
                .post(self.api(&format!("/issue/{issue_key}/comment")))
                .json(&payload)
                .send()
                .await?,
        )
        .await?;
        info!(issue = issue_key, "jira comment added");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(key: &str, description: Value) -> JiraIssue {
        serde_json::from_value(serde_json::json!({
            "id": "1000",
            "key": key,
            "fields": {
                "summary": "Add rate limiting",
                "description": description,
                "status": {"id": "3", "name": "AI Ready"},
                "labels": ["backend"]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_project_key_extraction() {
        assert_eq!(issue("PROJ-42", Value::Null).project_key(), "PROJ");
        assert_eq!(issue("AB-CD-7", Value::Null).project_key(), "AB-CD");
    }

    #[test]
    fn test_description_text_only_for_strings() {
        assert_eq!(
            issue("PROJ-1", Value::String("plain text".into())).description_text(),
            Some("plain text")
        );
        let adf = serde_json::json!({"type": "doc", "version": 1, "content": []});
        assert_eq!(issue("PROJ-2", adf).description_text(), None);
        assert_eq!(issue("PROJ-3", Value::Null).description_text(), None);
    }

    #[test]
    fn test_find_transition_case_insensitive() {
        let transitions = vec![
            JiraTransition { id: "11".into(), name: "In Progress".into() },
            JiraTransition { id: "21".into(), name: "In Review".into() },
        ];
        assert_eq!(find_transition(&transitions, "in progress").unwrap().id, "11");
        assert_eq!(find_transition(&transitions, "IN REVIEW").unwrap().id, "21");
        assert!(find_transition(&transitions, "Done").is_none());
    }

    #[test]
    fn test_search_response_pagination_token() {
        let page: JiraSearchResponse = serde_json::from_value(serde_json::json!({
            "issues": [],
            "nextPageToken": "abc"
        }))
        .unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));

        let last: JiraSearchResponse =
            serde_json::from_value(serde_json::json!({"issues": []})).unwrap();
        assert!(last.next_page_token.is_none());
    }
}
