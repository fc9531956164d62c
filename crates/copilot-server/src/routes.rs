use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use copilot_clients::gitlab::{MergeRequestEvent, NoteEvent};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::error;

use crate::{coding, review, AppState};

const HANDLED_ACTIONS: &[&str] = &["open", "update"];

/// Constant-time webhook token comparison. Absent header or unset secret
/// both fail closed.
pub(crate) fn verify_token(received: Option<&str>, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let Some(received) = received else {
        return false;
    };
    received.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn queued() -> Response {
    (StatusCode::OK, Json(json!({"status": "queued"}))).into_response()
}

fn ignored(reason: String) -> Response {
    (StatusCode::OK, Json(json!({"status": "ignored", "reason": reason}))).into_response()
}

fn bad_request(reason: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": reason}))).into_response()
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// HMAC-authenticated ingress for MR and note events. Returns immediately;
/// handlers run as background tasks and their failures never reach the HTTP
/// status.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = headers.get("X-Gitlab-Token").and_then(|v| v.to_str().ok());
    if !verify_token(token, &state.config.gitlab_webhook_secret) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid webhook token"})),
        )
            .into_response();
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return bad_request("invalid JSON body");
    };

    let object_kind = payload
        .get("object_kind")
        .and_then(Value::as_str)
        .map(str::to_string);
    match object_kind.as_deref() {
        Some("merge_request") => {
            let event: MergeRequestEvent = match serde_json::from_value(payload) {
                Ok(event) => event,
                Err(_) => return bad_request("malformed merge_request payload"),
            };
            let action = event.object_attributes.action.clone();
            if !HANDLED_ACTIONS.contains(&action.as_str()) {
                return ignored(format!("action '{action}' not handled"));
            }
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(e) = review::handle_review(&state, &event).await {
                    error!(error = %format!("{e:#}"), "background review failed");
                }
            });
            queued()
        }
        Some("note") => {
            let event: NoteEvent = match serde_json::from_value(payload) {
                Ok(event) => event,
                Err(_) => return bad_request("malformed note payload"),
            };
            if event.object_attributes.noteable_type != "MergeRequest" {
                return ignored("not an MR note".to_string());
            }
            if coding::parse_copilot_command(&event.object_attributes.note).is_none() {
                return ignored("not a /copilot command".to_string());
            }
            let agent_username = &state.config.agent_gitlab_username;
            if !agent_username.is_empty() && event.user.username == *agent_username {
                return ignored("self-comment".to_string());
            }
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(e) = coding::handle_copilot_comment(&state, &event).await {
                    error!(error = %format!("{e:#}"), "background copilot comment failed");
                }
            });
            queued()
        }
        other => ignored(format!("unhandled event: {}", other.unwrap_or("unknown"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_token_matches() {
        assert!(verify_token(Some("hush"), "hush"));
    }

    #[test]
    fn test_verify_token_rejects_mismatch_and_absence() {
        assert!(!verify_token(Some("wrong"), "hush"));
        assert!(!verify_token(Some("hus"), "hush"));
        assert!(!verify_token(None, "hush"));
    }

    #[test]
    fn test_verify_token_fails_closed_without_secret() {
        assert!(!verify_token(Some("anything"), ""));
        assert!(!verify_token(None, ""));
    }

    #[test]
    fn test_handled_actions() {
        assert!(HANDLED_ACTIONS.contains(&"open"));
        assert!(HANDLED_ACTIONS.contains(&"update"));
        assert!(!HANDLED_ACTIONS.contains(&"merge"));
        assert!(!HANDLED_ACTIONS.contains(&"close"));
    }
}
