use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::types::{TaskKind, TaskResult, TaskSpec};

/// Stored results absorb duplicate deliveries for an hour.
pub const RESULT_TTL_SECONDS: u64 = 3600;

/// Executes one agent task and returns its structured result.
///
/// Implementations are idempotent per `task_id`: the first call does the
/// work and stores the serialized result; later calls observe the stored
/// value. Errors propagate and are never cached, so retries can succeed.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &TaskSpec) -> Result<TaskResult>;
}

/// Parse a raw worker output into a structured result.
///
/// JSON carrying a `result_type` discriminator is decoded directly; anything
/// else is wrapped as a summary of the appropriate variant.
pub fn parse_result(raw: &str, kind: TaskKind) -> TaskResult {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        if value.get("result_type").is_some() {
            if let Ok(result) = serde_json::from_value::<TaskResult>(value) {
                return result;
            }
        }
    }
    match kind {
        TaskKind::Review => TaskResult::Review {
            summary: raw.to_string(),
        },
        TaskKind::Coding => TaskResult::Coding {
            summary: raw.to_string(),
            patch: String::new(),
            base_sha: String::new(),
        },
    }
}

/// Deterministic job name for remote executors:
/// `copilot-{kind}-{hex16(sha256(task_id))}`, lowercased, non-alphanumerics
/// replaced with `-`, capped at 63 characters. Backends that de-duplicate by
/// name turn a duplicate dispatch into an `AlreadyExists` no-op.
pub fn job_name(kind: TaskKind, task_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(task_id.as_bytes()));
    let id_hash = &digest[..16];
    let name = format!("copilot-{}-{id_hash}", kind.as_str());
    let sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    sanitized.chars().take(63).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_name_deterministic_and_bounded() {
        let a = job_name(TaskKind::Review, "review:42:7:abc123");
        let b = job_name(TaskKind::Review, "review:42:7:abc123");
        assert_eq!(a, b);
        assert!(a.starts_with("copilot-review-"));
        assert!(a.len() <= 63);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn test_job_name_distinct_per_task() {
        assert_ne!(
            job_name(TaskKind::Coding, "PROJ-1"),
            job_name(TaskKind::Coding, "PROJ-2")
        );
    }

    #[test]
    fn test_parse_result_typed_coding() {
        let raw = r#"{"result_type": "coding", "summary": "done", "patch": "diff", "base_sha": "abc"}"#;
        let result = parse_result(raw, TaskKind::Coding);
        assert_eq!(
            result,
            TaskResult::Coding {
                summary: "done".into(),
                patch: "diff".into(),
                base_sha: "abc".into(),
            }
        );
    }

    #[test]
    fn test_parse_result_raw_string_wraps_by_kind() {
        let result = parse_result("looks good", TaskKind::Review);
        assert_eq!(
            result,
            TaskResult::Review {
                summary: "looks good".into()
            }
        );

        let result = parse_result("made changes", TaskKind::Coding);
        let TaskResult::Coding { summary, patch, base_sha } = result else {
            panic!("expected coding result");
        };
        assert_eq!(summary, "made changes");
        assert!(patch.is_empty());
        assert!(base_sha.is_empty());
    }

    #[test]
    fn test_parse_result_json_without_discriminator_stays_raw() {
        let raw = r#"{"summary": "missing discriminator"}"#;
        let result = parse_result(raw, TaskKind::Review);
        assert_eq!(result.summary(), raw);
    }
}
