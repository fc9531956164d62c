use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ── Tasks ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Review,
    Coding,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Review => "review",
            TaskKind::Coding => "coding",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable request to run the agent once.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub kind: TaskKind,
    /// Stable identifier for this logical unit of work; drives idempotency.
    pub task_id: String,
    pub repo_url: String,
    pub branch: String,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Set only when the executor runs in-process against a local checkout.
    pub repo_path: Option<PathBuf>,
}

/// Outcome of a task execution, discriminated by `result_type` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result_type", rename_all = "lowercase")]
pub enum TaskResult {
    Review {
        summary: String,
    },
    Coding {
        summary: String,
        /// Unified diff (`git diff --cached --binary`). Empty when the
        /// executor ran in-process and the files are already on disk.
        #[serde(default)]
        patch: String,
        /// Commit the patch is based on; checked against the local clone
        /// before applying.
        #[serde(default)]
        base_sha: String,
    },
}

impl TaskResult {
    pub fn summary(&self) -> &str {
        match self {
            TaskResult::Review { summary } | TaskResult::Coding { summary, .. } => summary,
        }
    }
}

// ── Merge request diff ───────────────────────────────────────────────────

/// The commit triple GitLab needs to anchor an inline discussion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRefs {
    pub base_sha: String,
    pub start_sha: String,
    pub head_sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrChange {
    pub old_path: String,
    pub new_path: String,
    pub diff: String,
    #[serde(default)]
    pub new_file: bool,
    #[serde(default)]
    pub deleted_file: bool,
    #[serde(default)]
    pub renamed_file: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrDetails {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub diff_refs: DiffRefs,
    #[serde(default)]
    pub changes: Vec<MrChange>,
}

// ── Jira project mapping ─────────────────────────────────────────────────

/// Mapping entry for a single Jira project to its GitLab counterpart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMapping {
    pub gitlab_project_id: u64,
    pub clone_url: String,
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
}

fn default_target_branch() -> String {
    "main".to_string()
}

/// Jira project key → GitLab project config, loaded from `JIRA_PROJECT_MAP`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectMap {
    #[serde(default)]
    pub mappings: HashMap<String, ProjectMapping>,
}

impl ProjectMap {
    pub fn get(&self, jira_project_key: &str) -> Option<&ProjectMapping> {
        self.mappings.get(jira_project_key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.mappings.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
