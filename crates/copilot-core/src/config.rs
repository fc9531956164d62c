use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::types::ProjectMap;

/// Task executor backend selected by `TASK_EXECUTOR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorBackend {
    Local,
    Kubernetes,
    ContainerApps,
}

/// State store backend selected by `STATE_BACKEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    Memory,
    Redis,
}

/// A `hostAliases` entry for Kubernetes Job pods.
#[derive(Debug, Clone, Deserialize)]
pub struct HostAlias {
    pub ip: String,
    pub hostnames: Vec<String>,
}

/// Jira configuration. Present only when URL, email, token, and the project
/// map are all set; the service runs review-only without it.
#[derive(Debug, Clone)]
pub struct JiraConfig {
    pub url: String,
    pub email: String,
    pub api_token: String,
    /// Status that hands an issue to the agent.
    pub trigger_status: String,
    pub in_progress_status: String,
    pub in_review_status: String,
    pub poll_interval_s: u64,
    pub project_map: ProjectMap,
}

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    // GitLab
    pub gitlab_url: String,
    pub gitlab_token: String,
    pub gitlab_webhook_secret: String,
    /// Project paths or numeric IDs that scope the poller.
    pub gitlab_projects: Vec<String>,
    pub gitlab_poll: bool,
    pub gitlab_poll_interval_s: u64,
    /// Minutes to look back on startup for recent MRs.
    pub gitlab_poll_lookback_mins: i64,
    /// When true, re-review on every push (dedup per head commit);
    /// when false, each MR is reviewed once (dedup per MR).
    pub gitlab_review_on_push: bool,
    /// Agent's own GitLab username, for the self-comment guard.
    pub agent_gitlab_username: String,
    /// Base directory for repo clones. Empty = system temp.
    pub clone_dir: String,

    // Server
    pub host: String,
    pub port: u16,

    // Agent session
    pub copilot_bin: String,
    pub copilot_model: String,
    pub copilot_timeout_s: u64,
    pub github_token: String,
    pub copilot_provider_type: String,
    pub copilot_provider_base_url: String,
    pub copilot_provider_api_key: String,

    // System prompts (override or append to built-in defaults)
    pub system_prompt: String,
    pub system_prompt_suffix: String,
    pub coding_system_prompt: String,
    pub coding_system_prompt_suffix: String,
    pub review_system_prompt: String,
    pub review_system_prompt_suffix: String,
    pub mr_comment_system_prompt: String,
    pub mr_comment_system_prompt_suffix: String,

    // Task execution
    pub task_executor: ExecutorBackend,
    pub k8s_namespace: String,
    pub k8s_job_image: String,
    pub k8s_job_cpu_limit: String,
    pub k8s_job_memory_limit: String,
    pub k8s_job_timeout_s: u64,
    pub k8s_job_host_aliases: Vec<HostAlias>,
    pub k8s_secret_name: String,
    pub k8s_configmap_name: String,
    pub aca_subscription_id: String,
    pub aca_resource_group: String,
    pub aca_job_name: String,
    pub aca_job_timeout_s: u64,
    pub azure_client_id: String,

    // State backend
    pub state_backend: StateBackend,
    pub redis_url: String,
    pub redis_host: String,
    pub redis_port: u16,

    // Git clone retry
    pub git_clone_max_retries: u32,
    pub git_clone_backoff_base_s: u64,

    // Approvals for /copilot commands
    pub copilot_approval_required: bool,

    pub jira: Option<JiraConfig>,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get_str(map: &HashMap<String, String>, key: &str, default: &str) -> String {
    map.get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn get_bool(map: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match map.get(key).map(String::as_str) {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_u64(map: &HashMap<String, String>, key: &str, default: u64) -> u64 {
    map.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u32(map: &HashMap<String, String>, key: &str, default: u32) -> u32 {
    map.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u16(map: &HashMap<String, String>, key: &str, default: u16) -> u16 {
    map.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_i64(map: &HashMap<String, String>, key: &str, default: i64) -> i64 {
    map.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut map = parse_dotenv();
        // Real environment wins over .env entries.
        for (k, v) in std::env::vars() {
            map.insert(k, v);
        }
        Self::from_map(&map)
    }

    /// Build from an already-merged key/value map. Split out from
    /// [`Config::from_env`] so tests can inject configuration.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let task_executor = match get_str(map, "TASK_EXECUTOR", "local").as_str() {
            "local" => ExecutorBackend::Local,
            "kubernetes" => ExecutorBackend::Kubernetes,
            "container_apps" => ExecutorBackend::ContainerApps,
            other => bail!("TASK_EXECUTOR must be local, kubernetes, or container_apps (got {other:?})"),
        };
        let state_backend = match get_str(map, "STATE_BACKEND", "memory").as_str() {
            "memory" => StateBackend::Memory,
            "redis" => StateBackend::Redis,
            other => bail!("STATE_BACKEND must be memory or redis (got {other:?})"),
        };

        let host_aliases_raw = get_str(map, "K8S_JOB_HOST_ALIASES", "");
        let k8s_job_host_aliases: Vec<HostAlias> = if host_aliases_raw.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&host_aliases_raw)
                .context("K8S_JOB_HOST_ALIASES must be a JSON array of {ip, hostnames} objects")?
        };

        let jira_url = get_str(map, "JIRA_URL", "");
        let jira_email = get_str(map, "JIRA_EMAIL", "");
        let jira_api_token = get_str(map, "JIRA_API_TOKEN", "");
        let jira_project_map_raw = get_str(map, "JIRA_PROJECT_MAP", "");

        let jira = if !jira_url.is_empty()
            && !jira_email.is_empty()
            && !jira_api_token.is_empty()
            && !jira_project_map_raw.is_empty()
        {
            let project_map: ProjectMap = serde_json::from_str(&jira_project_map_raw)
                .context("JIRA_PROJECT_MAP is not valid JSON")?;
            Some(JiraConfig {
                url: jira_url.trim_end_matches('/').to_string(),
                email: jira_email,
                api_token: jira_api_token,
                trigger_status: get_str(map, "JIRA_TRIGGER_STATUS", "AI Ready"),
                in_progress_status: get_str(map, "JIRA_IN_PROGRESS_STATUS", "In Progress"),
                in_review_status: get_str(map, "JIRA_IN_REVIEW_STATUS", "In Review"),
                poll_interval_s: get_u64(map, "JIRA_POLL_INTERVAL", 30),
                project_map,
            })
        } else {
            None
        };

        let config = Config {
            gitlab_url: get_str(map, "GITLAB_URL", "").trim_end_matches('/').to_string(),
            gitlab_token: get_str(map, "GITLAB_TOKEN", ""),
            gitlab_webhook_secret: get_str(map, "GITLAB_WEBHOOK_SECRET", ""),
            gitlab_projects: split_csv(&get_str(map, "GITLAB_PROJECTS", "")),
            gitlab_poll: get_bool(map, "GITLAB_POLL", false),
            gitlab_poll_interval_s: get_u64(map, "GITLAB_POLL_INTERVAL", 30),
            gitlab_poll_lookback_mins: get_i64(map, "GITLAB_POLL_LOOKBACK", 60),
            gitlab_review_on_push: get_bool(map, "GITLAB_REVIEW_ON_PUSH", true),
            agent_gitlab_username: get_str(map, "AGENT_GITLAB_USERNAME", ""),
            clone_dir: get_str(map, "CLONE_DIR", ""),
            host: get_str(map, "HOST", "0.0.0.0"),
            port: get_u16(map, "PORT", 8000),
            copilot_bin: get_str(map, "COPILOT_BIN", "copilot"),
            copilot_model: get_str(map, "COPILOT_MODEL", "gpt-4"),
            copilot_timeout_s: get_u64(map, "COPILOT_TIMEOUT", 300),
            github_token: get_str(map, "GITHUB_TOKEN", ""),
            copilot_provider_type: get_str(map, "COPILOT_PROVIDER_TYPE", ""),
            copilot_provider_base_url: get_str(map, "COPILOT_PROVIDER_BASE_URL", ""),
            copilot_provider_api_key: get_str(map, "COPILOT_PROVIDER_API_KEY", ""),
            system_prompt: get_str(map, "SYSTEM_PROMPT", ""),
            system_prompt_suffix: get_str(map, "SYSTEM_PROMPT_SUFFIX", ""),
            coding_system_prompt: get_str(map, "CODING_SYSTEM_PROMPT", ""),
            coding_system_prompt_suffix: get_str(map, "CODING_SYSTEM_PROMPT_SUFFIX", ""),
            review_system_prompt: get_str(map, "REVIEW_SYSTEM_PROMPT", ""),
            review_system_prompt_suffix: get_str(map, "REVIEW_SYSTEM_PROMPT_SUFFIX", ""),
            mr_comment_system_prompt: get_str(map, "MR_COMMENT_SYSTEM_PROMPT", ""),
            mr_comment_system_prompt_suffix: get_str(map, "MR_COMMENT_SYSTEM_PROMPT_SUFFIX", ""),
            task_executor,
            k8s_namespace: get_str(map, "K8S_NAMESPACE", "default"),
            k8s_job_image: get_str(map, "K8S_JOB_IMAGE", ""),
            k8s_job_cpu_limit: get_str(map, "K8S_JOB_CPU_LIMIT", "1"),
            k8s_job_memory_limit: get_str(map, "K8S_JOB_MEMORY_LIMIT", "1Gi"),
            k8s_job_timeout_s: get_u64(map, "K8S_JOB_TIMEOUT", 600),
            k8s_job_host_aliases,
            k8s_secret_name: get_str(map, "K8S_SECRET_NAME", ""),
            k8s_configmap_name: get_str(map, "K8S_CONFIGMAP_NAME", ""),
            aca_subscription_id: get_str(map, "ACA_SUBSCRIPTION_ID", ""),
            aca_resource_group: get_str(map, "ACA_RESOURCE_GROUP", ""),
            aca_job_name: get_str(map, "ACA_JOB_NAME", ""),
            aca_job_timeout_s: get_u64(map, "ACA_JOB_TIMEOUT", 600),
            azure_client_id: get_str(map, "AZURE_CLIENT_ID", ""),
            state_backend,
            redis_url: get_str(map, "REDIS_URL", ""),
            redis_host: get_str(map, "REDIS_HOST", ""),
            redis_port: get_u16(map, "REDIS_PORT", 6380),
            git_clone_max_retries: get_u32(map, "GIT_CLONE_MAX_RETRIES", 3).max(1),
            git_clone_backoff_base_s: get_u64(map, "GIT_CLONE_BACKOFF_BASE", 5),
            copilot_approval_required: get_bool(map, "COPILOT_APPROVAL_REQUIRED", false),
            jira,
        };

        config.validate()?;
        Ok(config)
    }

    /// True when Redis connectivity is configured (either URL or TLS host).
    pub fn redis_configured(&self) -> bool {
        !self.redis_url.is_empty() || !self.redis_host.is_empty()
    }

    /// Refuse inconsistent combinations at startup.
    fn validate(&self) -> Result<()> {
        if self.gitlab_url.is_empty() {
            bail!("GITLAB_URL is required");
        }
        if self.gitlab_token.is_empty() {
            bail!("GITLAB_TOKEN is required");
        }
        if self.github_token.is_empty() && self.copilot_provider_type.is_empty() {
            bail!(
                "No LLM authentication configured. Set one of:\n\
                 \u{2022} GITHUB_TOKEN for Copilot LLM access\n\
                 \u{2022} COPILOT_PROVIDER_TYPE + COPILOT_PROVIDER_BASE_URL + \
                 COPILOT_PROVIDER_API_KEY for BYOK providers"
            );
        }
        if self.state_backend == StateBackend::Redis && !self.redis_configured() {
            bail!("REDIS_URL or REDIS_HOST is required when STATE_BACKEND=redis");
        }
        if self.gitlab_poll && self.gitlab_projects.is_empty() {
            bail!("GITLAB_PROJECTS is required when GITLAB_POLL=true");
        }
        if !self.gitlab_poll && self.gitlab_webhook_secret.is_empty() {
            bail!(
                "GITLAB_WEBHOOK_SECRET is required when GITLAB_POLL is not enabled. \
                 Set GITLAB_WEBHOOK_SECRET for webhook mode or GITLAB_POLL=true for polling mode."
            );
        }
        if self.task_executor == ExecutorBackend::ContainerApps {
            let missing: Vec<&str> = [
                ("ACA_SUBSCRIPTION_ID", &self.aca_subscription_id),
                ("ACA_RESOURCE_GROUP", &self.aca_resource_group),
                ("ACA_JOB_NAME", &self.aca_job_name),
            ]
            .iter()
            .filter(|(_, v)| v.is_empty())
            .map(|(name, _)| *name)
            .collect();
            if !missing.is_empty() {
                bail!("Container Apps executor requires: {}", missing.join(", "));
            }
            if !self.redis_configured() {
                bail!(
                    "REDIS_URL or REDIS_HOST is required when TASK_EXECUTOR=container_apps \
                     (used for result passback from job executions)"
                );
            }
        }
        if self.task_executor == ExecutorBackend::Kubernetes {
            if self.k8s_job_image.is_empty() {
                bail!("K8S_JOB_IMAGE is required when TASK_EXECUTOR=kubernetes");
            }
            if self.k8s_secret_name.is_empty() {
                tracing::warn!(
                    "K8S_SECRET_NAME not set; Job pod credentials will use plaintext env vars"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_map() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("GITLAB_URL".into(), "https://gitlab.example.com".into());
        m.insert("GITLAB_TOKEN".into(), "glpat-x".into());
        m.insert("GITLAB_WEBHOOK_SECRET".into(), "hush".into());
        m.insert("GITHUB_TOKEN".into(), "ghp-x".into());
        m
    }

    #[test]
    fn test_minimal_webhook_config_is_valid() {
        let config = Config::from_map(&base_map()).unwrap();
        assert_eq!(config.port, 8000);
        assert!(config.jira.is_none());
        assert_eq!(config.git_clone_max_retries, 3);
    }

    #[test]
    fn test_missing_llm_auth_rejected() {
        let mut m = base_map();
        m.remove("GITHUB_TOKEN");
        let err = Config::from_map(&m).unwrap_err().to_string();
        assert!(err.contains("No LLM authentication"));
    }

    #[test]
    fn test_redis_backend_requires_endpoint() {
        let mut m = base_map();
        m.insert("STATE_BACKEND".into(), "redis".into());
        let err = Config::from_map(&m).unwrap_err().to_string();
        assert!(err.contains("REDIS_URL or REDIS_HOST"));
    }

    #[test]
    fn test_poll_mode_requires_projects() {
        let mut m = base_map();
        m.remove("GITLAB_WEBHOOK_SECRET");
        m.insert("GITLAB_POLL".into(), "true".into());
        let err = Config::from_map(&m).unwrap_err().to_string();
        assert!(err.contains("GITLAB_PROJECTS"));
    }

    #[test]
    fn test_webhook_mode_requires_secret() {
        let mut m = base_map();
        m.remove("GITLAB_WEBHOOK_SECRET");
        let err = Config::from_map(&m).unwrap_err().to_string();
        assert!(err.contains("GITLAB_WEBHOOK_SECRET"));
    }

    #[test]
    fn test_container_apps_requires_resources_and_redis() {
        let mut m = base_map();
        m.insert("TASK_EXECUTOR".into(), "container_apps".into());
        let err = Config::from_map(&m).unwrap_err().to_string();
        assert!(err.contains("ACA_SUBSCRIPTION_ID"));

        m.insert("ACA_SUBSCRIPTION_ID".into(), "sub".into());
        m.insert("ACA_RESOURCE_GROUP".into(), "rg".into());
        m.insert("ACA_JOB_NAME".into(), "job".into());
        let err = Config::from_map(&m).unwrap_err().to_string();
        assert!(err.contains("result passback"));
    }

    #[test]
    fn test_host_aliases_must_be_valid_json() {
        let mut m = base_map();
        m.insert("K8S_JOB_HOST_ALIASES".into(), "not json".into());
        assert!(Config::from_map(&m).is_err());

        m.insert(
            "K8S_JOB_HOST_ALIASES".into(),
            r#"[{"ip": "10.0.0.1", "hostnames": ["gitlab.internal"]}]"#.into(),
        );
        let config = Config::from_map(&m).unwrap();
        assert_eq!(config.k8s_job_host_aliases.len(), 1);
        assert_eq!(config.k8s_job_host_aliases[0].hostnames[0], "gitlab.internal");
    }

    #[test]
    fn test_jira_config_requires_all_fields() {
        let mut m = base_map();
        m.insert("JIRA_URL".into(), "https://x.atlassian.net".into());
        m.insert("JIRA_EMAIL".into(), "bot@example.com".into());
        // Token and map missing, so Jira stays disabled.
        assert!(Config::from_map(&m).unwrap().jira.is_none());

        m.insert("JIRA_API_TOKEN".into(), "tok".into());
        m.insert(
            "JIRA_PROJECT_MAP".into(),
            r#"{"mappings": {"PROJ": {"gitlab_project_id": 7, "clone_url": "https://gitlab.example.com/g/p.git"}}}"#.into(),
        );
        let jira = Config::from_map(&m).unwrap().jira.unwrap();
        assert_eq!(jira.trigger_status, "AI Ready");
        let mapping = jira.project_map.get("PROJ").unwrap();
        assert_eq!(mapping.gitlab_project_id, 7);
        assert_eq!(mapping.target_branch, "main");
    }
}
