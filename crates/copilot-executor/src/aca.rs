use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use copilot_core::config::Config;
use copilot_core::error::AgentError;
use copilot_core::executor::{parse_result, TaskExecutor};
use copilot_core::state::ResultStore;
use copilot_core::types::{TaskResult, TaskSpec};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

// The ACA management API is slower than k8s; poll less aggressively.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Sentinel TTL covering the expected job duration, so a second dispatcher
/// waits for the running execution instead of starting a new one.
const EXEC_LOCK_TTL: u64 = 900;
const EXEC_LOCK_PREFIX: &str = "exec-lock:";

const ARM_BASE: &str = "https://management.azure.com";
const ARM_API_VERSION: &str = "2024-03-01";
const ARM_SCOPE: &str = "https://management.azure.com/";
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// ARM bearer tokens from the instance metadata service (managed identity),
/// cached until shortly before expiry.
pub struct AzureCredential {
    http: reqwest::Client,
    client_id: String,
    cached: Mutex<Option<(String, Instant)>>,
}

impl AzureCredential {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: client_id.into(),
            cached: Mutex::new(None),
        }
    }

    async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        let mut query = vec![
            ("api-version", "2018-02-01".to_string()),
            ("resource", ARM_SCOPE.to_string()),
        ];
        if !self.client_id.is_empty() {
            query.push(("client_id", self.client_id.clone()));
        }
        let response: Value = self
            .http
            .get(IMDS_TOKEN_URL)
            .query(&query)
            .header("Metadata", "true")
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("managed identity token request")?
            .error_for_status()
            .context("managed identity token request rejected")?
            .json()
            .await
            .context("managed identity token parse")?;

        let token = response["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("managed identity response missing access_token"))?
            .to_string();
        let expires_in = response["expires_in"]
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
            .or_else(|| response["expires_in"].as_u64())
            .unwrap_or(300);
        *cached = Some((
            token.clone(),
            Instant::now() + Duration::from_secs(expires_in.saturating_sub(60)),
        ));
        Ok(token)
    }
}

/// Per-execution env overrides. Only non-sensitive task params are passed;
/// secrets are pre-configured on the Job template as Key Vault references
/// and must not show up in Azure Activity Logs.
fn build_env_overrides(task: &TaskSpec) -> Vec<Value> {
    vec![
        json!({"name": "TASK_TYPE", "value": task.kind.as_str()}),
        json!({"name": "TASK_ID", "value": task.task_id}),
        json!({"name": "REPO_URL", "value": task.repo_url}),
        json!({"name": "BRANCH", "value": task.branch}),
        json!({"name": "SYSTEM_PROMPT", "value": task.system_prompt}),
        json!({"name": "USER_PROMPT", "value": task.user_prompt}),
        json!({"name": "TASK_PAYLOAD", "value": json!({"prompt": task.user_prompt}).to_string()}),
    ]
}

/// Dispatches tasks as Azure Container Apps Job executions.
///
/// ACA always creates new executions, so idempotency comes from an
/// `exec-lock:` sentinel in the result store rather than deterministic names.
pub struct ContainerAppsExecutor {
    http: reqwest::Client,
    credential: AzureCredential,
    config: Arc<Config>,
    store: Arc<dyn ResultStore>,
}

impl ContainerAppsExecutor {
    pub fn new(config: Arc<Config>, store: Arc<dyn ResultStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            credential: AzureCredential::new(config.azure_client_id.clone()),
            config,
            store,
        }
    }

    fn job_url(&self) -> String {
        format!(
            "{ARM_BASE}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.App/jobs/{}",
            self.config.aca_subscription_id, self.config.aca_resource_group, self.config.aca_job_name,
        )
    }

    async fn start_execution(&self, task: &TaskSpec) -> Result<String> {
        let token = self.credential.token().await?;
        let body = json!({
            "template": {
                "containers": [{
                    "name": "task",
                    "env": build_env_overrides(task),
                }],
            },
        });
        let response = self
            .http
            .post(format!("{}/start?api-version={ARM_API_VERSION}", self.job_url()))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .context("container apps job start request")?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(anyhow!("container apps job start failed: {status} {message}"));
        }

        // The execution name arrives in the response body or, for async
        // accepts, as the tail of the Location header.
        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let parsed: Value = response.json().await.unwrap_or(Value::Null);
        let execution_name = parsed["name"]
            .as_str()
            .map(str::to_string)
            .or_else(|| {
                location.as_deref().and_then(|l| {
                    l.split('?').next()?.rsplit('/').next().map(str::to_string)
                })
            })
            .ok_or_else(|| anyhow!("container apps start response carried no execution name"))?;

        info!(
            job = %self.config.aca_job_name,
            execution = %execution_name,
            task_id = %task.task_id,
            "container apps execution started"
        );
        Ok(execution_name)
    }

    async fn execution_status(&self, execution_name: &str) -> Result<String> {
        let token = self.credential.token().await?;
        let response: Value = self
            .http
            .get(format!(
                "{}/executions/{execution_name}?api-version={ARM_API_VERSION}",
                self.job_url()
            ))
            .bearer_auth(&token)
            .send()
            .await
            .context("container apps execution status request")?
            .error_for_status()
            .context("container apps execution status rejected")?
            .json()
            .await
            .context("container apps execution status parse")?;
        Ok(response["properties"]["status"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string())
    }

    async fn stop_execution(&self, execution_name: &str) {
        let Ok(token) = self.credential.token().await else {
            return;
        };
        let result = self
            .http
            .post(format!(
                "{}/executions/{execution_name}/stop?api-version={ARM_API_VERSION}",
                self.job_url()
            ))
            .bearer_auth(&token)
            .send()
            .await;
        if let Err(e) = result {
            warn!(execution = execution_name, error = %e, "execution stop failed");
        }
    }

    async fn wait_for_result(&self, execution_name: &str, task: &TaskSpec) -> Result<TaskResult> {
        let deadline = Instant::now() + Duration::from_secs(self.config.aca_job_timeout_s);

        while Instant::now() < deadline {
            if let Some(cached) = self.store.get(&task.task_id).await {
                return Ok(parse_result(&cached, task.kind));
            }

            match self.execution_status(execution_name).await?.as_str() {
                "Succeeded" => {
                    if let Some(cached) = self.store.get(&task.task_id).await {
                        return Ok(parse_result(&cached, task.kind));
                    }
                    warn!(
                        execution = execution_name,
                        task_id = %task.task_id,
                        "execution succeeded without a result"
                    );
                    return Ok(parse_result("", task.kind));
                }
                "Failed" => {
                    return Err(AgentError::ExecutionFailure {
                        message: format!(
                            "Container Apps Job execution {execution_name} failed. \
                             Check the job logs for details."
                        ),
                    }
                    .into());
                }
                _ => {}
            }
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
        }

        self.stop_execution(execution_name).await;
        Err(AgentError::ExecutionTimeout {
            seconds: self.config.aca_job_timeout_s,
        }
        .into())
    }
}

#[async_trait]
impl TaskExecutor for ContainerAppsExecutor {
    async fn execute(&self, task: &TaskSpec) -> Result<TaskResult> {
        if let Some(cached) = self.store.get(&task.task_id).await {
            return Ok(parse_result(&cached, task.kind));
        }

        let lock_key = format!("{EXEC_LOCK_PREFIX}{}", task.task_id);
        if let Some(existing) = self.store.get(&lock_key).await {
            info!(task_id = %task.task_id, execution = %existing, "execution already started");
            return self.wait_for_result(&existing, task).await;
        }

        let execution_name = self.start_execution(task).await?;
        self.store.set(&lock_key, &execution_name, EXEC_LOCK_TTL).await;
        self.wait_for_result(&execution_name, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copilot_core::types::TaskKind;

    #[test]
    fn test_env_overrides_carry_no_secrets() {
        let task = TaskSpec {
            kind: TaskKind::Review,
            task_id: "review:1:2:abc".into(),
            repo_url: "https://gitlab.example.com/g/p.git".into(),
            branch: "feature".into(),
            system_prompt: "sys".into(),
            user_prompt: "review this".into(),
            repo_path: None,
        };
        let env = build_env_overrides(&task);
        let names: Vec<&str> = env.iter().filter_map(|e| e["name"].as_str()).collect();
        assert_eq!(
            names,
            vec!["TASK_TYPE", "TASK_ID", "REPO_URL", "BRANCH", "SYSTEM_PROMPT", "USER_PROMPT", "TASK_PAYLOAD"]
        );
        // Nothing token-shaped is ever passed per-execution.
        assert!(!names.iter().any(|n| n.contains("TOKEN") || n.contains("SECRET")));
    }
}
