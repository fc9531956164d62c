use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use copilot_core::config::Config;
use copilot_core::error::AgentError;
use copilot_core::executor::{job_name, parse_result, TaskExecutor};
use copilot_core::state::ResultStore;
use copilot_core::types::{TaskResult, TaskSpec};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use serde_json::{json, Value};
use tracing::{info, warn};

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TTL_AFTER_FINISHED: i64 = 300;
/// Fallback summary annotation written by the worker when the result store
/// is unreachable from inside the cluster.
const RESULT_ANNOTATION: &str = "results.copilot-agent/summary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Running,
    Succeeded,
    Failed,
}

/// Per-execution environment for the worker. Secrets ride along as plain
/// env vars only when no Secret reference is configured.
fn build_env(task: &TaskSpec, config: &Config) -> Vec<Value> {
    let mut env = vec![
        json!({"name": "TASK_TYPE", "value": task.kind.as_str()}),
        json!({"name": "TASK_ID", "value": task.task_id}),
        json!({"name": "REPO_URL", "value": task.repo_url}),
        json!({"name": "BRANCH", "value": task.branch}),
        json!({"name": "SYSTEM_PROMPT", "value": task.system_prompt}),
        json!({"name": "USER_PROMPT", "value": task.user_prompt}),
        json!({"name": "TASK_PAYLOAD", "value": json!({"prompt": task.user_prompt}).to_string()}),
        json!({"name": "GITLAB_URL", "value": config.gitlab_url}),
        json!({"name": "RESULT_BACKEND", "value": "redis"}),
        // Writable cache dirs for the read-only root filesystem.
        json!({"name": "XDG_CACHE_HOME", "value": "/tmp/.cache"}),
        json!({"name": "HOME", "value": "/tmp"}),
    ];
    if config.k8s_secret_name.is_empty() {
        env.push(json!({"name": "GITLAB_TOKEN", "value": config.gitlab_token}));
        if !config.redis_url.is_empty() {
            env.push(json!({"name": "REDIS_URL", "value": config.redis_url}));
        }
        if !config.github_token.is_empty() {
            env.push(json!({"name": "GITHUB_TOKEN", "value": config.github_token}));
        }
        if !config.copilot_provider_type.is_empty() {
            env.push(json!({"name": "COPILOT_PROVIDER_TYPE", "value": config.copilot_provider_type}));
            env.push(json!({"name": "COPILOT_PROVIDER_BASE_URL", "value": config.copilot_provider_base_url}));
            env.push(json!({"name": "COPILOT_PROVIDER_API_KEY", "value": config.copilot_provider_api_key}));
        }
    }
    if !config.copilot_model.is_empty() {
        env.push(json!({"name": "COPILOT_MODEL", "value": config.copilot_model}));
    }
    env
}

/// Build the Job manifest for one task.
pub(crate) fn build_job(name: &str, task: &TaskSpec, config: &Config) -> Result<Job> {
    let mut env_from: Vec<Value> = Vec::new();
    if !config.k8s_secret_name.is_empty() {
        env_from.push(json!({"secretRef": {"name": config.k8s_secret_name}}));
    }
    if !config.k8s_configmap_name.is_empty() {
        env_from.push(json!({"configMapRef": {"name": config.k8s_configmap_name}}));
    }
    let host_aliases: Vec<Value> = config
        .k8s_job_host_aliases
        .iter()
        .map(|alias| json!({"ip": alias.ip, "hostnames": alias.hostnames}))
        .collect();

    let job = serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": name,
            "namespace": config.k8s_namespace,
        },
        "spec": {
            "backoffLimit": 1,
            "ttlSecondsAfterFinished": TTL_AFTER_FINISHED,
            "template": {
                "spec": {
                    "restartPolicy": "Never",
                    "hostAliases": host_aliases,
                    "volumes": [{"name": "tmp", "emptyDir": {}}],
                    "containers": [{
                        "name": "task",
                        "image": config.k8s_job_image,
                        "command": ["copilot-task-runner"],
                        "env": build_env(task, config),
                        "envFrom": env_from,
                        "volumeMounts": [{"name": "tmp", "mountPath": "/tmp"}],
                        "resources": {
                            "limits": {
                                "cpu": config.k8s_job_cpu_limit,
                                "memory": config.k8s_job_memory_limit,
                            },
                        },
                        "securityContext": {
                            "runAsNonRoot": true,
                            "runAsUser": 1000,
                            "readOnlyRootFilesystem": true,
                            "capabilities": {"drop": ["ALL"]},
                        },
                    }],
                },
            },
        },
    }))
    .context("building Job manifest")?;
    Ok(job)
}

/// Dispatches tasks as Kubernetes Jobs and retrieves results through the
/// result store. Deterministic names make duplicate dispatch an
/// `AlreadyExists` no-op that falls through to polling the existing Job.
pub struct KubernetesExecutor {
    client: Client,
    config: Arc<Config>,
    store: Arc<dyn ResultStore>,
}

impl KubernetesExecutor {
    /// Infers in-cluster config, falling back to the local kubeconfig.
    pub async fn new(config: Arc<Config>, store: Arc<dyn ResultStore>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("kubernetes client init")?;
        Ok(Self {
            client,
            config,
            store,
        })
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.config.k8s_namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.k8s_namespace)
    }

    async fn read_state(&self, name: &str) -> Result<JobState> {
        let job = match self.jobs().get(name).await {
            Ok(job) => job,
            // Deleted by a concurrent caller or the TTL controller.
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(JobState::Failed),
            Err(e) => return Err(e).context("read job status"),
        };
        let status = job.status.unwrap_or_default();
        if status.succeeded.unwrap_or(0) > 0 {
            Ok(JobState::Succeeded)
        } else if status.failed.unwrap_or(0) > 0 {
            Ok(JobState::Failed)
        } else {
            Ok(JobState::Running)
        }
    }

    async fn read_annotation(&self, name: &str) -> Option<String> {
        let job = self.jobs().get(name).await.ok()?;
        job.metadata.annotations?.get(RESULT_ANNOTATION).cloned()
    }

    async fn read_pod_logs(&self, name: &str) -> String {
        let selector = format!("job-name={name}");
        let pods = match self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await
        {
            Ok(pods) => pods,
            Err(e) => return format!("<failed to list pods: {e}>"),
        };
        let Some(pod_name) = pods.items.first().and_then(|p| p.metadata.name.clone()) else {
            return "<no pods found>".to_string();
        };
        self.pods()
            .logs(&pod_name, &LogParams::default())
            .await
            .unwrap_or_else(|e| format!("<failed to read logs: {e}>"))
    }

    async fn delete_job(&self, name: &str) {
        if let Err(e) = self.jobs().delete(name, &DeleteParams::background()).await {
            warn!(job = name, error = %e, "job cleanup failed");
        }
    }

    async fn wait_for_result(&self, name: &str, task: &TaskSpec) -> Result<TaskResult> {
        let deadline = Instant::now() + Duration::from_secs(self.config.k8s_job_timeout_s);

        while Instant::now() < deadline {
            if let Some(cached) = self.store.get(&task.task_id).await {
                return Ok(parse_result(&cached, task.kind));
            }

            match self.read_state(name).await? {
                JobState::Succeeded => {
                    if let Some(cached) = self.store.get(&task.task_id).await {
                        return Ok(parse_result(&cached, task.kind));
                    }
                    if let Some(annotation) = self.read_annotation(name).await {
                        return Ok(parse_result(&annotation, task.kind));
                    }
                    warn!(job = name, task_id = %task.task_id, "job succeeded without a result");
                    return Ok(parse_result("", task.kind));
                }
                JobState::Failed => {
                    let logs = self.read_pod_logs(name).await;
                    self.delete_job(name).await;
                    return Err(AgentError::ExecutionFailure {
                        message: format!("Job {name} failed. Pod logs:\n{logs}"),
                    }
                    .into());
                }
                JobState::Running => {}
            }
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
        }

        // Deletion on timeout is mandatory; a hung job must not linger.
        self.delete_job(name).await;
        Err(AgentError::ExecutionTimeout {
            seconds: self.config.k8s_job_timeout_s,
        }
        .into())
    }
}

#[async_trait]
impl TaskExecutor for KubernetesExecutor {
    async fn execute(&self, task: &TaskSpec) -> Result<TaskResult> {
        if let Some(cached) = self.store.get(&task.task_id).await {
            return Ok(parse_result(&cached, task.kind));
        }

        let name = job_name(task.kind, &task.task_id);
        let job = build_job(&name, task, &self.config)?;
        match self.jobs().create(&PostParams::default(), &job).await {
            Ok(_) => info!(job = %name, task_id = %task.task_id, "job created"),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!(job = %name, "job already exists, polling it");
            }
            Err(e) => return Err(e).context("create job"),
        }
        self.wait_for_result(&name, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copilot_core::types::TaskKind;
    use std::collections::HashMap;

    fn test_config(secret: &str) -> Config {
        let mut m = HashMap::new();
        m.insert("GITLAB_URL".into(), "https://gitlab.example.com".into());
        m.insert("GITLAB_TOKEN".into(), "glpat-secret".into());
        m.insert("GITLAB_WEBHOOK_SECRET".into(), "hush".into());
        m.insert("GITHUB_TOKEN".into(), "ghp-x".into());
        m.insert("TASK_EXECUTOR".into(), "kubernetes".into());
        m.insert("K8S_JOB_IMAGE".into(), "registry/worker:1".into());
        if !secret.is_empty() {
            m.insert("K8S_SECRET_NAME".into(), secret.into());
        }
        Config::from_map(&m).unwrap()
    }

    fn test_task() -> TaskSpec {
        TaskSpec {
            kind: TaskKind::Coding,
            task_id: "PROJ-42".into(),
            repo_url: "https://gitlab.example.com/g/p.git".into(),
            branch: "main".into(),
            system_prompt: "sys".into(),
            user_prompt: "do it".into(),
            repo_path: None,
        }
    }

    fn container(job: &Job) -> Value {
        let value = serde_json::to_value(job).unwrap();
        value["spec"]["template"]["spec"]["containers"][0].clone()
    }

    fn env_names(container: &Value) -> Vec<String> {
        container["env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_build_job_env_contract() {
        let job = build_job("copilot-coding-abc", &test_task(), &test_config("")).unwrap();
        let names = env_names(&container(&job));
        for required in ["TASK_TYPE", "TASK_ID", "REPO_URL", "BRANCH", "SYSTEM_PROMPT", "USER_PROMPT", "TASK_PAYLOAD"] {
            assert!(names.contains(&required.to_string()), "missing {required}");
        }
        // No Secret reference configured: token rides as plain env.
        assert!(names.contains(&"GITLAB_TOKEN".to_string()));
    }

    #[test]
    fn test_build_job_secret_ref_omits_plaintext_tokens() {
        let job = build_job("copilot-coding-abc", &test_task(), &test_config("worker-secrets")).unwrap();
        let container = container(&job);
        let names = env_names(&container);
        assert!(!names.contains(&"GITLAB_TOKEN".to_string()));
        assert!(!names.contains(&"GITHUB_TOKEN".to_string()));

        let env_from = container["envFrom"].as_array().unwrap();
        assert!(env_from
            .iter()
            .any(|e| e["secretRef"]["name"] == "worker-secrets"));
    }

    #[test]
    fn test_build_job_limits_and_lifecycle() {
        let job = build_job("copilot-coding-abc", &test_task(), &test_config("")).unwrap();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["spec"]["backoffLimit"], 1);
        assert_eq!(value["spec"]["ttlSecondsAfterFinished"], 300);
        let pod = &value["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        let limits = &pod["containers"][0]["resources"]["limits"];
        assert_eq!(limits["cpu"], "1");
        assert_eq!(limits["memory"], "1Gi");
        assert_eq!(
            pod["containers"][0]["securityContext"]["readOnlyRootFilesystem"],
            true
        );
    }
}
