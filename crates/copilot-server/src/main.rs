mod coding;
mod poll;
mod review;
mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use copilot_clients::gitlab::GitLabClient;
use copilot_clients::jira::JiraClient;
use copilot_core::approval::{create_approval_store, ApprovalStore};
use copilot_core::config::{Config, ExecutorBackend};
use copilot_core::executor::TaskExecutor;
use copilot_core::state::{
    create_dedup, create_lock, create_result_store, DeduplicationStore, DistributedLock,
};
use copilot_core::state_memory::ProcessedSet;
use copilot_core::workspace;
use copilot_executor::aca::ContainerAppsExecutor;
use copilot_executor::k8s::KubernetesExecutor;
use copilot_executor::local::LocalExecutor;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Per-repo lock lease; renewed at half this while held.
pub const REPO_LOCK_TTL_SECONDS: u64 = 300;
/// Dedup entries absorb duplicate deliveries for a day.
pub const DEDUP_TTL_SECONDS: u64 = 86_400;

pub struct AppState {
    pub config: Arc<Config>,
    pub executor: Arc<dyn TaskExecutor>,
    pub gitlab: Arc<GitLabClient>,
    pub repo_locks: Arc<dyn DistributedLock>,
    pub dedup: Arc<dyn DeduplicationStore>,
    pub approvals: Arc<dyn ApprovalStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "copilot_server=info,copilot_core=info,copilot_executor=info,copilot_clients=info,tower_http=warn"
            .into()
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Config validation failures exit non-zero here; the running service
    // never exits on transient failures.
    let config = Arc::new(Config::from_env()?);

    workspace::cleanup_stale(&config.clone_dir);

    let repo_locks = create_lock(&config).await?;
    let dedup = create_dedup(&config).await?;
    let result_store = create_result_store(&config).await?;
    let approvals = create_approval_store(&config).await?;

    let executor: Arc<dyn TaskExecutor> = match config.task_executor {
        ExecutorBackend::Local => Arc::new(LocalExecutor::new(&config, Arc::clone(&result_store))),
        ExecutorBackend::Kubernetes => Arc::new(
            KubernetesExecutor::new(Arc::clone(&config), Arc::clone(&result_store)).await?,
        ),
        ExecutorBackend::ContainerApps => Arc::new(ContainerAppsExecutor::new(
            Arc::clone(&config),
            Arc::clone(&result_store),
        )),
    };

    let gitlab = Arc::new(GitLabClient::new(&config.gitlab_url, &config.gitlab_token));

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        executor: Arc::clone(&executor),
        gitlab: Arc::clone(&gitlab),
        repo_locks: Arc::clone(&repo_locks),
        dedup,
        approvals,
    });

    let mut poller_handles = Vec::new();

    if config.gitlab_poll {
        let mut project_ids = Vec::new();
        for entry in &config.gitlab_projects {
            match gitlab.resolve_project(entry).await {
                Ok(id) => project_ids.push(id),
                Err(e) => warn!(project = %entry, error = %e, "failed to resolve project, skipping"),
            }
        }
        info!(
            projects = project_ids.len(),
            interval = config.gitlab_poll_interval_s,
            "gitlab poller started"
        );
        let poller = poll::MrPoller::new(Arc::clone(&state), project_ids);
        poller_handles.push(tokio::spawn(poller.run()));
    }

    if let Some(jira_config) = config.jira.clone() {
        let jira = Arc::new(JiraClient::new(
            &jira_config.url,
            &jira_config.email,
            &jira_config.api_token,
        )?);
        let orchestrator = Arc::new(coding::CodingOrchestrator::new(
            Arc::clone(&config),
            jira_config.clone(),
            Arc::clone(&gitlab),
            Arc::clone(&jira),
            executor,
            repo_locks,
            Arc::new(ProcessedSet::default()),
        ));
        info!(interval = jira_config.poll_interval_s, "jira poller started");
        let poller = poll::IssuePoller::new(jira, jira_config, orchestrator);
        poller_handles.push(tokio::spawn(poller.run()));
    }

    let app = Router::new()
        .route("/webhook", post(routes::webhook))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    info!(gitlab_url = %config.gitlab_url, "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cancel the poll loops and join them before exiting.
    for handle in poller_handles {
        handle.abort();
        let _ = handle.await;
    }
    info!("service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
