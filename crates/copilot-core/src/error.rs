use thiserror::Error;

/// Failure kinds the orchestrators need to tell apart.
///
/// Everything else propagates as plain `anyhow` errors; these variants carry
/// retry / cleanup policy: transient clone exhaustion must not mark a task as
/// processed, and divergence or timeout surfaces as an agent failure.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("git clone failed after {attempts} attempts: {message}")]
    TransientClone { attempts: u32, message: String },

    #[error("task execution failed: {message}")]
    ExecutionFailure { message: String },

    #[error("task execution timed out after {seconds}s")]
    ExecutionTimeout { seconds: u64 },

    #[error("clone diverged: remote base {remote_sha} vs local HEAD {local_sha}")]
    DivergedClone {
        remote_sha: String,
        local_sha: String,
    },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),
}
