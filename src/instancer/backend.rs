//! The isolation-backend seam: Docker and Kubernetes provisioning share this
//! trait so the consumer loop and the reaper never know which one is live.
//! Grounded on `instancer/backends/abc.py`'s abstract base and mirrored for
//! sweep semantics by `prunner/backends/{docker,k8s}.py`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
    #[error("worker provisioning failed: {0}")]
    Provisioning(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// What the instancer asks a backend to provision: everything a worker
/// sidecar needs via environment variables, per `docker/worker/init.py`'s
/// env-var contract.
pub struct StartWorkerSpec {
    pub job_id: uuid::Uuid,
    /// Selects which coding agent the worker runs; the allowed model names
    /// double as agent identifiers (e.g. `codex-gpt-5.2`), so this is just
    /// the admitted job's model.
    pub agent_id: String,
    pub secret_ref: String,
    pub secret_store_read_token: String,
    pub result_token: String,
    pub secret_store_url: String,
    pub model_proxy_url: String,
    pub result_service_url: String,
}

/// Splits a `scheme://host:port` base URL into its host and port, the shape
/// the worker ABI wants (`SECRETSVC_HOST/PORT`, `RESULTSVC_HOST/PORT`) rather
/// than a single URL.
pub fn host_port(base_url: &str) -> (String, u16) {
    let without_scheme = base_url.split("://").nth(1).unwrap_or(base_url);
    let host_port_part = without_scheme.split('/').next().unwrap_or(without_scheme);
    let mut parts = host_port_part.splitn(2, ':');
    let host = parts.next().unwrap_or_default().to_string();
    let port = parts.next().and_then(|p| p.parse().ok()).unwrap_or(80);
    (host, port)
}

/// A running or recently-started worker, keyed by the label/name the backend
/// uses to find it again on a later sweep.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub job_id: uuid::Uuid,
    pub backend_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Active,
    Stopped,
    TimedOut,
    /// Pod-orchestrator only: the namespace has outlived its grace period with
    /// no backing `Job` object ever created for it.
    Lost,
    /// Pod-orchestrator only: the backing `Job` completed with no failures —
    /// cleaned up, but not a job failure.
    Completed,
}

#[derive(Debug, Clone)]
pub struct SweptWorker {
    pub job_id: uuid::Uuid,
    pub backend_id: String,
    pub state: WorkerState,
}

#[async_trait]
pub trait WorkerBackend: Send + Sync {
    async fn start_worker(&self, spec: &StartWorkerSpec) -> Result<WorkerHandle>;

    async fn running_workers(&self) -> Result<Vec<WorkerHandle>>;

    /// Upper bound on simultaneously running workers this backend will
    /// tolerate absent an explicit `INSTANCER_MAX_CONCURRENT_JOBS` override.
    /// `None` means unbounded (e.g. the Kubernetes backend, where the
    /// cluster itself is the capacity boundary).
    fn default_max_concurrency(&self) -> Option<usize>;

    /// Classifies every worker this backend knows about as active, cleanly
    /// stopped, or timed out (running past `max_age` since start), tearing
    /// down anything stopped or timed out and returning what it found.
    async fn sweep(&self, max_age: chrono::Duration) -> Result<Vec<SweptWorker>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_splits_scheme_and_path() {
        assert_eq!(host_port("http://secretsvc:8001"), ("secretsvc".to_string(), 8001));
        assert_eq!(host_port("http://secretsvc:8001/"), ("secretsvc".to_string(), 8001));
    }

    #[test]
    fn host_port_defaults_when_missing() {
        assert_eq!(host_port("http://secretsvc"), ("secretsvc".to_string(), 80));
    }
}
