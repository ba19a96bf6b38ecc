//! Docker isolation backend. Grounded on `instancer/backends/docker.py`:
//! one container per job, labeled so a later sweep (by this process or the
//! reaper) can find it again without a side database.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{Config, ListContainersOptions, RemoveContainerOptions, StartContainerOptions};
use bollard::models::{HostConfig, ResourcesUlimits, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use chrono::Utc;

use super::backend::{host_port, BackendError, Result, SweptWorker, StartWorkerSpec, WorkerBackend, WorkerHandle, WorkerState};

const JOB_LABEL: &str = "evmbench.job_id";
const MANAGED_LABEL: &str = "evmbench.managed";

const WORKER_IMAGE: &str = "evmbench/worker:latest";
const MEMORY_LIMIT_BYTES: i64 = 1024 * 1024 * 1024;
const NANO_CPUS: i64 = 300_000_000;
const PIDS_LIMIT: i64 = 1024;
const ULIMIT_NOFILE: i64 = 131072;

pub struct DockerBackend {
    client: Docker,
    default_max_concurrency: usize,
}

impl DockerBackend {
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()?;
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Ok(Self { client, default_max_concurrency: cpus * 3 })
    }

    fn container_name(job_id: uuid::Uuid) -> String {
        format!("evmbench-worker-{job_id}")
    }
}

#[async_trait]
impl WorkerBackend for DockerBackend {
    async fn start_worker(&self, spec: &StartWorkerSpec) -> Result<WorkerHandle> {
        let (secretsvc_host, secretsvc_port) = host_port(&spec.secret_store_url);
        let (resultsvc_host, resultsvc_port) = host_port(&spec.result_service_url);
        let env = vec![
            format!("JOB_ID={}", spec.job_id),
            format!("AGENT_ID={}", spec.agent_id),
            format!("SECRETSVC_HOST={secretsvc_host}"),
            format!("SECRETSVC_PORT={secretsvc_port}"),
            format!("SECRETSVC_REF={}", spec.secret_ref),
            format!("SECRETSVC_TOKEN={}", spec.secret_store_read_token),
            format!("RESULTSVC_HOST={resultsvc_host}"),
            format!("RESULTSVC_PORT={resultsvc_port}"),
            format!("RESULTSVC_JOB_TOKEN={}", spec.result_token),
            format!("OAI_PROXY_BASE_URL={}", spec.model_proxy_url),
        ];

        let mut labels = HashMap::new();
        labels.insert(JOB_LABEL.to_string(), spec.job_id.to_string());
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let config = Config {
            image: Some(WORKER_IMAGE.to_string()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(HostConfig {
                memory: Some(MEMORY_LIMIT_BYTES),
                nano_cpus: Some(NANO_CPUS),
                pids_limit: Some(PIDS_LIMIT),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ulimits: Some(vec![ResourcesUlimits {
                    name: Some("nofile".to_string()),
                    soft: Some(ULIMIT_NOFILE),
                    hard: Some(ULIMIT_NOFILE),
                }]),
                network_mode: Some("evmbench-workers".to_string()),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::NO),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let name = Self::container_name(spec.job_id);
        let created = self
            .client
            .create_container(Some(bollard::container::CreateContainerOptions { name: name.clone(), platform: None }), config)
            .await?;

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;

        Ok(WorkerHandle { job_id: spec.job_id, backend_id: created.id, started_at: Utc::now() })
    }

    async fn running_workers(&self) -> Result<Vec<WorkerHandle>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);
        filters.insert("status".to_string(), vec!["running".to_string()]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions { all: false, filters, ..Default::default() }))
            .await?;

        let mut handles = Vec::new();
        for c in containers {
            let Some(job_id) = c.labels.as_ref().and_then(|l| l.get(JOB_LABEL)).and_then(|s| s.parse().ok()) else {
                continue;
            };
            let started_at = c
                .created
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .unwrap_or_else(Utc::now);
            handles.push(WorkerHandle { job_id, backend_id: c.id.unwrap_or_default(), started_at });
        }
        Ok(handles)
    }

    /// `cpu_count * 3`, computed once at connect time.
    fn default_max_concurrency(&self) -> Option<usize> {
        Some(self.default_max_concurrency)
    }

    async fn sweep(&self, max_age: chrono::Duration) -> Result<Vec<SweptWorker>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions { all: true, filters, ..Default::default() }))
            .await?;

        let now = Utc::now();
        let mut swept = Vec::new();

        for c in containers {
            let Some(job_id) = c.labels.as_ref().and_then(|l| l.get(JOB_LABEL)).and_then(|s| s.parse().ok()) else {
                continue;
            };
            let id = c.id.clone().unwrap_or_default();
            let status = c.state.clone().unwrap_or_default();

            let state = if matches!(status.as_str(), "exited" | "dead" | "created") {
                WorkerState::Stopped
            } else {
                let started_at = c
                    .created
                    .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                    .unwrap_or(now);
                if now - started_at > max_age {
                    WorkerState::TimedOut
                } else {
                    WorkerState::Active
                }
            };

            if matches!(state, WorkerState::Stopped | WorkerState::TimedOut) {
                let _ = self
                    .client
                    .remove_container(&id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                    .await;
            }

            swept.push(SweptWorker { job_id, backend_id: id, state });
        }

        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_stable_per_job() {
        let id = uuid::Uuid::nil();
        assert_eq!(DockerBackend::container_name(id), format!("evmbench-worker-{id}"));
    }
}
