//! Kubernetes isolation backend. Grounded on `instancer/backends/k8s.py`:
//! each job gets its own Namespace (for blast-radius isolation), a single
//! `Job` object running the worker image, and a `NetworkPolicy` that denies
//! all egress except the public internet (minus private ranges), cluster
//! DNS, and the platform services (Secret Store, Model Proxy, Result
//! Service).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job as K8sJob;
use k8s_openapi::api::core::v1::{Container, EnvVar, Namespace, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};

use super::backend::{host_port, Result, SweptWorker, StartWorkerSpec, WorkerBackend, WorkerHandle, WorkerState};

const JOB_ID_LABEL: &str = "evmbench.io/job-id";
const WORKER_IMAGE: &str = "evmbench/worker:latest";
/// Namespace the platform services (Secret Store, Model Proxy, Result
/// Service) are deployed in. Fixed by deployment convention rather than
/// discovered, since the worker's egress policy must exist before the
/// worker's own pod does.
const PLATFORM_NAMESPACE: &str = "evmbench-platform";
const DNS_NAMESPACE: &str = "kube-system";
/// A namespace with no backing `Job` object past this age is presumed lost
/// rather than merely pending creation.
fn lost_grace() -> chrono::Duration {
    chrono::Duration::seconds(30)
}

fn namespace_name(job_id: uuid::Uuid) -> String {
    format!("evmbench-job-{job_id}")
}

pub struct K8sBackend {
    client: Client,
}

impl K8sBackend {
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    fn job_labels(job_id: uuid::Uuid) -> BTreeMap<String, String> {
        BTreeMap::from([(JOB_ID_LABEL.to_string(), job_id.to_string())])
    }

    async fn create_namespace(&self, job_id: uuid::Uuid) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace_name(job_id)),
                labels: Some(Self::job_labels(job_id)),
                ..Default::default()
            },
            ..Default::default()
        };
        namespaces.create(&PostParams::default(), &ns).await?;
        Ok(())
    }

    /// Egress rules allowing exactly: any pod in `PLATFORM_NAMESPACE`
    /// (Secret Store, Model Proxy, Result Service all live there), cluster
    /// DNS, and the public internet minus private ranges and the cloud
    /// metadata address. `policy_types: [Egress]` with no other rule means
    /// everything not matched here is denied.
    fn egress_rules() -> Vec<NetworkPolicyEgressRule> {
        let platform_ns = LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "kubernetes.io/metadata.name".to_string(),
                PLATFORM_NAMESPACE.to_string(),
            )])),
            ..Default::default()
        };
        let dns_ns = LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "kubernetes.io/metadata.name".to_string(),
                DNS_NAMESPACE.to_string(),
            )])),
            ..Default::default()
        };
        let dns_pod = LabelSelector {
            match_labels: Some(BTreeMap::from([("k8s-app".to_string(), "kube-dns".to_string())])),
            ..Default::default()
        };

        vec![
            NetworkPolicyEgressRule {
                to: Some(vec![NetworkPolicyPeer { namespace_selector: Some(platform_ns), ..Default::default() }]),
                ports: None,
            },
            NetworkPolicyEgressRule {
                to: Some(vec![NetworkPolicyPeer {
                    namespace_selector: Some(dns_ns),
                    pod_selector: Some(dns_pod),
                    ..Default::default()
                }]),
                ports: Some(vec![
                    NetworkPolicyPort { protocol: Some("UDP".to_string()), port: Some(IntOrString::Int(53)), ..Default::default() },
                    NetworkPolicyPort { protocol: Some("TCP".to_string()), port: Some(IntOrString::Int(53)), ..Default::default() },
                ]),
            },
            NetworkPolicyEgressRule {
                to: Some(vec![NetworkPolicyPeer {
                    ip_block: Some(IPBlock {
                        cidr: "0.0.0.0/0".to_string(),
                        except: Some(vec![
                            "10.0.0.0/8".to_string(),
                            "172.16.0.0/12".to_string(),
                            "192.168.0.0/16".to_string(),
                            "169.254.169.254/32".to_string(),
                        ]),
                    }),
                    ..Default::default()
                }]),
                ports: None,
            },
        ]
    }

    async fn create_network_policy(&self, job_id: uuid::Uuid) -> Result<()> {
        let ns_name = namespace_name(job_id);
        let policies: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), &ns_name);
        let policy = NetworkPolicy {
            metadata: ObjectMeta { name: Some("worker-egress".to_string()), ..Default::default() },
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector::default(),
                policy_types: Some(vec!["Egress".to_string()]),
                egress: Some(Self::egress_rules()),
                ..Default::default()
            }),
        };
        policies.create(&PostParams::default(), &policy).await?;
        Ok(())
    }

    async fn create_job(&self, spec: &StartWorkerSpec) -> Result<()> {
        let ns_name = namespace_name(spec.job_id);
        let jobs: Api<K8sJob> = Api::namespaced(self.client.clone(), &ns_name);

        let (secretsvc_host, secretsvc_port) = host_port(&spec.secret_store_url);
        let (resultsvc_host, resultsvc_port) = host_port(&spec.result_service_url);

        let env = vec![
            EnvVar { name: "JOB_ID".to_string(), value: Some(spec.job_id.to_string()), value_from: None },
            EnvVar { name: "AGENT_ID".to_string(), value: Some(spec.agent_id.clone()), value_from: None },
            EnvVar { name: "SECRETSVC_HOST".to_string(), value: Some(secretsvc_host), value_from: None },
            EnvVar { name: "SECRETSVC_PORT".to_string(), value: Some(secretsvc_port.to_string()), value_from: None },
            EnvVar { name: "SECRETSVC_REF".to_string(), value: Some(spec.secret_ref.clone()), value_from: None },
            EnvVar {
                name: "SECRETSVC_TOKEN".to_string(),
                value: Some(spec.secret_store_read_token.clone()),
                value_from: None,
            },
            EnvVar { name: "RESULTSVC_HOST".to_string(), value: Some(resultsvc_host), value_from: None },
            EnvVar { name: "RESULTSVC_PORT".to_string(), value: Some(resultsvc_port.to_string()), value_from: None },
            EnvVar {
                name: "RESULTSVC_JOB_TOKEN".to_string(),
                value: Some(spec.result_token.clone()),
                value_from: None,
            },
            EnvVar {
                name: "OAI_PROXY_BASE_URL".to_string(),
                value: Some(spec.model_proxy_url.clone()),
                value_from: None,
            },
        ];

        let mut limits = BTreeMap::new();
        limits.insert("memory".to_string(), Quantity("1Gi".to_string()));
        limits.insert("cpu".to_string(), Quantity("300m".to_string()));

        let job = K8sJob {
            metadata: ObjectMeta {
                name: Some("worker".to_string()),
                labels: Some(Self::job_labels(spec.job_id)),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::batch::v1::JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(Self::job_labels(spec.job_id)), ..Default::default() }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "worker".to_string(),
                            image: Some(WORKER_IMAGE.to_string()),
                            env: Some(env),
                            resources: Some(ResourceRequirements { limits: Some(limits), ..Default::default() }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        jobs.create(&PostParams::default(), &job).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerBackend for K8sBackend {
    async fn start_worker(&self, spec: &StartWorkerSpec) -> Result<WorkerHandle> {
        self.create_namespace(spec.job_id).await?;
        self.create_network_policy(spec.job_id).await?;
        self.create_job(spec).await?;
        Ok(WorkerHandle { job_id: spec.job_id, backend_id: namespace_name(spec.job_id), started_at: Utc::now() })
    }

    async fn running_workers(&self) -> Result<Vec<WorkerHandle>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let list = namespaces.list(&ListParams::default().labels(JOB_ID_LABEL)).await?;

        let mut handles = Vec::new();
        for ns in list {
            let Some(job_id) = ns
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(JOB_ID_LABEL))
                .and_then(|s| s.parse().ok())
            else {
                continue;
            };
            let started_at = ns
                .metadata
                .creation_timestamp
                .map(|t| t.0)
                .unwrap_or_else(Utc::now);
            handles.push(WorkerHandle {
                job_id,
                backend_id: ns.metadata.name.unwrap_or_default(),
                started_at,
            });
        }
        Ok(handles)
    }

    /// The cluster itself is the capacity boundary; the backend imposes no
    /// default cap of its own (§4.4).
    fn default_max_concurrency(&self) -> Option<usize> {
        None
    }

    /// Classifies by namespace age and by the backing Job's phase: a
    /// namespace with no Job past `lost_grace()` is lost, a failed Job is
    /// stopped (crashed), a succeeded Job is completed (cleanup only, not a
    /// job failure), one older than `max_age` with no completion is timed
    /// out, everything else is active.
    async fn sweep(&self, max_age: chrono::Duration) -> Result<Vec<SweptWorker>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let list = namespaces.list(&ListParams::default().labels(JOB_ID_LABEL)).await?;
        let now = Utc::now();
        let mut swept = Vec::new();

        for ns in list {
            let Some(job_id) = ns
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(JOB_ID_LABEL))
                .and_then(|s| s.parse().ok())
            else {
                continue;
            };
            let ns_name = ns.metadata.name.clone().unwrap_or_default();
            let started_at = ns.metadata.creation_timestamp.map(|t| t.0).unwrap_or(now);

            let jobs: Api<K8sJob> = Api::namespaced(self.client.clone(), &ns_name);
            let job = jobs.get_opt("worker").await?;

            let state = match job {
                None => {
                    if now - started_at > lost_grace() {
                        WorkerState::Lost
                    } else {
                        WorkerState::Active
                    }
                }
                Some(job) => {
                    let failed = job.status.as_ref().and_then(|s| s.failed).unwrap_or(0) > 0;
                    let succeeded = job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) > 0;
                    if failed {
                        WorkerState::Stopped
                    } else if succeeded {
                        WorkerState::Completed
                    } else if now - started_at > max_age {
                        WorkerState::TimedOut
                    } else {
                        WorkerState::Active
                    }
                }
            };

            if matches!(
                state,
                WorkerState::Stopped | WorkerState::TimedOut | WorkerState::Lost | WorkerState::Completed
            ) {
                let _ = namespaces.delete(&ns_name, &DeleteParams::default()).await;
            }

            swept.push(SweptWorker { job_id, backend_id: ns_name, state });
        }

        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_name_is_stable_per_job() {
        let id = uuid::Uuid::nil();
        assert_eq!(namespace_name(id), format!("evmbench-job-{id}"));
    }
}
