//! The worker sidecar's contract, kept in-tree (not deployed as one of this
//! crate's binaries) so integration tests can drive the rest of the system
//! against something that behaves like a real worker. Grounded on
//! `docker/worker/init.py`'s environment-variable contract and its
//! report-extraction/submission logic.

use serde::{Deserialize, Serialize};

/// Environment variables the instancer sets on every worker it provisions,
/// Docker and Kubernetes alike. Names match §6 of the worker contract exactly
/// (`SECRETSVC_*`, `RESULTSVC_*`) rather than the shorter aliases a from-
/// scratch design might reach for, since the sidecar image is built and
/// deployed independently of this crate and the names are the ABI.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerEnv {
    pub job_id: uuid::Uuid,
    pub agent_id: String,
    pub secretsvc_host: String,
    pub secretsvc_port: u16,
    pub secretsvc_ref: String,
    pub secretsvc_token: String,
    pub resultsvc_host: String,
    pub resultsvc_port: u16,
    pub resultsvc_job_token: String,
    pub oai_proxy_base_url: String,
}

impl WorkerEnv {
    /// Loads the contract from `std::env`, matching the exact variable names
    /// the instancer sets on the worker (mirroring `docker/worker/init.py`).
    pub fn from_env() -> Result<Self, String> {
        let var = |name: &str| std::env::var(name).map_err(|_| format!("missing env var {name}"));
        let port = |name: &str| -> Result<u16, String> { var(name)?.parse().map_err(|_| format!("invalid {name}")) };
        Ok(Self {
            job_id: var("JOB_ID")?.parse().map_err(|_| "invalid JOB_ID".to_string())?,
            agent_id: var("AGENT_ID")?,
            secretsvc_host: var("SECRETSVC_HOST")?,
            secretsvc_port: port("SECRETSVC_PORT")?,
            secretsvc_ref: var("SECRETSVC_REF")?,
            secretsvc_token: var("SECRETSVC_TOKEN")?,
            resultsvc_host: var("RESULTSVC_HOST")?,
            resultsvc_port: port("RESULTSVC_PORT")?,
            resultsvc_job_token: var("RESULTSVC_JOB_TOKEN")?,
            oai_proxy_base_url: var("OAI_PROXY_BASE_URL")?,
        })
    }

    fn secretsvc_base_url(&self) -> String {
        format!("http://{}:{}", self.secretsvc_host, self.secretsvc_port)
    }

    fn resultsvc_base_url(&self) -> String {
        format!("http://{}:{}", self.resultsvc_host, self.resultsvc_port)
    }
}

/// The body a worker posts back to Result Service once its run finishes.
#[derive(Debug, Serialize)]
pub struct WorkerReportSubmission {
    pub job_id: uuid::Uuid,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerReportSubmission {
    pub fn success(job_id: uuid::Uuid, report: impl Into<String>) -> Self {
        Self { job_id, status: "succeeded", report: Some(report.into()), error: None }
    }

    pub fn failure(job_id: uuid::Uuid, error: impl Into<String>) -> Self {
        Self { job_id, status: "failed", report: None, error: Some(error.into()) }
    }
}

/// Minimal client the worker sidecar uses to fetch its bundle, call the
/// model proxy, and report back — exercised by integration tests as a stand-in
/// for the real (separately-built) worker image.
pub struct WorkerClient {
    http: reqwest::Client,
    env: WorkerEnv,
}

impl WorkerClient {
    pub fn new(env: WorkerEnv) -> Self {
        Self { http: reqwest::Client::new(), env }
    }

    pub async fn fetch_bundle(&self) -> Result<bytes::Bytes, reqwest::Error> {
        let url = format!("{}/v1/bundles/{}", self.env.secretsvc_base_url(), self.env.secretsvc_ref);
        self.http
            .get(&url)
            .header("X-Secrets-Token", &self.env.secretsvc_token)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await
    }

    pub async fn submit_report(&self, submission: &WorkerReportSubmission) -> Result<(), reqwest::Error> {
        let url = format!("{}/v1/results", self.env.resultsvc_base_url());
        self.http
            .post(&url)
            .header("X-Results-Token", &self.env.resultsvc_job_token)
            .json(submission)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_submission_has_no_error() {
        let s = WorkerReportSubmission::success(uuid::Uuid::nil(), "{}");
        assert_eq!(s.status, "succeeded");
        assert!(s.report.is_some());
        assert!(s.error.is_none());
    }

    #[test]
    fn failure_submission_has_no_report() {
        let s = WorkerReportSubmission::failure(uuid::Uuid::nil(), "boom");
        assert_eq!(s.status, "failed");
        assert!(s.report.is_none());
        assert_eq!(s.error.unwrap(), "boom");
    }
}
