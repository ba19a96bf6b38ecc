//! The Job entity: the single source of truth for a submission's lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a [`Job`]. Monotone along `queued -> running -> {succeeded, failed}`
/// and `queued -> failed`; no transition out of a terminal state is ever allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("invalid job status '{other}'")),
        }
    }
}

/// The persisted job record. Owned by the database; created by Admission,
/// transitioned by Instancer, Result Service, and Reaper under CAS semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub user_id: String,
    pub model: String,
    pub file_name: String,
    pub secret_ref: Option<String>,
    pub result_token: Option<String>,
    pub result: Option<serde_json::Value>,
    pub result_error: Option<String>,
    pub result_received_at: Option<DateTime<Utc>>,
    pub public: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Wire payload published to the broker when a job is admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub job_id: Uuid,
    pub secret_ref: String,
    pub model: String,
    pub result_token: String,
}

impl JobMessage {
    pub fn new(job_id: Uuid, secret_ref: impl Into<String>, model: impl Into<String>, result_token: impl Into<String>) -> Self {
        Self {
            kind: "job.start".to_string(),
            job_id,
            secret_ref: secret_ref.into(),
            model: model.into(),
            result_token: result_token.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in ["queued", "running", "succeeded", "failed"] {
            let parsed: JobStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_succeeded_and_failed_are_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn job_message_has_job_start_type() {
        let msg = JobMessage::new(Uuid::nil(), "ref", "codex-gpt-5.2", "tok");
        assert_eq!(msg.kind, "job.start");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "job.start");
    }
}
