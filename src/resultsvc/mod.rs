//! Result Service (R): the sole writer of terminal job outcomes. Grounded on
//! `orchestrator::auth`'s constant-time token check and `sandbox::error`'s
//! thiserror-enum shape; report parsing/severity normalization ported from
//! the worker sidecar's report-extraction contract (`docker/worker/init.py`).

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::tokens_equal;
use crate::db::Database;
use crate::job::JobStatus;

#[derive(Debug, Error)]
pub enum ResultError {
    /// Also covers a job that exists but is not `running` — from the
    /// caller's perspective there is no live job to report against, so both
    /// cases surface identically as "not found".
    #[error("job not found")]
    NotFound,
    #[error("invalid result token")]
    Unauthorized,
    #[error(transparent)]
    Database(#[from] crate::error::DatabaseError),
}

impl IntoResponse for ResultError {
    fn into_response(self) -> Response {
        let status = match self {
            ResultError::NotFound => StatusCode::NOT_FOUND,
            ResultError::Unauthorized => StatusCode::UNAUTHORIZED,
            ResultError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        status.into_response()
    }
}

/// Body posted by the worker sidecar to `POST /v1/results`.
#[derive(Debug, Deserialize)]
pub struct ReportSubmission {
    pub job_id: Uuid,
    pub status: String,
    /// Free-form text; the actual JSON report is extracted from the first
    /// `{` to the last `}` within it, tolerant of surrounding prose.
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

/// Normalizes a free-text severity via case-insensitive longest-prefix match
/// against the canonical names, defaulting to `info` for anything that
/// doesn't match — a worker-supplied report should never fail this step.
fn normalize_severity(raw: &str) -> Severity {
    let lower = raw.to_ascii_lowercase();
    const ORDER: &[(&str, Severity)] = &[
        ("critical", Severity::Critical),
        ("crit", Severity::Critical),
        ("high", Severity::High),
        ("hi", Severity::High),
        ("medium", Severity::Medium),
        ("med", Severity::Medium),
        ("low", Severity::Low),
        ("lo", Severity::Low),
        ("info", Severity::Info),
        ("inf", Severity::Info),
    ];
    ORDER
        .iter()
        .filter(|(prefix, _)| lower.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, sev)| *sev)
        .unwrap_or(Severity::Info)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FindingLocation {
    pub file: String,
    pub line_start: u64,
    pub line_end: u64,
    pub desc: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Vulnerability {
    pub title: String,
    pub severity: Severity,
    #[serde(default)]
    pub summary: Option<String>,
    pub description: Vec<FindingLocation>,
    pub impact: String,
    #[serde(default)]
    pub proof_of_concept: Option<String>,
    #[serde(default)]
    pub remediation: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Report {
    pub vulnerabilities: Vec<Vulnerability>,
}

#[derive(Debug, Deserialize)]
struct RawVulnerability {
    title: String,
    severity: String,
    #[serde(default)]
    summary: Option<String>,
    description: Vec<FindingLocation>,
    impact: String,
    #[serde(default)]
    proof_of_concept: Option<String>,
    #[serde(default)]
    remediation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReport {
    vulnerabilities: Vec<RawVulnerability>,
}

/// Extracts the substring from the first `{` to the last `}` (inclusive),
/// parses it as JSON, and validates the vulnerability schema. A report that
/// fails any of these steps is never "partially" accepted.
pub fn parse_report(raw_output: &str) -> Option<Report> {
    let start = raw_output.find('{')?;
    let end = raw_output.rfind('}')?;
    if end < start {
        return None;
    }
    let slice = &raw_output[start..=end];
    let raw: RawReport = serde_json::from_str(slice).ok()?;

    let mut vulnerabilities = Vec::with_capacity(raw.vulnerabilities.len());
    for v in raw.vulnerabilities {
        if v.title.trim().is_empty() || v.impact.trim().is_empty() {
            return None;
        }
        vulnerabilities.push(Vulnerability {
            title: v.title,
            severity: normalize_severity(&v.severity),
            summary: v.summary,
            description: v.description,
            impact: v.impact,
            proof_of_concept: v.proof_of_concept,
            remediation: v.remediation,
        });
    }
    Some(Report { vulnerabilities })
}

#[derive(Clone)]
pub struct ResultSvcState {
    pub db: Arc<dyn Database>,
}

fn results_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("X-Results-Token")?.to_str().ok()
}

/// Decides the actual terminal outcome from a submission. The worker's
/// declared `status` is advisory: a `report` that parses and validates always
/// wins, and anything else downgrades to `failed`, using `error` when present
/// and `"Invalid report"` only when neither yields a usable schema — keeping
/// the permissive contract the worker side already relies on.
fn resolve_outcome(submission: &ReportSubmission) -> (JobStatus, Option<serde_json::Value>, Option<String>) {
    if let Some(raw) = &submission.report {
        if let Some(report) = parse_report(raw) {
            return (
                JobStatus::Succeeded,
                Some(serde_json::to_value(&report).expect("Report always serializes")),
                None,
            );
        }
    }
    let reason = submission.error.clone().unwrap_or_else(|| "Invalid report".to_string());
    (JobStatus::Failed, None, Some(reason))
}

async fn submit_result(
    State(state): State<ResultSvcState>,
    headers: HeaderMap,
    Json(submission): Json<ReportSubmission>,
) -> Result<StatusCode, ResultError> {
    let job = state.db.get_job(submission.job_id).await?.ok_or(ResultError::NotFound)?;
    if job.status != JobStatus::Running {
        return Err(ResultError::NotFound);
    }

    let expected = job.result_token.as_deref().unwrap_or("");
    let provided = results_token(&headers).unwrap_or("");
    if !tokens_equal(expected, provided) {
        return Err(ResultError::Unauthorized);
    }

    let now = Utc::now();
    let (status, result, result_error) = resolve_outcome(&submission);
    state.db.finalize_job(submission.job_id, status, result, result_error, now).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router(state: ResultSvcState) -> Router {
    Router::new().route("/v1/results", post(submit_result)).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_prefix_matching_is_case_insensitive() {
        assert_eq!(normalize_severity("Critical"), Severity::Critical);
        assert_eq!(normalize_severity("HIGH"), Severity::High);
        assert_eq!(normalize_severity("med"), Severity::Medium);
        assert_eq!(normalize_severity("lo-risk"), Severity::Low);
        assert_eq!(normalize_severity("unknown"), Severity::Info);
    }

    #[test]
    fn longest_prefix_wins_over_shorter_alias() {
        // "hi" and "high" both prefix-match "high severity"; longest wins.
        assert_eq!(normalize_severity("high severity"), Severity::High);
    }

    #[test]
    fn extracts_json_from_surrounding_prose() {
        let raw = r#"Scan complete. Findings:
        {"vulnerabilities": [{"title": "Reentrancy", "severity": "high",
        "description": [{"file": "A.sol", "line_start": 10, "line_end": 20, "desc": "x"}],
        "impact": "drain"}]}
        Done."#;
        let report = parse_report(raw).unwrap();
        assert_eq!(report.vulnerabilities.len(), 1);
        assert_eq!(report.vulnerabilities[0].severity, Severity::High);
    }

    #[test]
    fn missing_title_invalidates_whole_report() {
        let raw = r#"{"vulnerabilities": [{"title": "", "severity": "low",
        "description": [], "impact": "none"}]}"#;
        assert!(parse_report(raw).is_none());
    }

    #[test]
    fn garbage_output_has_no_report() {
        assert!(parse_report("no braces here").is_none());
        assert!(parse_report("{unbalanced").is_none());
    }

    #[test]
    fn valid_report_succeeds_even_if_status_field_says_failed() {
        let submission = ReportSubmission {
            job_id: Uuid::nil(),
            status: "failed".to_string(),
            report: Some(
                r#"{"vulnerabilities": [{"title": "t", "severity": "low", "description": [], "impact": "i"}]}"#
                    .to_string(),
            ),
            error: None,
        };
        let (status, result, error) = resolve_outcome(&submission);
        assert_eq!(status, JobStatus::Succeeded);
        assert!(result.is_some());
        assert!(error.is_none());
    }

    #[test]
    fn invalid_report_falls_back_to_supplied_error_reason() {
        let submission = ReportSubmission {
            job_id: Uuid::nil(),
            status: "succeeded".to_string(),
            report: Some("not-json".to_string()),
            error: Some("agent crashed".to_string()),
        };
        let (status, _, error) = resolve_outcome(&submission);
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(error.unwrap(), "agent crashed");
    }

    #[test]
    fn no_report_and_no_error_downgrades_to_invalid_report() {
        let submission = ReportSubmission { job_id: Uuid::nil(), status: "succeeded".to_string(), report: None, error: None };
        let (status, _, error) = resolve_outcome(&submission);
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(error.unwrap(), "Invalid report");
    }
}
