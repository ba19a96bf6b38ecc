//! Admission (A): the only service end users talk to directly. Validates
//! the upload, resolves a model credential, stages a bundle in the Secret
//! Store, commits the job row, and publishes the work item — compensating
//! (deleting the bundle and the row) if the publish is not confirmed.
//!
//! Grounded on `orchestrator::api`'s axum-router-plus-multipart shape and
//! `orchestrator::auth`'s bearer extraction, generalized from a single
//! session token to a pluggable [`AuthBackend`].

pub mod bundle;
pub mod zip_validate;

use std::sync::Arc;

use axum::extract::{Multipart, Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::generate_hex_token;
use crate::broker::{BrokerError, Publisher};
use crate::config::is_model_allowed;
use crate::crypto::encrypt_token;
use crate::db::Database;
use crate::job::{Job, JobMessage};

use bundle::{build_bundle, KeyJson, KeyMode};
use zip_validate::{validate as validate_zip, ZipValidationPolicy};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("you already have an active job")]
    ActiveJobExists,
    #[error("model '{0}' is not allowed")]
    ModelNotAllowed(String),
    #[error("no credential available for this job")]
    NoCredentialAvailable,
    #[error("upstream key did not pass the liveness check")]
    KeyNotLive,
    #[error("invalid upload: {0}")]
    InvalidUpload(#[from] zip_validate::ZipValidationError),
    #[error("malformed multipart body: {0}")]
    BadMultipart(String),
    #[error("job not found")]
    NotFound,
    #[error(transparent)]
    Database(#[from] crate::error::DatabaseError),
    #[error("secret store rejected the bundle: {0}")]
    SecretStore(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdmissionError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdmissionError::ModelNotAllowed(_) => StatusCode::UNAUTHORIZED,
            AdmissionError::ActiveJobExists => StatusCode::CONFLICT,
            AdmissionError::NoCredentialAvailable | AdmissionError::KeyNotLive => StatusCode::PRECONDITION_FAILED,
            AdmissionError::InvalidUpload(_) => StatusCode::PRECONDITION_FAILED,
            AdmissionError::BadMultipart(_) => StatusCode::BAD_REQUEST,
            AdmissionError::NotFound => StatusCode::NOT_FOUND,
            AdmissionError::Database(_) | AdmissionError::SecretStore(_) | AdmissionError::Broker(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// Authenticates an inbound request and returns the caller's user id.
/// Left pluggable because session/identity handling is deployment-specific
/// and outside this spec's scope; the reference wiring simply trusts an
/// `X-User-Id` header, matching `orchestrator::auth`'s trust-the-caller test
/// double used in its own router tests.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AdmissionError>;
}

pub struct HeaderAuthBackend;

#[async_trait]
impl AuthBackend for HeaderAuthBackend {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AdmissionError> {
        headers
            .get("X-User-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(AdmissionError::Unauthorized)
    }
}

#[derive(Clone)]
pub struct AdmissionSettings {
    pub secret_store_base_url: String,
    pub secret_store_write_token: Arc<str>,
    pub aes_key: Option<[u8; 32]>,
    pub backend_static_key: Option<String>,
    pub backend_use_proxy_static_key: bool,
    pub proxy_static_key_configured: bool,
    pub model_proxy_base_url: String,
}

#[derive(Clone)]
pub struct AdmissionState {
    pub db: Arc<dyn Database>,
    pub publisher: Arc<Publisher>,
    pub auth: Arc<dyn AuthBackend>,
    pub http: reqwest::Client,
    pub settings: Arc<AdmissionSettings>,
    pub zip_policy: Arc<ZipValidationPolicy>,
}

/// Resolves the upstream credential per the priority order: a configured
/// backend static-proxy key wins outright (the worker only ever sees the
/// `STATIC` marker), then a plain backend-static key (`key_mode=direct`),
/// then the user's own key (encrypted if the proxy's AES key is configured,
/// plaintext otherwise); absent all three, admission is refused.
fn resolve_credential(
    user_supplied_key: Option<&str>,
    provider: &str,
    settings: &AdmissionSettings,
) -> Result<KeyJson, AdmissionError> {
    if settings.backend_use_proxy_static_key && settings.proxy_static_key_configured {
        return Ok(KeyJson {
            openai_token: "STATIC".to_string(),
            key_mode: KeyMode::ProxyStatic,
            provider: provider.to_string(),
        });
    }
    if let Some(key) = &settings.backend_static_key {
        return Ok(KeyJson { openai_token: key.clone(), key_mode: KeyMode::Direct, provider: provider.to_string() });
    }
    if let Some(key) = user_supplied_key {
        return Ok(match settings.aes_key {
            Some(aes_key) => KeyJson {
                openai_token: encrypt_token(key, &aes_key),
                key_mode: KeyMode::Proxy,
                provider: provider.to_string(),
            },
            None => KeyJson { openai_token: key.to_string(), key_mode: KeyMode::Direct, provider: provider.to_string() },
        });
    }
    Err(AdmissionError::NoCredentialAvailable)
}

/// Skips the liveness probe in `proxy_static` mode (the worker never sees a
/// real key to validate) and in backend-static-direct mode (the operator's
/// own key is trusted without a round trip on every submission).
fn needs_liveness_probe(key: &KeyJson, settings: &AdmissionSettings) -> bool {
    !matches!(key.key_mode, KeyMode::ProxyStatic)
        && !(matches!(key.key_mode, KeyMode::Direct) && settings.backend_static_key.is_some())
}

async fn probe_key_liveness(http: &reqwest::Client, key: &str, provider: &str) -> bool {
    let url = match provider {
        "openrouter" => "https://openrouter.ai/api/v1/models",
        _ => "https://api.openai.com/v1/models",
    };
    match http.get(url).bearer_auth(key).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

struct ParsedUpload {
    model: String,
    provider: String,
    openai_key: Option<String>,
    file_name: String,
    zip_bytes: Vec<u8>,
}

async fn parse_multipart(mut multipart: Multipart) -> Result<ParsedUpload, AdmissionError> {
    let mut model = None;
    let mut provider = "openai".to_string();
    let mut openai_key = None;
    let mut file_name = None;
    let mut zip_bytes = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| AdmissionError::BadMultipart(e.to_string()))? {
        match field.name().unwrap_or_default() {
            "model" => model = Some(field.text().await.map_err(|e| AdmissionError::BadMultipart(e.to_string()))?),
            "provider" => provider = field.text().await.map_err(|e| AdmissionError::BadMultipart(e.to_string()))?,
            "openai_key" => {
                openai_key = Some(field.text().await.map_err(|e| AdmissionError::BadMultipart(e.to_string()))?)
            }
            "file" => {
                file_name = Some(field.file_name().unwrap_or("upload.zip").chars().take(128).collect());
                zip_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AdmissionError::BadMultipart(e.to_string()))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    Ok(ParsedUpload {
        model: model.ok_or_else(|| AdmissionError::BadMultipart("missing 'model' field".to_string()))?,
        provider,
        openai_key,
        file_name: file_name.ok_or_else(|| AdmissionError::BadMultipart("missing 'file' field".to_string()))?,
        zip_bytes: zip_bytes.ok_or_else(|| AdmissionError::BadMultipart("missing 'file' field".to_string()))?,
    })
}

#[derive(Debug, Serialize)]
pub struct StartJobResponse {
    pub job_id: Uuid,
}

async fn start_job(
    State(state): State<AdmissionState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<StartJobResponse>, AdmissionError> {
    let user_id = state.auth.authenticate(&headers).await?;

    if state.db.has_active_job(&user_id).await? {
        return Err(AdmissionError::ActiveJobExists);
    }

    let upload = parse_multipart(multipart).await?;

    let provider_filter = (upload.provider == "openrouter").then_some("openrouter");
    if !is_model_allowed(&upload.model, provider_filter) {
        return Err(AdmissionError::ModelNotAllowed(upload.model));
    }

    validate_zip(&upload.zip_bytes, &state.zip_policy)?;

    let key = resolve_credential(upload.openai_key.as_deref(), &upload.provider, &state.settings)?;
    if needs_liveness_probe(&key, &state.settings) {
        let raw_key = upload.openai_key.as_deref().unwrap_or(&key.openai_token);
        if !probe_key_liveness(&state.http, raw_key, &upload.provider).await {
            return Err(AdmissionError::KeyNotLive);
        }
    }

    let job_id = Uuid::new_v4();
    let secret_ref = generate_hex_token();
    let result_token = generate_hex_token();

    let bundle = build_bundle(&upload.zip_bytes, &key).map_err(|e| AdmissionError::SecretStore(e.to_string()))?;

    let put_url = format!("{}/v1/bundles/{secret_ref}", state.settings.secret_store_base_url);
    state
        .http
        .put(&put_url)
        .header("X-Secrets-Token", state.settings.secret_store_write_token.as_ref())
        .body(bundle)
        .send()
        .await
        .map_err(|e| AdmissionError::SecretStore(e.to_string()))?
        .error_for_status()
        .map_err(|e| AdmissionError::SecretStore(e.to_string()))?;

    let job = state
        .db
        .insert_queued_job(job_id, &user_id, &upload.model, &upload.file_name, &secret_ref, &result_token)
        .await?;

    let message = JobMessage::new(job.id, secret_ref.clone(), upload.model.clone(), result_token);
    if let Err(err) = state.publisher.publish(&message).await {
        // compensate: unwind the bundle and the row rather than leave an
        // orphaned job the instancer will never pick up.
        let delete_url = format!("{}/v1/bundles/{secret_ref}", state.settings.secret_store_base_url);
        let _ = state
            .http
            .delete(&delete_url)
            .header("X-Secrets-Token", state.settings.secret_store_write_token.as_ref())
            .send()
            .await;
        let _ = state.db.delete_job(job.id).await;
        return Err(AdmissionError::Broker(err));
    }

    Ok(Json(StartJobResponse { job_id: job.id }))
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub status: String,
    pub model: String,
    pub file_name: String,
    pub queue_position: Option<i64>,
    pub result: Option<serde_json::Value>,
    pub result_error: Option<String>,
}

async fn job_to_view(state: &AdmissionState, job: Job) -> Result<JobView, AdmissionError> {
    let queue_position = state.db.queue_position(job.id).await?;
    Ok(JobView {
        id: job.id,
        status: job.status.as_str().to_string(),
        model: job.model,
        file_name: job.file_name,
        queue_position,
        result: job.result,
        result_error: job.result_error,
    })
}

async fn get_job(
    State(state): State<AdmissionState>,
    headers: HeaderMap,
    AxumPath(job_id): AxumPath<Uuid>,
) -> Result<Json<JobView>, AdmissionError> {
    let job = state.db.get_job(job_id).await?.ok_or(AdmissionError::NotFound)?;
    if !job.public {
        let user_id = state.auth.authenticate(&headers).await?;
        if user_id != job.user_id {
            return Err(AdmissionError::NotFound);
        }
    }
    Ok(Json(job_to_view(&state, job).await?))
}

#[derive(Debug, Deserialize)]
pub struct PatchJobRequest {
    pub public: bool,
}

async fn patch_job(
    State(state): State<AdmissionState>,
    headers: HeaderMap,
    AxumPath(job_id): AxumPath<Uuid>,
    Json(patch): Json<PatchJobRequest>,
) -> Result<StatusCode, AdmissionError> {
    let user_id = state.auth.authenticate(&headers).await?;
    let applied = state.db.set_public(job_id, &user_id, patch.public).await?;
    if !applied {
        return Err(AdmissionError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_history(State(state): State<AdmissionState>, headers: HeaderMap) -> Result<Json<Vec<JobView>>, AdmissionError> {
    let user_id = state.auth.authenticate(&headers).await?;
    let jobs = state.db.list_history(&user_id, 100).await?;
    let mut views = Vec::with_capacity(jobs.len());
    for job in jobs {
        views.push(job_to_view(&state, job).await?);
    }
    Ok(Json(views))
}

pub fn router(state: AdmissionState) -> Router {
    Router::new()
        .route("/v1/jobs/start", post(start_job))
        .route("/v1/jobs/history", get(list_history))
        .route("/v1/jobs/{id}", get(get_job).patch(patch_job))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(aes_key: Option<[u8; 32]>, backend_static_key: Option<&str>, use_proxy_static: bool) -> AdmissionSettings {
        AdmissionSettings {
            secret_store_base_url: "http://localhost:9001".to_string(),
            secret_store_write_token: Arc::from("wo"),
            aes_key,
            backend_static_key: backend_static_key.map(str::to_string),
            backend_use_proxy_static_key: use_proxy_static,
            proxy_static_key_configured: use_proxy_static,
            model_proxy_base_url: "http://localhost:9002".to_string(),
        }
    }

    #[test]
    fn proxy_static_wins_over_everything_else() {
        let s = settings(None, Some("operator-key"), true);
        let key = resolve_credential(Some("user-key"), "openai", &s).unwrap();
        assert_eq!(key.key_mode, KeyMode::ProxyStatic);
        assert_eq!(key.openai_token, "STATIC");
    }

    #[test]
    fn backend_static_key_wins_over_user_key() {
        let s = settings(None, Some("operator-key"), false);
        let key = resolve_credential(Some("user-key"), "openai", &s).unwrap();
        assert_eq!(key.key_mode, KeyMode::Direct);
        assert_eq!(key.openai_token, "operator-key");
    }

    #[test]
    fn user_key_is_encrypted_when_aes_key_configured() {
        let aes_key = crate::crypto::derive_key("shared");
        let s = settings(Some(aes_key), None, false);
        let key = resolve_credential(Some("sk-user"), "openai", &s).unwrap();
        assert_eq!(key.key_mode, KeyMode::Proxy);
        assert_eq!(crate::crypto::decrypt_token(&key.openai_token, &aes_key).unwrap(), "sk-user");
    }

    #[test]
    fn user_key_is_plaintext_without_aes_key() {
        let s = settings(None, None, false);
        let key = resolve_credential(Some("sk-user"), "openai", &s).unwrap();
        assert_eq!(key.key_mode, KeyMode::Direct);
        assert_eq!(key.openai_token, "sk-user");
    }

    #[test]
    fn no_credential_available_is_refused() {
        let s = settings(None, None, false);
        assert!(matches!(resolve_credential(None, "openai", &s), Err(AdmissionError::NoCredentialAvailable)));
    }

    #[test]
    fn liveness_probe_skipped_for_proxy_static_and_backend_direct() {
        let proxy_static = KeyJson { openai_token: "STATIC".into(), key_mode: KeyMode::ProxyStatic, provider: "openai".into() };
        let s = settings(None, Some("k"), true);
        assert!(!needs_liveness_probe(&proxy_static, &s));

        let backend_direct = KeyJson { openai_token: "k".into(), key_mode: KeyMode::Direct, provider: "openai".into() };
        let s2 = settings(None, Some("k"), false);
        assert!(!needs_liveness_probe(&backend_direct, &s2));

        let user_proxy = KeyJson { openai_token: "enc".into(), key_mode: KeyMode::Proxy, provider: "openai".into() };
        let s3 = settings(Some(crate::crypto::derive_key("x")), None, false);
        assert!(needs_liveness_probe(&user_proxy, &s3));
    }
}
