//! Secret Store (S): one-shot storage of opaque per-job bundles. Grounded on
//! `sandbox::error`'s thiserror-enum shape and `orchestrator::auth`'s
//! constant-time token comparison, generalized to a read-only/write-only
//! capability pair instead of one per-job token.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, put};
use axum::Router;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::auth::tokens_equal;

const REF_MAX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("invalid ref")]
    InvalidRef,
    #[error("bundle not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SecretStoreError>;

fn is_valid_ref(reference: &str) -> bool {
    !reference.is_empty()
        && reference.len() <= REF_MAX_LEN
        && reference.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Filesystem-backed one-shot bundle store. Bundles live at
/// `<ref>.tar`, hit counters at `<ref>.hits`, both written via
/// tmp-file + fsync + atomic rename, mode 0600.
pub struct SecretStore {
    dir: PathBuf,
    max_reads: u32,
}

impl SecretStore {
    pub fn new(dir: PathBuf, max_reads: u32) -> Self {
        Self { dir, max_reads }
    }

    fn bundle_path(&self, reference: &str) -> PathBuf {
        self.dir.join(format!("{reference}.tar"))
    }

    fn hits_path(&self, reference: &str) -> PathBuf {
        self.dir.join(format!("{reference}.hits"))
    }

    async fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = target.with_extension(format!("tmp.{}", std::process::id()));
        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        fs::rename(&tmp, target).await?;
        Ok(())
    }

    pub async fn put(&self, reference: &str, bytes: Bytes) -> Result<()> {
        if !is_valid_ref(reference) {
            return Err(SecretStoreError::InvalidRef);
        }
        fs::create_dir_all(&self.dir).await?;
        self.write_atomic(&self.bundle_path(reference), &bytes).await
    }

    /// Reads the bundle, incrementing the hit counter before returning bytes
    /// so a concurrent reader observes at least this read. Schedules
    /// deletion once the counter reaches `max_reads`; the caller runs the
    /// returned future after streaming the response body.
    pub async fn get(&self, reference: &str) -> Result<(Bytes, Option<impl std::future::Future<Output = ()> + use<>>)> {
        if !is_valid_ref(reference) {
            return Err(SecretStoreError::InvalidRef);
        }
        let bundle_path = self.bundle_path(reference);
        let bytes = match fs::read(&bundle_path).await {
            Ok(b) => Bytes::from(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(SecretStoreError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let hits_path = self.hits_path(reference);
        let current: u32 = match fs::read_to_string(&hits_path).await {
            Ok(s) => s.trim().parse().unwrap_or(0),
            Err(_) => 0,
        };
        let updated = current + 1;
        self.write_atomic(&hits_path, updated.to_string().as_bytes()).await?;

        let cleanup = if updated >= self.max_reads {
            let bundle_path = bundle_path.clone();
            let hits_path = hits_path.clone();
            Some(async move {
                let _ = fs::remove_file(&bundle_path).await;
                let _ = fs::remove_file(&hits_path).await;
            })
        } else {
            None
        };

        Ok((bytes, cleanup))
    }

    /// Idempotent: deleting an absent ref still succeeds, matching the
    /// compensation path's requirement to never itself fail loudly.
    pub async fn delete(&self, reference: &str) -> Result<()> {
        if !is_valid_ref(reference) {
            return Err(SecretStoreError::InvalidRef);
        }
        let _ = fs::remove_file(self.bundle_path(reference)).await;
        let _ = fs::remove_file(self.hits_path(reference)).await;
        Ok(())
    }
}

#[derive(Clone)]
pub struct SecretSvcState {
    pub store: Arc<SecretStore>,
    pub token_ro: Arc<str>,
    pub token_wo: Arc<str>,
}

fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("X-Secrets-Token").and_then(|v| v.to_str().ok())
}

async fn put_bundle(
    State(state): State<SecretSvcState>,
    AxumPath(reference): AxumPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(token) = extract_token(&headers) else {
        return StatusCode::UNAUTHORIZED;
    };
    if !tokens_equal(&state.token_wo, token) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.store.put(&reference, body).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(SecretStoreError::InvalidRef) => StatusCode::BAD_REQUEST,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn get_bundle(
    State(state): State<SecretSvcState>,
    AxumPath(reference): AxumPath<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    use axum::response::IntoResponse;

    let Some(token) = extract_token(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !tokens_equal(&state.token_ro, token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.store.get(&reference).await {
        Ok((bytes, cleanup)) => {
            if let Some(cleanup) = cleanup {
                tokio::spawn(cleanup);
            }
            ([("content-type", "application/x-tar")], bytes).into_response()
        }
        Err(SecretStoreError::InvalidRef) => StatusCode::BAD_REQUEST.into_response(),
        Err(SecretStoreError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn delete_bundle(
    State(state): State<SecretSvcState>,
    AxumPath(reference): AxumPath<String>,
    headers: HeaderMap,
) -> StatusCode {
    let Some(token) = extract_token(&headers) else {
        return StatusCode::UNAUTHORIZED;
    };
    if !tokens_equal(&state.token_wo, token) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.store.delete(&reference).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(SecretStoreError::InvalidRef) => StatusCode::BAD_REQUEST,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn router(state: SecretSvcState) -> Router {
    Router::new()
        .route("/v1/bundles/{ref}", put(put_bundle).get(get_bundle).delete(delete_bundle))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(dir: &Path) -> SecretSvcState {
        SecretSvcState {
            store: Arc::new(SecretStore::new(dir.to_path_buf(), 1)),
            token_ro: Arc::from("ro-token"),
            token_wo: Arc::from("wo-token"),
        }
    }

    #[test]
    fn ref_pattern_rejects_uppercase_and_overlong() {
        assert!(is_valid_ref("deadbeef"));
        assert!(!is_valid_ref("DEADBEEF"));
        assert!(!is_valid_ref(""));
        assert!(!is_valid_ref(&"a".repeat(65)));
    }

    #[tokio::test]
    async fn put_requires_write_token() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/v1/bundles/deadbeef")
                    .header("X-Secrets-Token", "wrong")
                    .body(Body::from("data"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn single_read_then_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = router(state.clone());

        let put_resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/v1/bundles/deadbeef")
                    .header("X-Secrets-Token", "wo-token")
                    .body(Body::from("bundle-bytes"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(put_resp.status(), StatusCode::NO_CONTENT);

        let get_resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/bundles/deadbeef")
                    .header("X-Secrets-Token", "ro-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(get_resp.status(), StatusCode::OK);

        // allow the spawned cleanup task to run
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let second_get = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/bundles/deadbeef")
                    .header("X-Secrets-Token", "ro-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second_get.status(), StatusCode::NOT_FOUND);
        assert!(!dir.path().join("deadbeef.tar").exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent_for_absent_ref() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/v1/bundles/deadbeef")
                    .header("X-Secrets-Token", "wo-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
}
