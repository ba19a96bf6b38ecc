//! Model Proxy (P): a stateless reverse proxy that rewrites an opaque
//! per-job bearer token into the real upstream model credential. Grounded on
//! `sandbox::proxy::http`'s hyper server-loop shape (hop-by-hop header list,
//! `http1::Builder` + `service_fn` pattern), specialized from a generic
//! `CredentialResolver` trait to AES-GCM/static-marker resolution.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

const STATIC_KEY_MARKER: &str = "STATIC";

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

#[derive(Debug, Clone, Copy)]
pub enum Provider {
    OpenAi,
    OpenRouter,
}

impl Provider {
    fn from_query(provider: Option<&str>) -> Self {
        match provider.map(str::to_ascii_lowercase).as_deref() {
            Some("openrouter") => Provider::OpenRouter,
            _ => Provider::OpenAi,
        }
    }

    fn base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com",
            Provider::OpenRouter => "https://openrouter.ai/api",
        }
    }
}

pub struct ProxyConfig {
    pub aes_key: [u8; 32],
    pub static_key: Option<String>,
}

/// Resolves the opaque bearer token in the incoming request into the real
/// upstream credential, per §4.3: the literal marker substitutes the
/// proxy-held static key; anything else is treated as an AES-GCM envelope.
fn resolve_upstream_key(token: &str, config: &ProxyConfig) -> Result<String, StatusCode> {
    if token == STATIC_KEY_MARKER {
        return config.static_key.clone().ok_or(StatusCode::NOT_IMPLEMENTED);
    }
    crate::crypto::decrypt_token(token, &config.aes_key).map_err(|_| StatusCode::UNAUTHORIZED)
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

fn error_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder().status(status).body(empty_body()).unwrap()
}

fn bearer_token(req: &Request<Incoming>) -> Option<&str> {
    let header = req.headers().get(http::header::AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

fn query_param<'a>(req: &'a Request<Incoming>, key: &str) -> Option<&'a str> {
    let query = req.uri().query()?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn filtered_query(req: &Request<Incoming>) -> Option<String> {
    let query = req.uri().query()?;
    let filtered: Vec<&str> = query.split('&').filter(|pair| !pair.starts_with("provider=")).collect();
    (!filtered.is_empty()).then(|| filtered.join("&"))
}

async fn forward_request(
    req: Request<Incoming>,
    config: Arc<ProxyConfig>,
    http_client: reqwest::Client,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let token = match bearer_token(&req) {
        Some(t) => t.to_string(),
        None => return Ok(error_response(StatusCode::UNAUTHORIZED)),
    };

    let upstream_key = match resolve_upstream_key(&token, &config) {
        Ok(k) => k,
        Err(status) => return Ok(error_response(status)),
    };

    let provider = Provider::from_query(query_param(&req, "provider"));
    let path = req.uri().path();
    let mut target = format!("{}{}", provider.base_url(), path);
    if let Some(q) = filtered_query(&req) {
        target.push('?');
        target.push_str(&q);
    }

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes()).unwrap();
    let mut builder = http_client.request(method, &target);
    for (name, value) in req.headers() {
        let name_str = name.as_str();
        if is_hop_by_hop_header(name_str) || name_str.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let Ok(v) = value.to_str() {
            builder = builder.header(name_str, v);
        }
    }
    builder = builder.header("authorization", format!("Bearer {upstream_key}"));
    if matches!(provider, Provider::OpenRouter) {
        builder = builder.header("http-referer", "https://evmbench.io").header("x-title", "evmbench");
    }

    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Ok(error_response(StatusCode::BAD_GATEWAY)),
    };
    builder = builder.body(body_bytes.to_vec());

    let upstream_resp = match builder.send().await {
        Ok(r) => r,
        Err(_) => return Ok(error_response(StatusCode::BAD_GATEWAY)),
    };

    let status = StatusCode::from_u16(upstream_resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_builder = Response::builder().status(status);
    for (name, value) in upstream_resp.headers() {
        if is_hop_by_hop_header(name.as_str()) {
            continue;
        }
        response_builder = response_builder.header(name, value);
    }
    let response_bytes = upstream_resp.bytes().await.unwrap_or_default();
    let body = Full::new(response_bytes).map_err(|never| match never {}).boxed();
    Ok(response_builder.body(body).unwrap())
}

pub struct OaiProxy {
    config: Arc<ProxyConfig>,
}

impl OaiProxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config: Arc::new(config) }
    }

    pub async fn serve(&self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client builds");

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let config = self.config.clone();
            let client = client.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| forward_request(req, config.clone(), client.clone()));
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::warn!(error = %err, "proxy connection error");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_hop_by_hop_headers_case_insensitively() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("authorization"));
    }

    #[test]
    fn static_marker_substitutes_configured_static_key() {
        let config = ProxyConfig { aes_key: crate::crypto::derive_key("s"), static_key: Some("sk-real".into()) };
        assert_eq!(resolve_upstream_key("STATIC", &config).unwrap(), "sk-real");
    }

    #[test]
    fn static_marker_without_configured_key_is_not_implemented() {
        let config = ProxyConfig { aes_key: crate::crypto::derive_key("s"), static_key: None };
        assert_eq!(resolve_upstream_key("STATIC", &config).unwrap_err(), StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn encrypted_token_decrypts_to_real_key() {
        let key = crate::crypto::derive_key("shared");
        let token = crate::crypto::encrypt_token("sk-user-key", &key);
        let config = ProxyConfig { aes_key: key, static_key: None };
        assert_eq!(resolve_upstream_key(&token, &config).unwrap(), "sk-user-key");
    }

    #[test]
    fn tampered_token_is_unauthorized() {
        let key = crate::crypto::derive_key("shared");
        let config = ProxyConfig { aes_key: key, static_key: None };
        assert_eq!(resolve_upstream_key("not-a-real-token", &config).unwrap_err(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn unknown_provider_falls_back_to_default() {
        assert!(matches!(Provider::from_query(Some("bogus")), Provider::OpenAi));
        assert!(matches!(Provider::from_query(Some("openrouter")), Provider::OpenRouter));
    }
}
