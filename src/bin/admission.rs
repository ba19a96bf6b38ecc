//! Admission API binary entrypoint.

use std::sync::Arc;
use std::net::SocketAddr;

use clap::Parser;
use evmbench::admission::{router, AdmissionSettings, AdmissionState, HeaderAuthBackend};
use evmbench::admission::zip_validate::ZipValidationPolicy;
use evmbench::broker::Publisher;
use evmbench::config::{BrokerSettings, DatabaseSettings};
use evmbench::db::PgStore;
use secrecy::{ExposeSecret, SecretString};

#[derive(Debug, Parser)]
struct Settings {
    #[command(flatten)]
    database: DatabaseSettings,

    #[command(flatten)]
    broker: BrokerSettings,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    bind_addr: SocketAddr,

    #[arg(long, env = "SECRET_STORE_URL")]
    secret_store_base_url: String,

    #[arg(long, env = "SECRET_STORE_TOKEN_WO")]
    secret_store_write_token: String,

    #[arg(long, env = "MODEL_PROXY_URL")]
    model_proxy_base_url: String,

    #[arg(long, env = "OAI_PROXY_AES_SHARED_SECRET")]
    aes_shared_secret: Option<SecretString>,

    #[arg(long, env = "BACKEND_STATIC_KEY")]
    backend_static_key: Option<SecretString>,

    #[arg(long, env = "BACKEND_USE_PROXY_STATIC_KEY", default_value_t = false)]
    backend_use_proxy_static_key: bool,

    #[arg(long, env = "PROXY_STATIC_KEY_CONFIGURED", default_value_t = false)]
    proxy_static_key_configured: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    evmbench::config::init_tracing();
    let settings = Settings::parse();

    let db = PgStore::connect(settings.database.database_dsn.expose_secret(), settings.database.database_pool_size).await?;
    let publisher = Publisher::connect(settings.broker.rabbitmq_dsn.expose_secret(), &settings.broker.effective_queue_name()).await?;

    let admission_settings = AdmissionSettings {
        secret_store_base_url: settings.secret_store_base_url,
        secret_store_write_token: Arc::from(settings.secret_store_write_token.as_str()),
        aes_key: settings.aes_shared_secret.as_ref().map(|s| evmbench::crypto::derive_key(s.expose_secret())),
        backend_static_key: settings.backend_static_key.map(|s| s.expose_secret().to_string()),
        backend_use_proxy_static_key: settings.backend_use_proxy_static_key,
        proxy_static_key_configured: settings.proxy_static_key_configured,
        model_proxy_base_url: settings.model_proxy_base_url,
    };

    let state = AdmissionState {
        db: Arc::new(db),
        publisher: Arc::new(publisher),
        auth: Arc::new(HeaderAuthBackend),
        http: reqwest::Client::new(),
        settings: Arc::new(admission_settings),
        zip_policy: Arc::new(ZipValidationPolicy::default()),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    tracing::info!(addr = %settings.bind_addr, "admission listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
