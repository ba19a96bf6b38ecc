//! Secret Store binary entrypoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use evmbench::secretsvc::{router, SecretSvcState, SecretStore};

#[derive(Debug, Parser)]
struct Settings {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8001")]
    bind_addr: SocketAddr,

    #[arg(long, env = "SECRET_STORE_DIR", default_value = "/var/lib/evmbench/secrets")]
    storage_dir: PathBuf,

    #[arg(long, env = "SECRET_STORE_MAX_READS", default_value_t = 1)]
    max_reads: u32,

    #[arg(long, env = "SECRET_STORE_TOKEN_RO")]
    token_ro: String,

    #[arg(long, env = "SECRET_STORE_TOKEN_WO")]
    token_wo: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    evmbench::config::init_tracing();
    let settings = Settings::parse();

    let state = SecretSvcState {
        store: Arc::new(SecretStore::new(settings.storage_dir.clone(), settings.max_reads)),
        token_ro: Arc::from(settings.token_ro.as_str()),
        token_wo: Arc::from(settings.token_wo.as_str()),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    tracing::info!(addr = %settings.bind_addr, "secret store listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
