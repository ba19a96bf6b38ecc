//! Result Service binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use evmbench::config::DatabaseSettings;
use evmbench::db::PgStore;
use evmbench::resultsvc::{router, ResultSvcState};
use secrecy::ExposeSecret;

#[derive(Debug, Parser)]
struct Settings {
    #[command(flatten)]
    database: DatabaseSettings,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8003")]
    bind_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    evmbench::config::init_tracing();
    let settings = Settings::parse();

    let db = PgStore::connect(settings.database.database_dsn.expose_secret(), settings.database.database_pool_size).await?;
    let state = ResultSvcState { db: Arc::new(db) };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    tracing::info!(addr = %settings.bind_addr, "result service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
