//! Reaper/Pruner binary entrypoint.

use std::sync::Arc;

use chrono::Duration;
use clap::{Parser, ValueEnum};
use evmbench::config::DatabaseSettings;
use evmbench::db::PgStore;
use evmbench::instancer::backend::WorkerBackend;
use evmbench::instancer::docker::DockerBackend;
use evmbench::instancer::k8s::K8sBackend;
use evmbench::prunner::{Prunner, PrunnerConfig};
use secrecy::ExposeSecret;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Docker,
    K8s,
}

#[derive(Debug, Parser)]
struct Settings {
    #[command(flatten)]
    database: DatabaseSettings,

    #[arg(long, env = "INSTANCER_BACKEND", value_enum, default_value_t = BackendKind::Docker)]
    backend: BackendKind,

    #[arg(long, env = "PRUNNER_SWEEP_INTERVAL_SECONDS", default_value_t = 60)]
    sweep_interval_seconds: u64,

    #[arg(long, env = "PRUNNER_MAX_WORKER_AGE_MINUTES", default_value_t = 30)]
    max_worker_age_minutes: i64,

    #[arg(long, env = "PRUNNER_LOST_AFTER_MINUTES", default_value_t = 5)]
    lost_after_minutes: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    evmbench::config::init_tracing();
    let settings = Settings::parse();

    let db = Arc::new(PgStore::connect(settings.database.database_dsn.expose_secret(), settings.database.database_pool_size).await?);

    let backend: Arc<dyn WorkerBackend> = match settings.backend {
        BackendKind::Docker => Arc::new(DockerBackend::connect()?),
        BackendKind::K8s => Arc::new(K8sBackend::connect().await?),
    };

    let config = PrunnerConfig {
        max_worker_age: Duration::minutes(settings.max_worker_age_minutes),
        lost_after: Duration::minutes(settings.lost_after_minutes),
    };
    let prunner = Prunner::new(db, vec![backend], config);

    tracing::info!(interval_secs = settings.sweep_interval_seconds, "reaper running");
    prunner.run_forever(std::time::Duration::from_secs(settings.sweep_interval_seconds)).await;
    Ok(())
}
