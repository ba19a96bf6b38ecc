//! Instancer binary entrypoint.

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use evmbench::config::{BrokerSettings, DatabaseSettings};
use evmbench::db::PgStore;
use evmbench::instancer::backend::WorkerBackend;
use evmbench::instancer::docker::DockerBackend;
use evmbench::instancer::k8s::K8sBackend;
use evmbench::instancer::{Consumer, ConsumerConfig, DlqConsumer};
use secrecy::{ExposeSecret, SecretString};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Docker,
    K8s,
}

#[derive(Debug, Parser)]
struct Settings {
    #[command(flatten)]
    database: DatabaseSettings,

    #[command(flatten)]
    broker: BrokerSettings,

    #[arg(long, env = "INSTANCER_BACKEND", value_enum, default_value_t = BackendKind::Docker)]
    backend: BackendKind,

    #[arg(long, env = "SECRET_STORE_URL")]
    secret_store_url: String,

    #[arg(long, env = "SECRET_STORE_TOKEN_RO")]
    secret_store_read_token: SecretString,

    #[arg(long, env = "MODEL_PROXY_URL")]
    model_proxy_url: String,

    #[arg(long, env = "RESULT_SERVICE_URL")]
    result_service_url: String,
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

    let queue = settings.broker.effective_queue_name();
    let dlq_name = settings.broker.dlq_name(None);
    // A cap and a TTL never coexist: a capped deployment lets jobs wait
    // arbitrarily long behind capacity rather than expiring them.
    let queue_ttl_ms = settings
        .broker
        .max_concurrent_jobs
        .is_none()
        .then_some(settings.broker.rabbitmq_queue_ttl_seconds)
        .flatten()
        .map(|secs| secs * 1000);

    let consumer_config = ConsumerConfig {
        queue: queue.clone(),
        max_concurrent_jobs: settings.broker.max_concurrent_jobs,
        poll_seconds: settings.broker.poll_seconds,
        queue_ttl_ms,
        dlq_name: dlq_name.clone(),
        secret_store_url: settings.secret_store_url,
        secret_store_read_token: settings.secret_store_read_token.expose_secret().to_string(),
        model_proxy_url: settings.model_proxy_url,
        result_service_url: settings.result_service_url,
    };

    let consumer = Consumer::connect(settings.broker.rabbitmq_dsn.expose_secret(), db.clone(), backend, consumer_config).await?;

    // The DLQ consumer only makes sense when a cap is not configured and a
    // TTL is: with a cap, users may intentionally wait; with no TTL,
    // messages never expire into the DLQ (Design Notes iii).
    if queue_ttl_ms.is_some() {
        let dlq_consumer = DlqConsumer::connect(settings.broker.rabbitmq_dsn.expose_secret(), &dlq_name, db.clone()).await?;
        tokio::spawn(async move {
            if let Err(err) = dlq_consumer.run().await {
                tracing::error!(error = %err, "dlq consumer stopped");
            }
        });
    }

    tracing::info!(queue = %queue, "instancer consuming");
    consumer.run().await?;
    Ok(())
}
