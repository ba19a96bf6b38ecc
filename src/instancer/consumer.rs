//! Broker consumer loop. Grounded on `instancer/consumer.py`: `prefetch=1`
//! so one instancer process never holds more unacked messages than it can
//! immediately act on, a poll against the backend's live worker count
//! gating concurrent job starts, and a CAS transition to `running` that
//! only happens once the worker has actually been provisioned — a message
//! whose worker fails to start is nacked with requeue so another instancer
//! (or this one later) gets a turn at it instead of losing the job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties};
use thiserror::Error;

use crate::db::Database;
use crate::job::JobMessage;

use super::backend::{StartWorkerSpec, WorkerBackend};

#[derive(Debug, Error)]
pub enum InstancerError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),
    #[error("database error: {0}")]
    Database(#[from] crate::error::DatabaseError),
    #[error("worker backend error: {0}")]
    Backend(String),
}

pub struct ConsumerConfig {
    pub queue: String,
    pub max_concurrent_jobs: Option<usize>,
    pub poll_seconds: u64,
    /// Message TTL, in milliseconds. Only applied when `max_concurrent_jobs`
    /// is `None` — a capacity cap regulates queue latency on its own, and a
    /// deployment with a cap wants jobs to wait arbitrarily long rather than
    /// silently expire (§4.4, Design Notes iii).
    pub queue_ttl_ms: Option<u64>,
    pub dlq_name: String,
    pub secret_store_url: String,
    pub secret_store_read_token: String,
    pub model_proxy_url: String,
    pub result_service_url: String,
}

pub struct Consumer {
    channel: Channel,
    db: Arc<dyn Database>,
    backend: Arc<dyn WorkerBackend>,
    config: ConsumerConfig,
}

impl Consumer {
    pub async fn connect(
        dsn: &str,
        db: Arc<dyn Database>,
        backend: Arc<dyn WorkerBackend>,
        config: ConsumerConfig,
    ) -> Result<Self, InstancerError> {
        let conn = Connection::connect(dsn, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        // A concurrency cap already regulates latency, so a cap and a TTL
        // never coexist: apply dead-letter args only when uncapped.
        let declare_args = match (config.max_concurrent_jobs, config.queue_ttl_ms) {
            (None, Some(ttl_ms)) => {
                channel
                    .queue_declare(&config.dlq_name, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
                    .await?;
                let mut args = FieldTable::default();
                args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl_ms as u32));
                args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
                args.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString(config.dlq_name.as_str().into()));
                args
            }
            _ => FieldTable::default(),
        };
        channel
            .queue_declare(&config.queue, QueueDeclareOptions { durable: true, ..Default::default() }, declare_args)
            .await?;

        Ok(Self { channel, db, backend, config })
    }

    /// The effective concurrency cap: the configured override, else the
    /// backend's own default (e.g. `cpu_count * 3` for Docker, unbounded for
    /// Kubernetes).
    fn effective_cap(&self) -> Option<usize> {
        self.config.max_concurrent_jobs.or_else(|| self.backend.default_max_concurrency())
    }

    /// Blocks — without acking the in-flight delivery — until the backend's
    /// live worker count drops below `cap`, polling every `poll_seconds`.
    /// This is a snapshot read, so a transient over-admit by one worker under
    /// contention is possible and accepted (§5).
    async fn wait_for_capacity(&self, cap: usize) -> Result<(), InstancerError> {
        loop {
            let running = self.backend.running_workers().await.map_err(|e| InstancerError::Backend(e.to_string()))?;
            if running.len() < cap {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(self.config.poll_seconds)).await;
        }
    }

    /// Runs until the channel closes. Each delivery either starts a worker
    /// and transitions the job to `running`, or is nacked — with requeue if
    /// the worker failed to start, without requeue if the message itself is
    /// malformed, since no retry will fix that.
    pub async fn run(&self) -> Result<(), InstancerError> {
        let mut consumer = self
            .channel
            .basic_consume(&self.config.queue, "instancer", BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(error = %err, "delivery error");
                    continue;
                }
            };

            if let Some(cap) = self.effective_cap() {
                if let Err(err) = self.wait_for_capacity(cap).await {
                    tracing::error!(error = %err, "capacity check failed, requeuing");
                    let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
                    continue;
                }
            }

            let message: JobMessage = match serde_json::from_slice(&delivery.data) {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(error = %err, "malformed job message, dropping");
                    let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
                    continue;
                }
            };

            match self.start_job(&message).await {
                Ok(()) => {
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                }
                Err(err) => {
                    // BackendFailure: nack with requeue, no DB change — another
                    // instancer (or this one later) gets a turn at the same message.
                    tracing::warn!(job_id = %message.job_id, error = %err, "worker start failed, requeuing");
                    let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
                }
            }
        }

        Ok(())
    }

    async fn start_job(&self, message: &JobMessage) -> Result<(), InstancerError> {
        let spec = StartWorkerSpec {
            job_id: message.job_id,
            agent_id: message.model.clone(),
            secret_ref: message.secret_ref.clone(),
            secret_store_read_token: self.config.secret_store_read_token.clone(),
            result_token: message.result_token.clone(),
            secret_store_url: self.config.secret_store_url.clone(),
            model_proxy_url: self.config.model_proxy_url.clone(),
            result_service_url: self.config.result_service_url.clone(),
        };

        self.backend
            .start_worker(&spec)
            .await
            .map_err(|err| InstancerError::Backend(err.to_string()))?;
        self.db.transition_to_running(message.job_id, Utc::now()).await?;
        Ok(())
    }
}

/// Consumes the dead-letter queue (only wired up when a queue TTL is
/// configured): a message that lands here expired before the instancer ever
/// saw it, so the job is failed outright rather than retried.
pub struct DlqConsumer {
    channel: Channel,
    db: Arc<dyn Database>,
    queue: String,
}

impl DlqConsumer {
    pub async fn connect(dsn: &str, queue: &str, db: Arc<dyn Database>) -> Result<Self, InstancerError> {
        let conn = Connection::connect(dsn, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        channel
            .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await?;
        Ok(Self { channel, db, queue: queue.to_string() })
    }

    pub async fn run(&self) -> Result<(), InstancerError> {
        let mut consumer = self
            .channel
            .basic_consume(&self.queue, "instancer-dlq", BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        while let Some(delivery) = consumer.next().await {
            let Ok(delivery) = delivery else { continue };
            if death_reason_is_expired(delivery.properties.headers().as_ref()) {
                if let Ok(message) = serde_json::from_slice::<JobMessage>(&delivery.data) {
                    let _ = self.db.fail_job(message.job_id, "job expired in queue", Utc::now()).await;
                }
            }
            let _ = delivery.ack(BasicAckOptions::default()).await;
        }

        Ok(())
    }
}

/// Reads the first entry of the `x-death` header array and confirms its
/// `reason` is `expired` — the only death reason that should transition a
/// job to `failed` here. Any other reason (or a missing header) is dropped
/// without touching the job.
fn death_reason_is_expired(headers: Option<&FieldTable>) -> bool {
    let Some(headers) = headers else { return false };
    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get("x-death") else { return false };
    let Some(AMQPValue::FieldTable(first)) = deaths.as_slice().first() else { return false };
    matches!(first.inner().get("reason"), Some(AMQPValue::LongString(reason)) if reason.as_bytes() == b"expired")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldArray;

    fn death_table(reason: &str) -> FieldTable {
        let mut death = FieldTable::default();
        death.insert("reason".into(), AMQPValue::LongString(reason.into()));
        let mut headers = FieldTable::default();
        headers.insert("x-death".into(), AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])));
        headers
    }

    #[test]
    fn expired_death_reason_is_recognized() {
        assert!(death_reason_is_expired(Some(&death_table("expired"))));
    }

    #[test]
    fn other_death_reasons_are_ignored() {
        assert!(!death_reason_is_expired(Some(&death_table("rejected"))));
    }

    #[test]
    fn missing_headers_are_not_expired() {
        assert!(!death_reason_is_expired(None));
    }
}
