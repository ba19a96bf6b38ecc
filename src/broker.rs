//! Durable broker publishing: `mandatory=true` with publisher confirms, so
//! Admission can tell apart "message accepted by the broker" from "message
//! silently dropped because no queue bound the routing key."

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use thiserror::Error;

use crate::job::JobMessage;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(#[from] lapin::Error),
    #[error("publish was not confirmed by the broker")]
    NotConfirmed,
    #[error("broker rejected the message as unroutable (mandatory)")]
    Unroutable,
}

pub struct Publisher {
    channel: Channel,
    queue: String,
}

impl Publisher {
    pub async fn connect(dsn: &str, queue: &str) -> Result<Self, BrokerError> {
        let conn = Connection::connect(dsn, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        channel
            .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await?;
        Ok(Self { channel, queue: queue.to_string() })
    }

    /// Publishes `message` with `mandatory=true` and waits for the broker's
    /// publisher confirm. Returns [`BrokerError::Unroutable`] if the broker
    /// reports the message could not be routed to any queue, and
    /// [`BrokerError::NotConfirmed`] if the confirm comes back negative.
    pub async fn publish(&self, message: &JobMessage) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(message).expect("JobMessage always serializes");
        let confirm = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions { mandatory: true, ..Default::default() },
                &body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;

        match confirm {
            lapin::publisher_confirm::Confirmation::Ack(_) => Ok(()),
            lapin::publisher_confirm::Confirmation::Nack(_) => Err(BrokerError::NotConfirmed),
            lapin::publisher_confirm::Confirmation::NotRequested => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_message_serializes_to_expected_shape() {
        let msg = JobMessage::new(uuid::Uuid::nil(), "deadbeef", "codex-gpt-5.2", "resulttoken");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "job.start");
        assert_eq!(value["secret_ref"], "deadbeef");
        assert_eq!(value["model"], "codex-gpt-5.2");
        assert_eq!(value["result_token"], "resulttoken");
    }
}
