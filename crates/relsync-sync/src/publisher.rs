//! Repair event publishing onto the graph feeder exchange.

use anyhow::Context;
use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use relsync_core::{RelationshipRecord, RepairEvent};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publishing to exchange {exchange} failed: {cause}")]
    Transport { exchange: String, cause: String },
}

/// Fire-and-forget publish primitive of the message exchange.
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8])
        -> Result<(), PublishError>;
}

/// AMQP channel that publishes without waiting for broker confirms.
pub struct AmqpTransport {
    _connection: Connection,
    channel: Channel,
}

impl AmqpTransport {
    pub async fn connect(amqp_url: &str) -> anyhow::Result<Self> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .context("connecting to message exchange")?;
        let channel = connection
            .create_channel()
            .await
            .context("opening message exchange channel")?;
        info!("connected to message exchange");
        Ok(Self {
            _connection: connection,
            channel,
        })
    }
}

#[async_trait]
impl ExchangeTransport for AmqpTransport {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), PublishError> {
        let options = BasicPublishOptions {
            mandatory: false,
            immediate: false,
        };
        // The returned confirm is dropped unawaited.
        self.channel
            .basic_publish(exchange, routing_key, options, body, BasicProperties::default())
            .await
            .map_err(|err| PublishError::Transport {
                exchange: exchange.to_string(),
                cause: err.to_string(),
            })?;
        Ok(())
    }
}

/// Dry-run transport: logs what would have been published.
#[derive(Debug, Default)]
pub struct LogOnlyTransport;

#[async_trait]
impl ExchangeTransport for LogOnlyTransport {
    async fn publish(
        &self,
        exchange: &str,
        _routing_key: &str,
        body: &[u8],
    ) -> Result<(), PublishError> {
        info!(exchange, body = %String::from_utf8_lossy(body), "dry run, repair event not published");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The envelope could not be serialized; nothing was sent.
    Dropped,
}

pub struct RepairPublisher<'t> {
    transport: &'t dyn ExchangeTransport,
    exchange: String,
}

impl<'t> RepairPublisher<'t> {
    pub fn new(transport: &'t dyn ExchangeTransport, exchange: impl Into<String>) -> Self {
        Self {
            transport,
            exchange: exchange.into(),
        }
    }

    /// Publish a `RelationshipSaved` envelope for `record` with an empty routing key.
    pub async fn publish_record(
        &self,
        record: &RelationshipRecord,
    ) -> Result<PublishOutcome, PublishError> {
        let body = match RepairEvent::for_record(record).to_json() {
            Ok(body) => body,
            Err(err) => {
                error!(id = %record.id, error = %err, "serializing repair event failed");
                return Ok(PublishOutcome::Dropped);
            }
        };
        self.transport.publish(&self.exchange, "", &body).await?;
        Ok(PublishOutcome::Published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl ExchangeTransport for RecordingTransport {
        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            body: &[u8],
        ) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Transport {
                    exchange: exchange.into(),
                    cause: "channel closed".into(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((exchange.into(), routing_key.into(), body.to_vec()));
            Ok(())
        }
    }

    fn record() -> RelationshipRecord {
        RelationshipRecord {
            id: "r1".into(),
            source_id: "s1".into(),
            source_name: "JAccount".into(),
            target_id: "t1".into(),
            target_name: "JGroup".into(),
            rel_type: "member".into(),
        }
    }

    #[tokio::test]
    async fn publishes_envelope_on_fixed_exchange_with_empty_key() {
        let transport = RecordingTransport::default();
        let publisher = RepairPublisher::new(&transport, "graphFeederExchange");

        let outcome = publisher.publish_record(&record()).await.unwrap();

        assert_eq!(outcome, PublishOutcome::Published);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "graphFeederExchange");
        assert_eq!(sent[0].1, "");
        let event: RepairEvent = serde_json::from_slice(&sent[0].2).unwrap();
        assert_eq!(event, RepairEvent::for_record(&record()));
    }

    #[tokio::test]
    async fn transport_failures_surface_to_the_caller() {
        let transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let publisher = RepairPublisher::new(&transport, "graphFeederExchange");

        let err = publisher.publish_record(&record()).await.unwrap_err();
        assert!(err.to_string().contains("channel closed"));
    }

    #[tokio::test]
    async fn dry_run_transport_accepts_everything() {
        let transport = LogOnlyTransport;
        let publisher = RepairPublisher::new(&transport, "graphFeederExchange");
        assert_eq!(
            publisher.publish_record(&record()).await.unwrap(),
            PublishOutcome::Published
        );
    }
}
