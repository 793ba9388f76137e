use std::time::Duration;

use chrono::Utc;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Message};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::health::HealthHandle;
use crate::metrics::BUS_RECONNECTS;
use crate::pipeline::Pipeline;

/// How often a connected consumer reports itself live while waiting for messages.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum BusError {
    #[error("failed to create kafka consumer: {0}")]
    Create(KafkaError),
    #[error("failed to subscribe to {pattern}: {error}")]
    Subscribe { pattern: String, error: KafkaError },
    #[error("lost connection to the brokers: {0}")]
    Disconnected(KafkaError),
}

/// Create a consumer subscribed to every topic matching the configured pattern.
///
/// Offsets are stored by hand after a message went through the pipeline and committed by
/// the client in the background, which gives at-least-once processing.
pub fn connect(config: &BusConfig) -> Result<StreamConsumer, BusError> {
    let backoff_ms = config.reconnect_backoff.0.as_millis().to_string();

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("group.id", &config.kafka_consumer_group)
        .set("auto.offset.reset", &config.kafka_offset_reset)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("session.timeout.ms", "10000")
        .set("reconnect.backoff.ms", &backoff_ms)
        .set("reconnect.backoff.max.ms", &backoff_ms);

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    let consumer: StreamConsumer = client_config.create().map_err(BusError::Create)?;
    consumer
        .subscribe(&[config.kafka_topic_pattern.as_str()])
        .map_err(|error| BusError::Subscribe {
            pattern: config.kafka_topic_pattern.clone(),
            error,
        })?;

    Ok(consumer)
}

/// Errors after which the consumer is torn down and recreated.
fn is_disconnect(error: &KafkaError) -> bool {
    match error {
        KafkaError::MessageConsumptionFatal(_) => true,
        KafkaError::MessageConsumption(code) => matches!(
            code,
            RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure
        ),
        _ => false,
    }
}

/// Feeds bus messages into the pipeline one at a time.
pub struct BusConsumer {
    config: BusConfig,
    pipeline: Pipeline,
}

impl BusConsumer {
    pub fn new(config: BusConfig, pipeline: Pipeline) -> Self {
        Self { config, pipeline }
    }

    /// Consume until shutdown, reconnecting with a fixed backoff whenever the connection is
    /// lost or cannot be established.
    pub async fn run(self, liveness: HealthHandle, shutdown: CancellationToken) {
        let backoff = self.config.reconnect_backoff.0;
        info!(
            hosts = %self.config.kafka_hosts,
            pattern = %self.config.kafka_topic_pattern,
            "bus consumer starting"
        );

        while !shutdown.is_cancelled() {
            match connect(&self.config) {
                Ok(consumer) => {
                    info!(pattern = %self.config.kafka_topic_pattern, "subscribed to bus");
                    let result = self.consume(&consumer, &liveness, &shutdown).await;
                    consumer.unsubscribe();

                    match result {
                        Ok(()) => break,
                        Err(err) => warn!(
                            reason = %err,
                            backoff = ?backoff,
                            "bus connection lost, reconnecting"
                        ),
                    }
                }
                Err(err) => warn!(reason = %err, backoff = ?backoff, "failed to connect to bus"),
            }

            metrics::counter!(BUS_RECONNECTS).increment(1);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        info!("bus consumer stopped");
    }

    async fn consume(
        &self,
        consumer: &StreamConsumer,
        liveness: &HealthHandle,
        shutdown: &CancellationToken,
    ) -> Result<(), BusError> {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = heartbeat.tick() => {
                    liveness.report_healthy();
                    continue;
                }
                message = consumer.recv() => message,
            };

            let message = match message {
                Ok(message) => message,
                Err(err) if is_disconnect(&err) => return Err(BusError::Disconnected(err)),
                Err(err) => {
                    warn!(reason = %err, "bus consumer error");
                    continue;
                }
            };

            // Runs to completion even if shutdown is requested meanwhile.
            let admission = self
                .pipeline
                .ingest_payload(message.payload().unwrap_or_default(), Utc::now())
                .await;

            debug!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                outcome = admission.as_str(),
                "bus message processed"
            );

            // Malformed messages are stored too, so they are not redelivered forever.
            if let Err(err) = consumer.store_offset_from_message(&message) {
                warn!(reason = %err, "failed to store bus offset");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvMsDuration, Toggle};

    fn config(offset_reset: &str) -> BusConfig {
        BusConfig {
            enabled: Toggle(true),
            kafka_hosts: "localhost:1".to_owned(),
            kafka_consumer_group: "sensor-ingest-test".to_owned(),
            kafka_topic_pattern: r"^forest\.sensors\..*".to_owned(),
            kafka_tls: false,
            kafka_offset_reset: offset_reset.to_owned(),
            reconnect_backoff: EnvMsDuration(Duration::from_millis(5000)),
        }
    }

    #[tokio::test]
    async fn test_connect_subscribes_to_pattern() {
        let consumer = connect(&config("latest")).expect("failed to create consumer");

        let subscription = consumer.subscription().unwrap();
        assert_eq!(subscription.count(), 1);
        assert!(subscription
            .elements()
            .iter()
            .any(|element| element.topic() == r"^forest\.sensors\..*"));
    }

    #[tokio::test]
    async fn test_invalid_client_config_is_rejected() {
        assert!(matches!(
            connect(&config("sideways")),
            Err(BusError::Create(_))
        ));
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(is_disconnect(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::AllBrokersDown
        )));
        assert!(is_disconnect(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
        assert!(!is_disconnect(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition
        )));
        assert!(!is_disconnect(&KafkaError::NoMessageReceived));
    }
}
