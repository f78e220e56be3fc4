use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use rdkafka::error::KafkaError;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::error::PublishError;
use super::headers::MessageHeaders;
use crate::config::KafkaConfig;
use crate::metrics::{
    EVENTBUS_PUBLISH_DELIVERED, EVENTBUS_PUBLISH_DELIVERY_FAILURES, EVENTBUS_PUBLISH_ENQUEUED,
    EVENTBUS_PUBLISH_ENQUEUE_FAILURES,
};

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Enqueue a message for `topic`. Returning `Ok` means enqueued, not delivered.
    async fn send(
        &self,
        topic: &str,
        key: &str,
        headers: &MessageHeaders,
        payload: &[u8],
    ) -> Result<(), PublishError>;

    /// Stop accepting messages and wait for pending deliveries. Safe to call more than once.
    async fn close(&self) -> Result<(), PublishError>;
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(liveness: HealthHandle) -> Self {
        KafkaContext { liveness }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("eventbus_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("eventbus_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
    }
}

struct PendingDelivery {
    topic: String,
    delivery: DeliveryFuture,
}

/// Kafka publisher. Delivery futures go through a bounded queue drained by one
/// background task, which logs and counts failed deliveries.
pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
    deliveries: Mutex<Option<mpsc::Sender<PendingDelivery>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl KafkaPublisher {
    pub async fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", config.kafka_compression_codec.to_owned())
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                config.kafka_producer_queue_messages.to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(liveness.into())?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        let (tx, rx) = mpsc::channel(config.kafka_delivery_queue_size.max(1));
        let drain = tokio::spawn(drain_deliveries(rx));

        Ok(KafkaPublisher {
            producer,
            deliveries: Mutex::new(Some(tx)),
            drain: Mutex::new(Some(drain)),
        })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        headers: &MessageHeaders,
        payload: &[u8],
    ) -> Result<(), PublishError> {
        let deliveries = self.deliveries.lock().clone();
        let Some(deliveries) = deliveries else {
            return Err(PublishError::Closed);
        };

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(headers.to_kafka());

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((error, _)) => {
                counter!(EVENTBUS_PUBLISH_ENQUEUE_FAILURES, "topic" => topic.to_owned())
                    .increment(1);
                error!(topic, "failed to enqueue message: {}", error);
                return Err(PublishError::Enqueue {
                    topic: topic.to_owned(),
                    error,
                });
            }
        };

        // Waits for room when the drain task falls behind
        deliveries
            .send(PendingDelivery {
                topic: topic.to_owned(),
                delivery,
            })
            .await
            .map_err(|_| PublishError::Closed)?;

        counter!(EVENTBUS_PUBLISH_ENQUEUED, "topic" => topic.to_owned()).increment(1);
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        let deliveries = self.deliveries.lock().take();
        if deliveries.is_none() {
            debug!("publisher already closed");
            return Ok(());
        }
        drop(deliveries);

        info!("flushing kafka producer");
        let flushed = self
            .producer
            .flush(Duration::from_secs(30))
            .map_err(PublishError::Flush);

        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            drain.await?;
        }

        flushed
    }
}

async fn drain_deliveries(mut deliveries: mpsc::Receiver<PendingDelivery>) {
    while let Some(PendingDelivery { topic, delivery }) = deliveries.recv().await {
        match delivery.await {
            Ok(Ok(_)) => {
                counter!(EVENTBUS_PUBLISH_DELIVERED, "topic" => topic).increment(1);
            }
            Ok(Err((error, _))) => {
                counter!(EVENTBUS_PUBLISH_DELIVERY_FAILURES, "topic" => topic.clone())
                    .increment(1);
                error!(topic = %topic, "failed to deliver message: {}", error);
            }
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!(EVENTBUS_PUBLISH_DELIVERY_FAILURES, "topic" => topic.clone())
                    .increment(1);
                error!(topic = %topic, "failed to deliver message before the write timeout");
            }
        }
    }
    debug!("delivery drain finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthRegistry;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use time::Duration as TimeDuration;

    async fn start_on_mocked_cluster(
    ) -> (MockCluster<'static, DefaultProducerContext>, KafkaPublisher) {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("publisher".to_string(), TimeDuration::seconds(30));
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let config = KafkaConfig {
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_tls: false,
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_producer_queue_messages: 1000,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
            kafka_delivery_queue_size: 16,
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_consumer_auto_commit_interval_ms: 5000,
            kafka_consumer_session_timeout_ms: 10000,
            kafka_claim_buffer: 10,
        };
        let publisher = KafkaPublisher::new(&config, handle)
            .await
            .expect("failed to create publisher");
        (cluster, publisher)
    }

    #[tokio::test]
    async fn kafka_publisher_send_and_close() {
        let (_cluster, publisher) = start_on_mocked_cluster().await;
        let headers: MessageHeaders = [("origin", "svc-a")].into_iter().collect();

        publisher
            .send("orders", "o1", &headers, br#"{"id":"o1"}"#)
            .await
            .expect("failed to enqueue message");

        publisher.close().await.expect("failed to close publisher");

        match publisher.send("orders", "o2", &headers, b"{}").await {
            Err(PublishError::Closed) => {}
            other => panic!("expected a closed publisher, got {:?}", other),
        }

        // Closing again is a no-op
        publisher.close().await.expect("second close failed");
    }
}
