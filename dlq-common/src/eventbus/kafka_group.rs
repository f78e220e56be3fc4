use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use health::HealthHandle;
use parking_lot::Mutex;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, ClientContext, Statistics};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::ConsumeError;
use super::group::{ConsumerGroup, ConsumerGroupClaim, ConsumerGroupHandler, ConsumerGroupSession};
use super::message::InboundMessage;
use crate::config::KafkaConfig;

pub struct GroupContext {
    liveness: HealthHandle,
    revoked: Notify,
    errors: mpsc::UnboundedSender<ConsumeError>,
}

impl ClientContext for GroupContext {
    fn stats(&self, _: Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!("librdkafka error: {}: {}", error, reason);
        if self.errors.send(ConsumeError::Kafka(error)).is_err() {
            debug!("no listener for consumer errors");
        }
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) if partitions.count() > 0 => {
                info!("Revoking {} partitions", partitions.count());
                // Ends the running generation, its claims finish what they already received
                self.revoked.notify_one();
            }
            Rebalance::Revoke(_) => {
                debug!("Skipping empty revoke rebalance");
            }
            Rebalance::Assign(partitions) => {
                info!("Assigning {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }
}

/// Consumer group backed by an rdkafka `StreamConsumer`. Offsets are stored when a message
/// is marked and committed by the auto commit timer, and synchronously on close.
pub struct KafkaConsumerGroup {
    consumer: Arc<StreamConsumer<GroupContext>>,
    member_id: String,
    claim_buffer: usize,
    generation: AtomicU64,
    subscribed: Mutex<Vec<String>>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<ConsumeError>>>,
    shutdown: CancellationToken,
    active: tokio::sync::Mutex<()>,
}

impl KafkaConsumerGroup {
    pub fn new(
        config: &KafkaConfig,
        group_id: &str,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let member_id = format!("{}-{}", group_id, std::process::id());

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", group_id)
            .set("client.id", &member_id)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                config.kafka_consumer_auto_commit_interval_ms.to_string(),
            )
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set(
                "session.timeout.ms",
                config.kafka_consumer_session_timeout_ms.to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            liveness,
            revoked: Notify::new(),
            errors: errors_tx,
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer<GroupContext> = client_config.create_with_context(context)?;

        Ok(Self {
            consumer: Arc::new(consumer),
            member_id,
            claim_buffer: config.kafka_claim_buffer.max(1),
            generation: AtomicU64::new(0),
            subscribed: Mutex::new(Vec::new()),
            errors: Mutex::new(Some(errors_rx)),
            shutdown: CancellationToken::new(),
            active: tokio::sync::Mutex::new(()),
        })
    }

    fn ensure_subscribed(&self, topics: &[String]) -> Result<(), KafkaError> {
        let mut subscribed = self.subscribed.lock();
        if subscribed.as_slice() == topics {
            return Ok(());
        }

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topic_refs)?;
        info!(topics = ?topics, "subscribed to topics");
        *subscribed = topics.to_vec();
        Ok(())
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
    ) -> Result<(), ConsumeError> {
        let _active = self.active.lock().await;
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.ensure_subscribed(topics)?;

        let session = Arc::new(KafkaSession {
            consumer: self.consumer.clone(),
            member_id: self.member_id.clone(),
            generation_id: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
        });
        handler.setup(session.as_ref()).await?;

        let revoked = &self.consumer.context().revoked;
        let mut claims: HashMap<(String, i32), mpsc::Sender<InboundMessage>> = HashMap::new();
        let mut tasks = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = revoked.notified() => {
                    info!(
                        generation_id = session.generation_id,
                        "partitions revoked, ending generation"
                    );
                    break Ok(());
                }
                received = self.consumer.recv() => {
                    let message = match received {
                        Ok(message) => InboundMessage::from(&message),
                        Err(error) => break Err(ConsumeError::Kafka(error)),
                    };

                    let claim_key = (message.topic.clone(), message.partition);
                    let claim = claims.entry(claim_key.clone()).or_insert_with(|| {
                        let (tx, rx) = mpsc::channel(self.claim_buffer);
                        let claim =
                            ConsumerGroupClaim::new(message.topic.clone(), message.partition, rx);
                        let handler = handler.clone();
                        let session = session.clone();
                        tasks.spawn(async move {
                            handler.consume_claim(session.as_ref(), claim).await
                        });
                        tx
                    });

                    if claim.send(message).await.is_err() {
                        warn!(topic = %claim_key.0, partition = claim_key.1, "claim stopped early");
                        claims.remove(&claim_key);
                    }
                }
            }
        };

        // Closing the claim channels lets each claim drain what it already received
        drop(claims);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => error!("claim failed: {}", error),
                Err(error) => error!("claim task failed: {}", error),
            }
        }

        if let Err(error) = handler.cleanup(session.as_ref()).await {
            error!("consumer group cleanup failed: {}", error);
        }

        outcome
    }

    fn errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumeError>> {
        self.errors.lock().take()
    }

    async fn close(&self) -> Result<(), ConsumeError> {
        self.shutdown.cancel();
        // Wait for the running generation to finish marking messages
        let _active = self.active.lock().await;

        let committed = match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(error) => Err(ConsumeError::Kafka(error)),
        };
        self.consumer.unsubscribe();
        self.subscribed.lock().clear();

        info!("consumer group closed");
        committed
    }
}

struct KafkaSession {
    consumer: Arc<StreamConsumer<GroupContext>>,
    member_id: String,
    generation_id: u64,
}

impl ConsumerGroupSession for KafkaSession {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn generation_id(&self) -> u64 {
        self.generation_id
    }

    fn mark_message(&self, message: &InboundMessage) -> Result<(), ConsumeError> {
        // The stored offset is the next one to read
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset + 1)?;
        Ok(())
    }
}
