use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::ConsumeError;
use super::message::InboundMessage;

/// A consumer group client. Both the rdkafka client and test doubles implement it.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Runs one group generation over `topics`: setup, one claim per assigned partition,
    /// then cleanup. Returns when the generation ends (rebalance or close).
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
    ) -> Result<(), ConsumeError>;

    /// Client level errors. The receiver is handed out once, later calls return `None`.
    fn errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumeError>>;

    /// Leaves the group after committing stored offsets.
    async fn close(&self) -> Result<(), ConsumeError>;
}

/// Lifecycle hooks called by a [`ConsumerGroup`] for every generation.
#[async_trait]
pub trait ConsumerGroupHandler: Send + Sync {
    async fn setup(&self, _session: &dyn ConsumerGroupSession) -> Result<(), ConsumeError> {
        Ok(())
    }

    async fn cleanup(&self, _session: &dyn ConsumerGroupSession) -> Result<(), ConsumeError> {
        Ok(())
    }

    /// Processes the messages of one partition, in order, until the claim is closed.
    async fn consume_claim(
        &self,
        session: &dyn ConsumerGroupSession,
        claim: ConsumerGroupClaim,
    ) -> Result<(), ConsumeError>;
}

/// Context of one group generation, only valid while its claims run.
pub trait ConsumerGroupSession: Send + Sync {
    fn member_id(&self) -> &str;

    fn generation_id(&self) -> u64;

    /// Acknowledges `message`: its partition resumes after it on the next generation.
    fn mark_message(&self, message: &InboundMessage) -> Result<(), ConsumeError>;
}

/// The message stream of one partition within a generation.
pub struct ConsumerGroupClaim {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<InboundMessage>,
}

impl ConsumerGroupClaim {
    pub fn new(topic: String, partition: i32, messages: mpsc::Receiver<InboundMessage>) -> Self {
        Self {
            topic,
            partition,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Next message, `None` once the generation ended and buffered messages were consumed.
    pub async fn next(&mut self) -> Option<InboundMessage> {
        self.messages.recv().await
    }
}
