use rdkafka::error::KafkaError;
use thiserror::Error;
use tokio::task::JoinError;

/// Errors returned by a [`crate::eventbus::Publisher`]. A successful `send` only means the
/// message was enqueued, delivery failures are reported by the drain task.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("publisher is closed")]
    Closed,
    #[error("failed to enqueue message for {topic}: {error}")]
    Enqueue { topic: String, error: KafkaError },
    #[error("failed to flush producer: {0}")]
    Flush(KafkaError),
    #[error("delivery drain task failed: {0}")]
    Drain(#[from] JoinError),
}

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer group is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum DlqError {
    #[error("failed to serialize dead letter message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to publish dead letter message: {0}")]
    Publish(#[from] PublishError),
}

impl DlqError {
    /// Serialization is deterministic, sending the same envelope again cannot succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DlqError::Serialization(_) => false,
            DlqError::Publish(PublishError::Closed) => false,
            DlqError::Publish(_) => true,
        }
    }
}
