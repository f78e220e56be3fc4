use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::DlqError;
use super::handler::DlqHandler;
use super::headers::{MessageHeaders, DLQ_HEADER};
use super::message::DeadLetterQueueMessage;
use super::publisher::Publisher;

/// Publishes dead letters as JSON to a fixed topic.
pub struct DlqHandlerAdapter {
    topic: String,
    publisher: Arc<dyn Publisher>,
}

impl DlqHandlerAdapter {
    pub fn new(topic: &str, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            topic: topic.to_owned(),
            publisher,
        }
    }
}

/// Key of a dead letter. The nanosecond suffix spreads repeated failures of the same
/// original key instead of compacting them together.
pub fn dead_letter_key(envelope: &DeadLetterQueueMessage, now: DateTime<Utc>) -> String {
    format!(
        "{}:{}:{}:{}",
        envelope.consumer,
        envelope.channel,
        envelope.key,
        now.timestamp_nanos_opt().unwrap_or_default()
    )
}

#[async_trait]
impl DlqHandler for DlqHandlerAdapter {
    async fn send(&self, envelope: &DeadLetterQueueMessage) -> Result<(), DlqError> {
        let payload = serde_json::to_vec(envelope)?;

        let mut headers = MessageHeaders::new();
        headers.add(DLQ_HEADER, "true");

        let key = dead_letter_key(envelope, Utc::now());
        self.publisher
            .send(&self.topic, &key, &headers, &payload)
            .await?;

        Ok(())
    }
}
