use chrono::{DateTime, SecondsFormat, Utc};
use rdkafka::message::{BorrowedMessage, Message};
use serde::{Deserialize, Serialize};

use super::headers::{MessageHeaders, ORIGIN_HEADER};

/// A message read from a topic, owned so it can outlive the consumer poll that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    pub headers: MessageHeaders,
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundMessage {
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl From<&BorrowedMessage<'_>> for InboundMessage {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        let headers = message
            .headers()
            .map(MessageHeaders::from_kafka)
            .unwrap_or_default();

        InboundMessage {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned())
                .unwrap_or_default(),
            headers,
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
        }
    }
}

/// The envelope published to the dead letter topic when a message fails processing.
/// The original headers travel inside the body, not as broker headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterQueueMessage {
    pub channel: String,
    pub publisher: String,
    pub consumer: String,
    pub key: String,
    pub headers: MessageHeaders,
    pub message: String,
    pub caused_by: String,
    pub failed_consume_date: String,
}

impl DeadLetterQueueMessage {
    /// The failure date is the broker timestamp of the message, or now when it has none.
    pub fn from_failure(message: &InboundMessage, consumer: &str, cause: &str) -> Self {
        let failed_at = message.timestamp.unwrap_or_else(Utc::now);

        DeadLetterQueueMessage {
            channel: message.topic.clone(),
            publisher: message
                .headers
                .get(ORIGIN_HEADER)
                .unwrap_or_default()
                .to_owned(),
            consumer: consumer.to_owned(),
            key: message.key.clone(),
            headers: message.headers.clone(),
            message: message.payload_str().into_owned(),
            caused_by: cause.to_owned(),
            failed_consume_date: failed_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        }
    }
}
