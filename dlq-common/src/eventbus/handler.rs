use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{error, info, warn, Instrument};

use super::error::{ConsumeError, DlqError};
use super::group::{ConsumerGroupClaim, ConsumerGroupHandler, ConsumerGroupSession};
use super::message::{DeadLetterQueueMessage, InboundMessage};
use super::telemetry::{Tracer, RESULT_SUCCESS};
use crate::metrics::{
    DLQ_MESSAGES_DROPPED, DLQ_MESSAGES_LOST, DLQ_MESSAGES_SENT, DLQ_MESSAGES_SPOOLED,
    DLQ_SEND_RETRIES, EVENTBUS_MESSAGES_PROCESSED,
};
use crate::retry::RetryPolicy;
use crate::spool::DlqSpool;

pub const TRANSACTION_KIND: &str = "Kafka Consumer";

/// Business logic applied to every consumed message. An error diverts the message to the
/// dead letter handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()>;
}

/// Destination of messages that failed processing.
#[async_trait]
pub trait DlqHandler: Send + Sync {
    async fn send(&self, envelope: &DeadLetterQueueMessage) -> Result<(), DlqError>;
}

/// Claim handler dispatching each message to the event handler, diverting failures to the
/// dead letter handler, and acknowledging every message exactly once afterwards.
pub struct DefaultConsumerGroupHandler {
    service_name: String,
    tracer: Arc<dyn Tracer>,
    event_handler: Option<Arc<dyn EventHandler>>,
    dlq_handler: Option<Arc<dyn DlqHandler>>,
    dlq_retry: RetryPolicy,
    dlq_max_attempts: u32,
    spool: Option<Arc<dyn DlqSpool>>,
}

impl DefaultConsumerGroupHandler {
    pub fn new(service_name: &str, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            service_name: service_name.to_owned(),
            tracer,
            event_handler: None,
            dlq_handler: None,
            dlq_retry: RetryPolicy::default(),
            dlq_max_attempts: 1,
            spool: None,
        }
    }

    pub fn with_event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(event_handler);
        self
    }

    pub fn with_dlq_handler(mut self, dlq_handler: Arc<dyn DlqHandler>) -> Self {
        self.dlq_handler = Some(dlq_handler);
        self
    }

    /// Retry failed dead letter sends, `max_attempts` counts the first try.
    pub fn with_dlq_retry(mut self, policy: RetryPolicy, max_attempts: u32) -> Self {
        self.dlq_retry = policy;
        self.dlq_max_attempts = max_attempts.max(1);
        self
    }

    /// Where dead letters go when every send attempt failed.
    pub fn with_spool(mut self, spool: Arc<dyn DlqSpool>) -> Self {
        self.spool = Some(spool);
        self
    }

    async fn process(&self, message: &InboundMessage) {
        let mut transaction = self
            .tracer
            .start_transaction(&format!("On Event: {}", message.topic), TRANSACTION_KIND);

        let Some(event_handler) = &self.event_handler else {
            info!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                key = %message.key,
                payload = %message.payload_str(),
                "message consumed without an event handler"
            );
            transaction.set_result(RESULT_SUCCESS);
            return;
        };

        let handled = event_handler
            .handle(message)
            .instrument(transaction.span())
            .await;

        match handled {
            Ok(()) => {
                counter!(
                    EVENTBUS_MESSAGES_PROCESSED,
                    "topic" => message.topic.clone(),
                    "outcome" => "success"
                )
                .increment(1);
                transaction.set_result(RESULT_SUCCESS);
            }
            Err(error) => {
                counter!(
                    EVENTBUS_MESSAGES_PROCESSED,
                    "topic" => message.topic.clone(),
                    "outcome" => "failure"
                )
                .increment(1);
                let cause = error.to_string();
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "event handler failed: {}",
                    cause
                );
                self.divert(message, &cause).await;
                transaction.set_result(&cause);
            }
        }
    }

    async fn divert(&self, message: &InboundMessage, cause: &str) {
        let Some(dlq_handler) = &self.dlq_handler else {
            counter!(DLQ_MESSAGES_DROPPED, "topic" => message.topic.clone()).increment(1);
            warn!(
                topic = %message.topic,
                offset = message.offset,
                "no dead letter handler registered, dropping failed message"
            );
            return;
        };

        let envelope = DeadLetterQueueMessage::from_failure(message, &self.service_name, cause);

        let mut attempt: u32 = 0;
        loop {
            let error = match dlq_handler.send(&envelope).await {
                Ok(()) => {
                    counter!(DLQ_MESSAGES_SENT, "topic" => envelope.channel.clone()).increment(1);
                    return;
                }
                Err(error) => error,
            };
            attempt += 1;

            if !error.is_retryable() || attempt >= self.dlq_max_attempts {
                error!(
                    topic = %envelope.channel,
                    key = %envelope.key,
                    attempt,
                    "failed to send dead letter message: {}",
                    error
                );
                break;
            }

            let delay = self.dlq_retry.time_until_next_retry(attempt - 1);
            counter!(DLQ_SEND_RETRIES).increment(1);
            warn!(
                attempt,
                "retrying dead letter send in {:?}: {}", delay, error
            );
            tokio::time::sleep(delay).await;
        }

        self.escalate(&envelope).await;
    }

    async fn escalate(&self, envelope: &DeadLetterQueueMessage) {
        let Some(spool) = &self.spool else {
            counter!(DLQ_MESSAGES_LOST, "topic" => envelope.channel.clone()).increment(1);
            error!(
                topic = %envelope.channel,
                key = %envelope.key,
                caused_by = %envelope.caused_by,
                "dead letter message lost, no spool configured"
            );
            return;
        };

        match spool.append(envelope).await {
            Ok(()) => {
                counter!(DLQ_MESSAGES_SPOOLED, "topic" => envelope.channel.clone()).increment(1);
                warn!(
                    topic = %envelope.channel,
                    key = %envelope.key,
                    "dead letter message spooled locally"
                );
            }
            Err(error) => {
                counter!(DLQ_MESSAGES_LOST, "topic" => envelope.channel.clone()).increment(1);
                error!(
                    topic = %envelope.channel,
                    key = %envelope.key,
                    caused_by = %envelope.caused_by,
                    "dead letter message lost, spool failed: {}",
                    error
                );
            }
        }
    }
}

#[async_trait]
impl ConsumerGroupHandler for DefaultConsumerGroupHandler {
    async fn setup(&self, session: &dyn ConsumerGroupSession) -> Result<(), ConsumeError> {
        info!(
            member_id = session.member_id(),
            generation_id = session.generation_id(),
            "consumer group session started"
        );
        Ok(())
    }

    async fn cleanup(&self, session: &dyn ConsumerGroupSession) -> Result<(), ConsumeError> {
        info!(
            member_id = session.member_id(),
            generation_id = session.generation_id(),
            "consumer group session ended"
        );
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: &dyn ConsumerGroupSession,
        mut claim: ConsumerGroupClaim,
    ) -> Result<(), ConsumeError> {
        info!(
            topic = claim.topic(),
            partition = claim.partition(),
            "claim started"
        );

        while let Some(message) = claim.next().await {
            self.process(&message).await;

            if let Err(error) = session.mark_message(&message) {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "failed to mark message: {}",
                    error
                );
            }
        }

        info!(
            topic = claim.topic(),
            partition = claim.partition(),
            "claim finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::eventbus::headers::ORIGIN_HEADER;
    use crate::test_utils::{
        claim_from, MemorySpool, RecordingDlqHandler, RecordingSession, RecordingTracer,
        ScriptedEventHandler,
    };
    use std::time::Duration;

    fn message(offset: i64, key: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            topic: "orders".to_string(),
            partition: 0,
            offset,
            key: key.to_string(),
            headers: [(ORIGIN_HEADER, "svc-a")].into_iter().collect(),
            payload: payload.as_bytes().to_vec(),
            timestamp: None,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn test_every_message_is_marked_once() {
        let events = Arc::new(ScriptedEventHandler::failing_keys(&["o2"], "timeout"));
        let dlq = Arc::new(RecordingDlqHandler::default());
        let handler =
            DefaultConsumerGroupHandler::new("svc-b", Arc::new(RecordingTracer::default()))
                .with_event_handler(events.clone())
                .with_dlq_handler(dlq.clone());
        let session = RecordingSession::default();

        let messages = vec![
            message(10, "o1", "{}"),
            message(11, "o2", "{}"),
            message(12, "o3", "{}"),
        ];
        handler
            .consume_claim(&session, claim_from(messages))
            .await
            .unwrap();

        assert_eq!(session.marked_offsets(), vec![10, 11, 12]);
        assert_eq!(events.handled_keys(), vec!["o1", "o2", "o3"]);
        assert_eq!(dlq.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_message_envelope() {
        let events = Arc::new(ScriptedEventHandler::failing_keys(&["o1"], "timeout"));
        let dlq = Arc::new(RecordingDlqHandler::default());
        let tracer = Arc::new(RecordingTracer::default());
        let handler = DefaultConsumerGroupHandler::new("svc-b", tracer.clone())
            .with_event_handler(events)
            .with_dlq_handler(dlq.clone());
        let session = RecordingSession::default();

        let mut failed = message(3, "o1", r#"{"id":"o1"}"#);
        failed.timestamp = Some(Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap());
        handler
            .consume_claim(&session, claim_from(vec![failed.clone()]))
            .await
            .unwrap();

        let sent = dlq.sent();
        assert_eq!(sent.len(), 1);
        let envelope = &sent[0];
        assert_eq!(envelope.channel, "orders");
        assert_eq!(envelope.publisher, "svc-a");
        assert_eq!(envelope.consumer, "svc-b");
        assert_eq!(envelope.key, "o1");
        assert_eq!(envelope.headers, failed.headers);
        assert_eq!(envelope.message, r#"{"id":"o1"}"#);
        assert_eq!(envelope.caused_by, "timeout");
        assert_eq!(envelope.failed_consume_date, "2020-01-02T03:04:05.000000000Z");

        assert_eq!(
            tracer.transactions(),
            vec![("On Event: orders".to_string(), "timeout".to_string())]
        );
        assert_eq!(session.marked_offsets(), vec![3]);
    }

    #[tokio::test]
    async fn test_failure_without_dlq_handler_is_still_marked() {
        let events = Arc::new(ScriptedEventHandler::failing_keys(&["o1"], "boom"));
        let spool = Arc::new(MemorySpool::default());
        let handler =
            DefaultConsumerGroupHandler::new("svc-b", Arc::new(RecordingTracer::default()))
                .with_event_handler(events)
                .with_spool(spool.clone());
        let session = RecordingSession::default();

        handler
            .consume_claim(&session, claim_from(vec![message(0, "o1", "{}")]))
            .await
            .unwrap();

        assert_eq!(session.marked_offsets(), vec![0]);
        assert!(spool.spooled().is_empty());
    }

    #[tokio::test]
    async fn test_no_event_handler_is_success() {
        let tracer = Arc::new(RecordingTracer::default());
        let dlq = Arc::new(RecordingDlqHandler::default());
        let handler =
            DefaultConsumerGroupHandler::new("svc-b", tracer.clone()).with_dlq_handler(dlq.clone());
        let session = RecordingSession::default();

        handler
            .consume_claim(&session, claim_from(vec![message(5, "o1", "not json")]))
            .await
            .unwrap();

        assert!(dlq.sent().is_empty());
        assert_eq!(session.marked_offsets(), vec![5]);
        assert_eq!(
            tracer.transactions(),
            vec![("On Event: orders".to_string(), RESULT_SUCCESS.to_string())]
        );
    }

    #[tokio::test]
    async fn test_dlq_send_is_retried() {
        let events = Arc::new(ScriptedEventHandler::failing_keys(&["o1"], "timeout"));
        let dlq = Arc::new(RecordingDlqHandler::failing_first(2));
        let spool = Arc::new(MemorySpool::default());
        let handler =
            DefaultConsumerGroupHandler::new("svc-b", Arc::new(RecordingTracer::default()))
                .with_event_handler(events)
                .with_dlq_handler(dlq.clone())
                .with_dlq_retry(fast_retry(), 3)
                .with_spool(spool.clone());
        let session = RecordingSession::default();

        handler
            .consume_claim(&session, claim_from(vec![message(0, "o1", "{}")]))
            .await
            .unwrap();

        assert_eq!(dlq.attempts(), 3);
        assert_eq!(dlq.sent().len(), 1);
        assert!(spool.spooled().is_empty());
        assert_eq!(session.marked_offsets(), vec![0]);
    }

    #[tokio::test]
    async fn test_exhausted_dlq_send_is_spooled() {
        let events = Arc::new(ScriptedEventHandler::failing_keys(&["o1"], "timeout"));
        let dlq = Arc::new(RecordingDlqHandler::failing_first(u32::MAX));
        let spool = Arc::new(MemorySpool::default());
        let handler =
            DefaultConsumerGroupHandler::new("svc-b", Arc::new(RecordingTracer::default()))
                .with_event_handler(events)
                .with_dlq_handler(dlq.clone())
                .with_dlq_retry(fast_retry(), 2)
                .with_spool(spool.clone());
        let session = RecordingSession::default();

        handler
            .consume_claim(&session, claim_from(vec![message(7, "o1", "{}")]))
            .await
            .unwrap();

        assert_eq!(dlq.attempts(), 2);
        let spooled = spool.spooled();
        assert_eq!(spooled.len(), 1);
        assert_eq!(spooled[0].key, "o1");
        assert_eq!(spooled[0].caused_by, "timeout");
        assert_eq!(session.marked_offsets(), vec![7]);
    }

    #[tokio::test]
    async fn test_exhausted_dlq_send_without_spool_still_marks() {
        let events = Arc::new(ScriptedEventHandler::failing_keys(&["o1"], "timeout"));
        let dlq = Arc::new(RecordingDlqHandler::failing_first(u32::MAX));
        let handler =
            DefaultConsumerGroupHandler::new("svc-b", Arc::new(RecordingTracer::default()))
                .with_event_handler(events)
                .with_dlq_handler(dlq.clone())
                .with_dlq_retry(fast_retry(), 2);
        let session = RecordingSession::default();

        handler
            .consume_claim(&session, claim_from(vec![message(8, "o1", "{}")]))
            .await
            .unwrap();

        assert_eq!(dlq.attempts(), 2);
        assert_eq!(session.marked_offsets(), vec![8]);
    }
}
