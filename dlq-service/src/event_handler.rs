use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use dlq_common::eventbus::{DeadLetterQueueMessage, EventHandler, InboundMessage};

use crate::usecase::DlqUsecase;

/// Persists every envelope consumed from the dead letter topic.
pub struct DlqEventHandler {
    usecase: Arc<DlqUsecase>,
}

impl DlqEventHandler {
    pub fn new(usecase: Arc<DlqUsecase>) -> Self {
        Self { usecase }
    }
}

#[async_trait]
impl EventHandler for DlqEventHandler {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()> {
        let envelope: DeadLetterQueueMessage = serde_json::from_slice(&message.payload)
            .context("payload is not a dead letter envelope")?;
        let record = self.usecase.add(envelope).await?;

        debug!(id = %record.id, channel = %record.message.channel, "dead letter stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};

    use dlq_common::eventbus::{
        ConsumerGroupHandler, DefaultConsumerGroupHandler, DlqHandlerAdapter, MessageHeaders,
        DLQ_HEADER, ORIGIN_HEADER,
    };
    use dlq_common::test_utils::{
        claim_from, RecordingPublisher, RecordingSession, RecordingTracer, ScriptedEventHandler,
    };

    use crate::store::{MemoryMessageStore, MessageStore};

    fn dead_letter(offset: i64, payload: &str) -> InboundMessage {
        InboundMessage {
            topic: "dead-letter-queue".to_string(),
            partition: 0,
            offset,
            key: format!("svc-b:orders:o{offset}:1"),
            headers: [(DLQ_HEADER, "true")].into_iter().collect(),
            payload: payload.as_bytes().to_vec(),
            timestamp: None,
        }
    }

    const ENVELOPE: &str = r#"{
        "channel": "orders",
        "publisher": "svc-a",
        "consumer": "svc-b",
        "key": "o1",
        "headers": {"origin": "svc-a"},
        "message": "{\"id\":\"o1\"}",
        "causedBy": "timeout",
        "failedConsumeDate": "2024-01-01T00:00:00.000000000Z"
    }"#;

    #[tokio::test]
    async fn test_envelopes_are_stored() {
        let store = Arc::new(MemoryMessageStore::default());
        let usecase = Arc::new(DlqUsecase::new(
            store.clone(),
            Arc::new(RecordingPublisher::default()),
        ));
        let handler = DefaultConsumerGroupHandler::new(
            "dlq-service",
            Arc::new(RecordingTracer::default()),
        )
        .with_event_handler(Arc::new(DlqEventHandler::new(usecase)));
        let session = RecordingSession::default();

        handler
            .consume_claim(
                &session,
                claim_from(vec![dead_letter(4, ENVELOPE), dead_letter(5, "garbage")]),
            )
            .await
            .unwrap();

        assert_eq!(session.marked_offsets(), vec![4, 5]);

        let stored = store.find_many(10, 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        let message = &stored[0].message;
        assert_eq!(message.channel, "orders");
        assert_eq!(message.key, "o1");
        assert_eq!(message.caused_by, "timeout");
        assert_eq!(
            message.headers,
            [("origin", "svc-a")].into_iter().collect::<MessageHeaders>()
        );
    }

    #[tokio::test]
    async fn test_failed_message_round_trips_to_its_channel() {
        let original = InboundMessage {
            topic: "orders".to_string(),
            partition: 2,
            offset: 41,
            key: "o1".to_string(),
            headers: [(ORIGIN_HEADER, "svc-a"), ("trace", "t-1")]
                .into_iter()
                .collect(),
            payload: br#"{"id":"o1","total":12}"#.to_vec(),
            timestamp: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()),
        };

        // svc-b fails the message and diverts it to the dead letter topic
        let dead_letters = Arc::new(RecordingPublisher::default());
        let events = Arc::new(ScriptedEventHandler::failing_keys(&["o1"], "timeout"));
        let tracer = Arc::new(RecordingTracer::default());
        let consumer = DefaultConsumerGroupHandler::new("svc-b", tracer)
            .with_event_handler(events)
            .with_dlq_handler(Arc::new(DlqHandlerAdapter::new(
                "dead-letter-queue",
                dead_letters.clone(),
            )));
        consumer
            .consume_claim(&RecordingSession::default(), claim_from(vec![original.clone()]))
            .await
            .unwrap();

        let published = dead_letters.published();
        assert_eq!(published.len(), 1);
        let dead_letter = InboundMessage {
            topic: published[0].topic.clone(),
            partition: 0,
            offset: 0,
            key: published[0].key.clone(),
            headers: published[0].headers.clone(),
            payload: published[0].payload.clone(),
            timestamp: None,
        };

        // The dlq service stores it, then an operator republishes it
        let republished = Arc::new(RecordingPublisher::default());
        let usecase = Arc::new(DlqUsecase::new(
            Arc::new(MemoryMessageStore::default()),
            republished.clone(),
        ));
        DlqEventHandler::new(usecase.clone())
            .handle(&dead_letter)
            .await
            .unwrap();

        let stored = usecase.get_many(1, 10).await.unwrap().records;
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored[0].message.failed_consume_date,
            "2024-03-01T12:30:00.000000000Z"
        );
        usecase.republish(&stored[0].id.to_string()).await.unwrap();

        let restored = republished.published();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].topic, original.topic);
        assert_eq!(restored[0].key, original.key);
        assert_eq!(restored[0].headers, original.headers);
        assert_eq!(restored[0].payload, original.payload);
    }
}
