//! In-memory doubles of the eventbus seams, used by the tests of every DLQ crate.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::error::KafkaError;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::eventbus::{
    ConsumeError, ConsumerGroup, ConsumerGroupClaim, ConsumerGroupHandler, ConsumerGroupSession,
    DeadLetterQueueMessage, DlqError, DlqHandler, EventHandler, InboundMessage, MessageHeaders,
    PublishError, Publisher, Tracer, Transaction,
};
use crate::spool::{DlqSpool, SpoolError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: String,
    pub headers: MessageHeaders,
    pub payload: Vec<u8>,
}

/// Publisher keeping what it was asked to send.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<PublishedRecord>>,
    closed: Mutex<bool>,
}

impl RecordingPublisher {
    pub fn closed() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            closed: Mutex::new(true),
        }
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        headers: &MessageHeaders,
        payload: &[u8],
    ) -> Result<(), PublishError> {
        if *self.closed.lock() {
            return Err(PublishError::Closed);
        }
        self.published.lock().push(PublishedRecord {
            topic: topic.to_owned(),
            key: key.to_owned(),
            headers: headers.clone(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        *self.closed.lock() = true;
        Ok(())
    }
}

/// Dead letter handler failing its first `failures` sends with a retryable error.
#[derive(Default)]
pub struct RecordingDlqHandler {
    failures: u32,
    attempts: AtomicU32,
    sent: Mutex<Vec<DeadLetterQueueMessage>>,
}

impl RecordingDlqHandler {
    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures,
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<DeadLetterQueueMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DlqHandler for RecordingDlqHandler {
    async fn send(&self, envelope: &DeadLetterQueueMessage) -> Result<(), DlqError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(DlqError::Publish(PublishError::Enqueue {
                topic: "dead-letter-queue".to_owned(),
                error: KafkaError::Canceled,
            }));
        }
        self.sent.lock().push(envelope.clone());
        Ok(())
    }
}

/// Event handler failing the messages whose key is listed.
#[derive(Default)]
pub struct ScriptedEventHandler {
    failing_keys: Vec<String>,
    cause: String,
    handled: Mutex<Vec<String>>,
}

impl ScriptedEventHandler {
    pub fn failing_keys(keys: &[&str], cause: &str) -> Self {
        Self {
            failing_keys: keys.iter().map(|key| key.to_string()).collect(),
            cause: cause.to_owned(),
            handled: Mutex::new(Vec::new()),
        }
    }

    pub fn handled_keys(&self) -> Vec<String> {
        self.handled.lock().clone()
    }
}

#[async_trait]
impl EventHandler for ScriptedEventHandler {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()> {
        self.handled.lock().push(message.key.clone());
        if self.failing_keys.contains(&message.key) {
            return Err(anyhow!("{}", self.cause));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSession {
    marked: Mutex<Vec<i64>>,
}

impl RecordingSession {
    pub fn marked_offsets(&self) -> Vec<i64> {
        self.marked.lock().clone()
    }
}

impl ConsumerGroupSession for RecordingSession {
    fn member_id(&self) -> &str {
        "test-member"
    }

    fn generation_id(&self) -> u64 {
        1
    }

    fn mark_message(&self, message: &InboundMessage) -> Result<(), ConsumeError> {
        self.marked.lock().push(message.offset);
        Ok(())
    }
}

/// A claim already holding `messages`, closed once they are read.
pub fn claim_from(messages: Vec<InboundMessage>) -> ConsumerGroupClaim {
    let (topic, partition) = messages
        .first()
        .map(|message| (message.topic.clone(), message.partition))
        .unwrap_or_default();
    let (tx, rx) = mpsc::channel(messages.len().max(1));
    for message in messages {
        tx.try_send(message).expect("claim buffer sized for every message");
    }
    ConsumerGroupClaim::new(topic, partition, rx)
}

/// Drains claims without looking at the messages.
pub struct NoopGroupHandler;

#[async_trait]
impl ConsumerGroupHandler for NoopGroupHandler {
    async fn consume_claim(
        &self,
        _session: &dyn ConsumerGroupSession,
        mut claim: ConsumerGroupClaim,
    ) -> Result<(), ConsumeError> {
        while claim.next().await.is_some() {}
        Ok(())
    }
}

/// Consumer group whose generations last until close, after failing `failures` times.
#[derive(Default)]
pub struct MockConsumerGroup {
    failures: AtomicUsize,
    fail_close: bool,
    consume_calls: AtomicUsize,
    close_calls: AtomicUsize,
    consumed: Notify,
    closed: CancellationToken,
}

impl MockConsumerGroup {
    pub fn failing_consumes(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Default::default()
        }
    }

    pub fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub async fn wait_for_consumes(&self, calls: usize) {
        loop {
            let consumed = self.consumed.notified();
            if self.consume_calls() >= calls {
                return;
            }
            consumed.await;
        }
    }
}

#[async_trait]
impl ConsumerGroup for MockConsumerGroup {
    async fn consume(
        &self,
        _topics: &[String],
        _handler: Arc<dyn ConsumerGroupHandler>,
    ) -> Result<(), ConsumeError> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        self.consumed.notify_waiters();

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            tokio::task::yield_now().await;
            return Err(ConsumeError::Kafka(KafkaError::Canceled));
        }

        self.closed.cancelled().await;
        Ok(())
    }

    fn errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumeError>> {
        None
    }

    async fn close(&self) -> Result<(), ConsumeError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        if self.fail_close {
            return Err(ConsumeError::Closed);
        }
        Ok(())
    }
}

/// Spool keeping envelopes in memory.
#[derive(Default)]
pub struct MemorySpool {
    spooled: Mutex<Vec<DeadLetterQueueMessage>>,
}

impl MemorySpool {
    pub fn spooled(&self) -> Vec<DeadLetterQueueMessage> {
        self.spooled.lock().clone()
    }
}

#[async_trait]
impl DlqSpool for MemorySpool {
    async fn append(&self, envelope: &DeadLetterQueueMessage) -> Result<(), SpoolError> {
        self.spooled.lock().push(envelope.clone());
        Ok(())
    }
}

/// Tracer recording `(name, result)` of every finished transaction.
#[derive(Default)]
pub struct RecordingTracer {
    finished: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingTracer {
    pub fn transactions(&self) -> Vec<(String, String)> {
        self.finished.lock().clone()
    }
}

impl Tracer for RecordingTracer {
    fn start_transaction(&self, name: &str, _kind: &str) -> Box<dyn Transaction> {
        Box::new(RecordingTransaction {
            name: name.to_owned(),
            result: String::new(),
            finished: self.finished.clone(),
        })
    }
}

struct RecordingTransaction {
    name: String,
    result: String,
    finished: Arc<Mutex<Vec<(String, String)>>>,
}

impl Transaction for RecordingTransaction {
    fn set_result(&mut self, result: &str) {
        self.result = result.to_owned();
    }
}

impl Drop for RecordingTransaction {
    fn drop(&mut self) {
        self.finished
            .lock()
            .push((self.name.clone(), std::mem::take(&mut self.result)));
    }
}
