//! Kafka plumbing shared by the DLQ services: publishing, the consumer group poll loop and
//! the claim handler diverting failed messages to the dead letter topic.

mod dlq;
mod error;
mod group;
mod handler;
mod headers;
mod kafka_group;
mod message;
mod publisher;
mod subscriber;
mod telemetry;

pub use dlq::{dead_letter_key, DlqHandlerAdapter};
pub use error::{ConsumeError, DlqError, PublishError};
pub use group::{ConsumerGroup, ConsumerGroupClaim, ConsumerGroupHandler, ConsumerGroupSession};
pub use handler::{DefaultConsumerGroupHandler, DlqHandler, EventHandler, TRANSACTION_KIND};
pub use headers::{MessageHeaders, DLQ_HEADER, ORIGIN_HEADER};
pub use kafka_group::{GroupContext, KafkaConsumerGroup};
pub use message::{DeadLetterQueueMessage, InboundMessage};
pub use publisher::{KafkaContext, KafkaPublisher, Publisher};
pub use subscriber::Subscriber;
pub use telemetry::{MetricsTracer, Tracer, Transaction, RESULT_SUCCESS};
