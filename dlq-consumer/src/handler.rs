use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use dlq_common::eventbus::{EventHandler, InboundMessage};

/// Accepts messages whose payload is a JSON object. Anything else fails and is diverted
/// to the dead letter topic.
pub struct JsonObjectHandler;

#[async_trait]
impl EventHandler for JsonObjectHandler {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()> {
        let value: Value =
            serde_json::from_slice(&message.payload).context("payload is not valid JSON")?;
        let object = value
            .as_object()
            .ok_or_else(|| anyhow!("payload is not a JSON object"))?;

        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            key = %message.key,
            fields = object.len(),
            "message processed"
        );
        Ok(())
    }
}
