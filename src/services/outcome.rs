// src/services/outcome.rs

use async_trait::async_trait;
use lapin::{options::BasicPublishOptions, protocol::basic::AMQPProperties, Channel};
use tokio::sync::mpsc;
use tracing::debug;

use super::OutcomeSink;
use crate::data_model::OutcomeEvent;
use crate::error::{PipelineError, Result};

/// Publishes outcome events as persistent JSON messages on a durable queue.
#[derive(Clone)]
pub struct AmqpOutcomePublisher {
    channel: Channel,
    queue: String,
}

impl AmqpOutcomePublisher {
    /// The queue is expected to be declared already (see `setup_channels_and_queues`).
    pub fn new(channel: Channel, queue: impl Into<String>) -> Self {
        AmqpOutcomePublisher {
            channel,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl OutcomeSink for AmqpOutcomePublisher {
    async fn emit(&self, event: &OutcomeEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let confirm = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                AMQPProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into())
                    .with_message_id(event.dedup_key().into()),
            )
            .await?;
        confirm.await?;
        debug!(document_id = %event.document_id, state = %event.state, "Published outcome");
        Ok(())
    }
}

/// Delivers outcome events to an in-process receiver.
#[derive(Clone)]
pub struct ChannelOutcomeSink {
    sender: mpsc::UnboundedSender<OutcomeEvent>,
}

impl ChannelOutcomeSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutcomeEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelOutcomeSink { sender }, receiver)
    }
}

#[async_trait]
impl OutcomeSink for ChannelOutcomeSink {
    async fn emit(&self, event: &OutcomeEvent) -> Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| PipelineError::QueueError("outcome receiver dropped".to_string()))
    }
}
