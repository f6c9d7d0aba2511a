//! Dead-letter sinks.

use std::sync::Arc;

use async_trait::async_trait;

use herald_common::config::{AppConfig, DeadLetterMode};
use herald_common::error::{AppError, AppResult};
use herald_common::types::{DeadNotification, Notification};

use crate::broker::BrokerProducer;
use crate::contracts::DeadLetterSink;

/// Publishes `{"notification", "error"}` envelopes to a dead-letter topic.
pub struct BrokerDeadLetterSink {
    producer: Arc<dyn BrokerProducer>,
    topic: String,
}

impl BrokerDeadLetterSink {
    pub fn new(producer: Arc<dyn BrokerProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for BrokerDeadLetterSink {
    async fn process(&self, notification: &Notification, error: &AppError) -> AppResult<()> {
        let envelope = DeadNotification {
            notification: notification.clone(),
            error: error.to_string(),
        };
        let payload = serde_json::to_vec(&envelope)?;
        self.producer.send(&self.topic, &payload).await?;

        tracing::info!(
            topic = %self.topic,
            channel = %notification.channel,
            user_email = %notification.user_email,
            "Dead notification published"
        );
        Ok(())
    }
}

/// Logs dead notifications only.
pub struct ConsoleDeadLetterSink {
    name: String,
}

impl ConsoleDeadLetterSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DeadLetterSink for ConsoleDeadLetterSink {
    async fn process(&self, notification: &Notification, error: &AppError) -> AppResult<()> {
        tracing::warn!(
            sink = %self.name,
            channel = %notification.channel,
            user_email = %notification.user_email,
            current_retry = notification.current_retry,
            error = %error,
            "Dead notification"
        );
        Ok(())
    }
}

/// Sink selected by `DEAD_LETTER_SINK`.
pub fn dead_letter_sink_from_config(
    config: &AppConfig,
    producer: Arc<dyn BrokerProducer>,
) -> Arc<dyn DeadLetterSink> {
    match config.dead_letter_sink {
        DeadLetterMode::Broker => Arc::new(BrokerDeadLetterSink::new(
            producer,
            config.topic_dead_notifications.clone(),
        )),
        DeadLetterMode::Console => Arc::new(ConsoleDeadLetterSink::new("dead")),
    }
}
