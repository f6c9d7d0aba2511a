//! Message broker abstraction.
//!
//! Topics are Redis Streams read through a consumer group: every message is
//! acknowledged before it is handed to the handler, so a crash while a
//! notification is being retried loses it rather than replaying it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisResult};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::error::{AppError, AppResult};

/// Stream field carrying the message payload.
pub const BROKER_PAYLOAD_FIELD: &str = "payload";

/// Messages fetched per read.
const READ_BATCH: usize = 32;

/// A message consumed from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub id: String,
    pub payload: Vec<u8>,
}

/// Invoked for every consumed message.
pub type MessageHandler<'a> = dyn Fn(BrokerMessage) + Send + Sync + 'a;

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Consume `topics` until `cancel` fires or the session fails.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &MessageHandler<'_>,
    ) -> AppResult<()>;
}

#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn send(&self, topic: &str, payload: &[u8]) -> AppResult<()>;
}

// ============================================================
// Redis Streams broker
// ============================================================

/// Broker backed by Redis Streams consumer groups.
#[derive(Clone)]
pub struct RedisStreamsBroker {
    client: Client,
    manager: ConnectionManager,
    group: String,
    consumer: String,
    block: Duration,
}

impl RedisStreamsBroker {
    pub fn new(client: Client, manager: ConnectionManager, group: &str, block: Duration) -> Self {
        Self {
            client,
            manager,
            group: group.to_string(),
            consumer: format!("{}-{}", group, Uuid::new_v4().simple()),
            block,
        }
    }

    /// Create the consumer group on `topic`, reading from the oldest entry.
    async fn ensure_group(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        topic: &str,
    ) -> AppResult<()> {
        let result: RedisResult<()> = conn.xgroup_create_mkstream(topic, &self.group, "0").await;

        match result {
            Ok(()) => {
                tracing::info!(topic, group = %self.group, "Created consumer group");
                Ok(())
            }
            // BUSYGROUP: the group already exists
            Err(e) if e.code() == Some("BUSYGROUP") || e.to_string().contains("BUSYGROUP") => {
                Ok(())
            }
            Err(e) => Err(AppError::Broker(format!(
                "can't create consumer group {} on {}: {}",
                self.group, topic, e
            ))),
        }
    }
}

#[async_trait]
impl BrokerConsumer for RedisStreamsBroker {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &MessageHandler<'_>,
    ) -> AppResult<()> {
        // Blocking reads get their own connection.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        for topic in topics {
            self.ensure_group(&mut conn, topic).await?;
        }

        let ids = vec![">"; topics.len()];
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_BATCH)
            .block(self.block.as_millis().max(1) as usize);

        loop {
            let reply: RedisResult<Option<StreamReadReply>> = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                reply = conn.xread_options(topics, &ids[..], &options) => reply,
            };

            let Some(reply) =
                reply.map_err(|e| AppError::Broker(format!("group read failed: {}", e)))?
            else {
                continue;
            };

            for key in reply.keys {
                for stream_id in key.ids {
                    let _: i64 = conn.xack(&key.key, &self.group, &[&stream_id.id]).await?;

                    let payload = stream_id
                        .get::<Vec<u8>>(BROKER_PAYLOAD_FIELD)
                        .unwrap_or_default();
                    handler(BrokerMessage {
                        topic: key.key.clone(),
                        id: stream_id.id,
                        payload,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl BrokerProducer for RedisStreamsBroker {
    async fn send(&self, topic: &str, payload: &[u8]) -> AppResult<()> {
        let mut conn = self.manager.clone();
        let id: String = conn
            .xadd(topic, "*", &[(BROKER_PAYLOAD_FIELD, payload)])
            .await?;
        tracing::debug!(topic, id = %id, "Message published");
        Ok(())
    }
}

// ============================================================
// In-process broker
// ============================================================

#[derive(Default)]
struct MemoryBrokerShared {
    topics: Mutex<HashMap<String, VecDeque<BrokerMessage>>>,
    published: Notify,
    next_id: Mutex<u64>,
}

/// In-process broker. Consumers of the same topic compete for messages, like
/// members of one consumer group.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<MemoryBrokerShared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published to `topic` and not consumed yet.
    pub fn pending(&self, topic: &str) -> Vec<BrokerMessage> {
        self.shared
            .topics
            .lock()
            .get(topic)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn pop(&self, topics: &[String]) -> Option<BrokerMessage> {
        let mut all = self.shared.topics.lock();
        topics
            .iter()
            .find_map(|topic| all.get_mut(topic).and_then(|queue| queue.pop_front()))
    }
}

#[async_trait]
impl BrokerConsumer for MemoryBroker {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &MessageHandler<'_>,
    ) -> AppResult<()> {
        loop {
            let published = self.shared.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            while let Some(message) = self.pop(topics) {
                handler(message);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = &mut published => {}
            }
        }
    }
}

#[async_trait]
impl BrokerProducer for MemoryBroker {
    async fn send(&self, topic: &str, payload: &[u8]) -> AppResult<()> {
        let id = {
            let mut next = self.shared.next_id.lock();
            *next += 1;
            format!("{}-0", *next)
        };
        self.shared
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push_back(BrokerMessage {
                topic: topic.to_string(),
                id,
                payload: payload.to_vec(),
            });
        self.shared.published.notify_waiters();
        Ok(())
    }
}
