//! Durable per-user notification log.
//!
//! Every user owns an append-only log (`notifications:<email>`) whose entries
//! carry a JSON-encoded [`Notification`](crate::types::Notification) under the
//! `notification` field, plus a cursor key holding the id of the last entry
//! delivered to that user's live session.
//!
//! Two backends are provided: Redis Streams (`XADD` / blocking `XREAD`) and an
//! in-process log used by tests and local runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::Client;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio::sync::Notify;

use crate::error::AppResult;
use crate::types::{LOG_NOTIFICATION_FIELD, user_cursor_key, user_log_key};

/// One entry of a user's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Identifier assigned by the log, used verbatim as cursor value.
    pub id: String,
    /// Raw `notification` field, `None` when the entry does not carry one.
    pub payload: Option<String>,
}

/// Storage side of the per-user log: appends and cursor bookkeeping.
#[async_trait]
pub trait NotificationLog: Send + Sync {
    /// Append a JSON payload to the user's log and return the assigned id.
    async fn append(&self, user_email: &str, payload: &str) -> AppResult<String>;

    /// Id of the last delivered entry, `None` when nothing was delivered yet.
    async fn read_cursor(&self, user_email: &str) -> AppResult<Option<String>>;

    async fn write_cursor(&self, user_email: &str, entry_id: &str) -> AppResult<()>;

    /// Open a reader dedicated to one user's log.
    ///
    /// Readers issue blocking reads, so they must not share a connection with
    /// other traffic.
    async fn open_reader(&self, user_email: &str) -> AppResult<Box<dyn LogReader>>;
}

/// Blocking reader over a single user's log.
#[async_trait]
pub trait LogReader: Send {
    /// Return the entries strictly after `after_id`, in log order, waiting up
    /// to `block` for at least one to arrive. An empty result means the wait
    /// timed out.
    async fn read_after(&mut self, after_id: &str, block: Duration) -> AppResult<Vec<LogEntry>>;
}

// ============================================================
// Redis Streams backend
// ============================================================

/// Redis-backed notification log.
#[derive(Clone)]
pub struct RedisNotificationLog {
    client: Client,
    manager: ConnectionManager,
}

impl RedisNotificationLog {
    pub fn new(client: Client, manager: ConnectionManager) -> Self {
        Self { client, manager }
    }
}

#[async_trait]
impl NotificationLog for RedisNotificationLog {
    async fn append(&self, user_email: &str, payload: &str) -> AppResult<String> {
        let mut conn = self.manager.clone();
        let id: String = conn
            .xadd(
                user_log_key(user_email),
                "*",
                &[(LOG_NOTIFICATION_FIELD, payload)],
            )
            .await?;
        Ok(id)
    }

    async fn read_cursor(&self, user_email: &str) -> AppResult<Option<String>> {
        let mut conn = self.manager.clone();
        let id: Option<String> = conn.get(user_cursor_key(user_email)).await?;
        Ok(id.filter(|id| !id.is_empty()))
    }

    async fn write_cursor(&self, user_email: &str, entry_id: &str) -> AppResult<()> {
        let mut conn = self.manager.clone();
        conn.set::<_, _, ()>(user_cursor_key(user_email), entry_id)
            .await?;
        Ok(())
    }

    async fn open_reader(&self, user_email: &str) -> AppResult<Box<dyn LogReader>> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(Box::new(RedisLogReader {
            conn,
            key: user_log_key(user_email),
        }))
    }
}

struct RedisLogReader {
    conn: MultiplexedConnection,
    key: String,
}

#[async_trait]
impl LogReader for RedisLogReader {
    async fn read_after(&mut self, after_id: &str, block: Duration) -> AppResult<Vec<LogEntry>> {
        // BLOCK 0 would wait forever.
        let block_ms = block.as_millis().max(1) as usize;
        let options = StreamReadOptions::default().block(block_ms);

        // A timed out XREAD answers nil.
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.key], &[after_id], &options)
            .await?;

        let entries = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|stream_id| LogEntry {
                        payload: stream_id.get::<String>(LOG_NOTIFICATION_FIELD),
                        id: stream_id.id,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(entries)
    }
}

// ============================================================
// In-process backend
// ============================================================

#[derive(Default)]
struct MemoryState {
    logs: HashMap<String, Vec<LogEntry>>,
    cursors: HashMap<String, String>,
    next_seq: u64,
}

#[derive(Default)]
struct MemoryShared {
    state: Mutex<MemoryState>,
    appended: Notify,
}

/// In-process notification log with the same id and blocking semantics as
/// the Redis backend.
#[derive(Clone, Default)]
pub struct MemoryNotificationLog {
    shared: Arc<MemoryShared>,
}

impl MemoryNotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry that may lack the `notification` field.
    pub fn append_entry(&self, user_email: &str, payload: Option<String>) -> String {
        let id = {
            let mut state = self.shared.state.lock();
            state.next_seq += 1;
            let id = format!("{}-0", state.next_seq);
            state
                .logs
                .entry(user_email.to_string())
                .or_default()
                .push(LogEntry {
                    id: id.clone(),
                    payload,
                });
            id
        };
        self.shared.appended.notify_waiters();
        id
    }

    /// Snapshot of a user's log.
    pub fn entries(&self, user_email: &str) -> Vec<LogEntry> {
        self.shared
            .state
            .lock()
            .logs
            .get(user_email)
            .cloned()
            .unwrap_or_default()
    }

    /// Current cursor without going through the async trait.
    pub fn cursor(&self, user_email: &str) -> Option<String> {
        self.shared.state.lock().cursors.get(user_email).cloned()
    }

    fn entries_after(&self, user_email: &str, after_id: &str) -> Vec<LogEntry> {
        let after = parse_entry_id(after_id);
        self.shared
            .state
            .lock()
            .logs
            .get(user_email)
            .map(|log| {
                log.iter()
                    .filter(|entry| parse_entry_id(&entry.id) > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Split a `<ms>-<seq>` stream id into a comparable tuple.
fn parse_entry_id(id: &str) -> (u64, u64) {
    let mut parts = id.splitn(2, '-');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}

#[async_trait]
impl NotificationLog for MemoryNotificationLog {
    async fn append(&self, user_email: &str, payload: &str) -> AppResult<String> {
        Ok(self.append_entry(user_email, Some(payload.to_string())))
    }

    async fn read_cursor(&self, user_email: &str) -> AppResult<Option<String>> {
        Ok(self.cursor(user_email))
    }

    async fn write_cursor(&self, user_email: &str, entry_id: &str) -> AppResult<()> {
        self.shared
            .state
            .lock()
            .cursors
            .insert(user_email.to_string(), entry_id.to_string());
        Ok(())
    }

    async fn open_reader(&self, user_email: &str) -> AppResult<Box<dyn LogReader>> {
        Ok(Box::new(MemoryLogReader {
            log: self.clone(),
            user_email: user_email.to_string(),
        }))
    }
}

struct MemoryLogReader {
    log: MemoryNotificationLog,
    user_email: String,
}

#[async_trait]
impl LogReader for MemoryLogReader {
    async fn read_after(&mut self, after_id: &str, block: Duration) -> AppResult<Vec<LogEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.log.shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.log.entries_after(&self.user_email, after_id);
            if !entries.is_empty() {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}
