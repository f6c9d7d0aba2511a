use serde::{Deserialize, Serialize};

/// Field of a per-user log entry that carries the JSON-encoded notification.
pub const LOG_NOTIFICATION_FIELD: &str = "notification";

/// Cursor value meaning "read from the beginning of the log".
pub const LOG_ORIGIN_ID: &str = "0-0";

/// Key of the durable per-user notification log.
pub fn user_log_key(user_email: &str) -> String {
    format!("notifications:{}", user_email)
}

/// Key holding the id of the last log entry delivered to a user's live session.
pub fn user_cursor_key(user_email: &str) -> String {
    format!("last-readed-notification--{}", user_email)
}

/// A notification moving through a delivery channel.
///
/// The wire shape mixes snake_case and Go-style field names; both retry
/// bookkeeping fields are optional on first ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Addressing key for live sessions and transport delivery.
    pub user_email: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    /// Number of retries already performed. Only the retry engine touches it.
    #[serde(rename = "CurrentRetry", default)]
    pub current_retry: u32,
    /// Name of the channel that gave up on this notification.
    #[serde(rename = "Channel", default)]
    pub channel: String,
}

impl Notification {
    pub fn new(
        user_email: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            user_email: user_email.into(),
            subject: subject.into(),
            body: body.into(),
            current_retry: 0,
            channel: String::new(),
        }
    }

    pub fn from_json(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Envelope published to the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadNotification {
    pub notification: Notification,
    pub error: String,
}
