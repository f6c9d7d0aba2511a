//! Delivery actions.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppResult;
use herald_common::notification_log::NotificationLog;
use herald_common::types::Notification;

use crate::contracts::NotificationsProcessor;
use crate::mail::{MailMessage, MailTransport};

/// Sends the notification as an email to `user_email`.
pub struct EmailProcessor {
    transport: Arc<dyn MailTransport>,
    from: String,
}

impl EmailProcessor {
    pub fn new(transport: Arc<dyn MailTransport>, from: impl Into<String>) -> Self {
        Self {
            transport,
            from: from.into(),
        }
    }
}

#[async_trait]
impl NotificationsProcessor for EmailProcessor {
    async fn process(
        &self,
        _cancel: &CancellationToken,
        notification: &Notification,
    ) -> AppResult<()> {
        let message = MailMessage {
            from: self.from.clone(),
            to: vec![notification.user_email.clone()],
            subject: notification.subject.clone(),
            html: notification.body.clone(),
        };
        self.transport.send(&message).await?;
        tracing::info!(user_email = %notification.user_email, "Email sent");
        Ok(())
    }
}

/// Appends the notification to the recipient's durable log, where live
/// sessions pick it up.
pub struct StreamLogProcessor {
    log: Arc<dyn NotificationLog>,
}

impl StreamLogProcessor {
    pub fn new(log: Arc<dyn NotificationLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl NotificationsProcessor for StreamLogProcessor {
    async fn process(
        &self,
        _cancel: &CancellationToken,
        notification: &Notification,
    ) -> AppResult<()> {
        let payload = notification.to_json()?;
        let id = self.log.append(&notification.user_email, &payload).await?;
        tracing::debug!(
            user_email = %notification.user_email,
            entry_id = %id,
            "Notification appended to log"
        );
        Ok(())
    }
}

/// Logs the notification instead of delivering it.
pub struct ConsoleProcessor {
    name: String,
}

impl ConsoleProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationsProcessor for ConsoleProcessor {
    async fn process(
        &self,
        _cancel: &CancellationToken,
        notification: &Notification,
    ) -> AppResult<()> {
        tracing::info!(
            processor = %self.name,
            user_email = %notification.user_email,
            subject = %notification.subject,
            body = %notification.body,
            "Notification"
        );
        Ok(())
    }
}
