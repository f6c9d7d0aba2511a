//! Mail transport used by the email channel.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use herald_common::error::{AppError, AppResult};

/// An outgoing email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage) -> AppResult<()>;
}

/// Sends mail through an HTTP mail API (Resend-compatible `POST /emails`).
pub struct HttpMailTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpMailTransport {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build mail client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    async fn send(&self, message: &MailMessage) -> AppResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(message)
            .send()
            .await
            .map_err(|e| AppError::Mail(format!("Mail API request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Mail(format!(
                "Mail API responded with {}: {}",
                status, body
            )));
        }

        tracing::debug!(to = ?message.to, "Email accepted by mail API");
        Ok(())
    }
}
