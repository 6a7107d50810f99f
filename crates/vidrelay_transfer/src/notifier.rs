use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use vidrelay_contract::UserMessage;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification relay responded with status {0}")]
    Rejected(u16),
}

/// Delivers a short message to an end user. Transport is up to the
/// implementation.
#[async_trait]
pub trait UserNotifier: Send + Sync {
    async fn send_message(&self, recipient: &str, subject: &str, body: &str)
        -> Result<(), NotifyError>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl UserNotifier for LogNotifier {
    async fn send_message(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        info!(recipient = %recipient, subject = %subject, body = %body, "user notification");
        Ok(())
    }
}

/// Posts `{recipient, subject, body}` to a relay that owns mail delivery.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(http: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl UserNotifier for WebhookNotifier {
    async fn send_message(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let message = UserMessage {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        };
        let response = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(&message)
            .send()
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(response.status().as_u16()))
        }
    }
}
