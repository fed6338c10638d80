//! Webhook notifications
//!
//! Posts a JSON payload describing the finished deployment to a
//! configured webhook. Delivery goes through the [`WebhookTransport`]
//! contract so the step logic can be tested without a network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::config::NotifySpec;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the notify step.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NotifyError {
    /// Notifications are enabled but no webhook URL is configured.
    #[error("notifications enabled but no webhook URL configured")]
    MissingWebhookUrl,

    /// The webhook answered with a non-success status.
    #[error("webhook rejected the notification with status {status}")]
    Rejected {
        /// HTTP status the webhook answered with.
        status: u16,
    },

    /// The request never produced an HTTP response.
    #[error("webhook delivery failed: {0}")]
    DeliveryFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<reqwest::Error> for NotifyError {
    fn from(source: reqwest::Error) -> Self {
        Self::DeliveryFailed(Box::new(source))
    }
}

/// Body posted to the webhook.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NotificationPayload {
    /// Human-readable deployment summary.
    pub text: String,
    /// Destination channel, omitted from the body when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// What the notify step did with the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The notify section is absent or disabled; nothing was sent.
    Skipped,
    /// The webhook accepted the payload.
    Delivered {
        /// HTTP status the webhook answered with.
        status: u16,
    },
}

/// Wire-level delivery contract, mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Post the payload to the URL and report the HTTP status.
    async fn deliver(&self, url: &str, payload: &NotificationPayload)
        -> Result<u16, NotifyError>;
}

/// [`WebhookTransport`] over a plain HTTP client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Transport with a bounded per-request timeout.
    pub fn new() -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn deliver(
        &self,
        url: &str,
        payload: &NotificationPayload,
    ) -> Result<u16, NotifyError> {
        let response = self.client.post(url).json(payload).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Sends the deployment summary when the spec asks for one.
pub struct Notifier {
    transport: Arc<dyn WebhookTransport>,
}

impl Notifier {
    /// Notifier over the given transport.
    pub fn new(transport: Arc<dyn WebhookTransport>) -> Self {
        Self { transport }
    }

    /// Deliver `text` per the notify section.
    ///
    /// An absent or disabled section is a successful no-op. An enabled
    /// section without a webhook URL is a configuration mistake and
    /// fails. Any status outside 2xx counts as a rejection.
    pub async fn send(
        &self,
        spec: Option<&NotifySpec>,
        text: &str,
    ) -> Result<Delivery, NotifyError> {
        let Some(spec) = spec.filter(|s| s.enabled) else {
            debug!("notifications disabled; skipping");
            return Ok(Delivery::Skipped);
        };
        if spec.webhook_url.is_empty() {
            return Err(NotifyError::MissingWebhookUrl);
        }

        let payload = NotificationPayload {
            text: text.to_string(),
            channel: spec.channel.clone(),
        };
        let status = self.transport.deliver(&spec.webhook_url, &payload).await?;
        if !(200..300).contains(&status) {
            return Err(NotifyError::Rejected { status });
        }

        info!(status, "notification delivered");
        Ok(Delivery::Delivered { status })
    }
}
