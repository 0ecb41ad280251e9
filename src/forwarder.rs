use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ForwarderSettings;
use crate::types::MailItem;

#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    /// Worth retrying: timeouts, 5xx, 429.
    #[error("transient forwarding failure: {0}")]
    Transient(String),
    /// The sink refused the item; retrying will not help.
    #[error("permanent forwarding failure: {0}")]
    Permanent(String),
}

/// Downstream consumer of synchronized messages. Must be idempotent on the
/// message id, since delivery is at-least-once.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, item: &MailItem) -> Result<(), ForwardError>;
}

#[derive(Debug, Serialize)]
struct ForwardPayload<'a> {
    message_id: &'a str,
    #[serde(flatten)]
    message: &'a MailItem,
}

/// POSTs each item as JSON to a configured endpoint.
pub struct HttpForwarder {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        settings: &ForwarderSettings,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }
}

fn classify(status: StatusCode, body: &str) -> ForwardError {
    let reason = format!("{} {}", status.as_u16(), body.chars().take(200).collect::<String>());
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ForwardError::Transient(reason)
    } else {
        ForwardError::Permanent(reason)
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, item: &MailItem) -> Result<(), ForwardError> {
        let payload = ForwardPayload {
            message_id: &item.id,
            message: item,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header("Idempotency-Key", format!("{}:{}", item.account_id, item.id))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ForwardError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(message_id = %item.id, "message forwarded");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}

/// Used when no endpoint is configured: items are only logged.
pub struct LogForwarder;

#[async_trait]
impl Forwarder for LogForwarder {
    async fn forward(&self, item: &MailItem) -> Result<(), ForwardError> {
        info!(
            account_id = %item.account_id,
            message_id = %item.id,
            subject = item.subject.as_deref().unwrap_or(""),
            "new message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeKind;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, ""),
            ForwardError::Transient(_)
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, ""),
            ForwardError::Transient(_)
        ));
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, "bad field"),
            ForwardError::Permanent(_)
        ));
    }

    #[test]
    fn payload_flattens_the_message() {
        let item = MailItem {
            id: "m1".to_string(),
            account_id: "a1".into(),
            folder: "inbox".to_string(),
            change: ChangeKind::Upserted,
            internet_message_id: None,
            subject: Some("Hi".to_string()),
            sender_address: None,
            sender_name: None,
            recipients: vec![],
            body_preview: None,
            importance: None,
            is_read: false,
            has_attachments: false,
            received_at: None,
            sent_at: None,
        };
        let payload = ForwardPayload {
            message_id: &item.id,
            message: &item,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["message_id"], "m1");
        assert_eq!(json["subject"], "Hi");
        assert_eq!(json["account_id"], "a1");
        assert_eq!(json["change"], "upserted");
    }
}
