use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AccountId, ChangeKind, MailItem};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email_address: Option<EmailAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemovedMarker {
    pub reason: Option<String>,
}

/// A message entry of a delta response. Deleted entries carry only the id
/// and `@removed`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMessage {
    pub id: String,
    pub internet_message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<Recipient>,
    pub to_recipients: Option<Vec<Recipient>>,
    pub body_preview: Option<String>,
    pub importance: Option<String>,
    pub is_read: Option<bool>,
    pub has_attachments: Option<bool>,
    pub received_date_time: Option<DateTime<Utc>>,
    pub sent_date_time: Option<DateTime<Utc>>,
    #[serde(rename = "@removed")]
    pub removed: Option<RemovedMarker>,
}

impl GraphMessage {
    pub fn is_removed(&self) -> bool {
        self.removed.is_some()
    }

    pub fn into_mail_item(self, account_id: &AccountId, folder: &str) -> MailItem {
        let change = if self.is_removed() {
            ChangeKind::Removed
        } else {
            ChangeKind::Upserted
        };
        let sender = self.from.and_then(|f| f.email_address);
        let recipients = self
            .to_recipients
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| r.email_address.and_then(|e| e.address))
            .collect();

        MailItem {
            id: self.id,
            account_id: account_id.clone(),
            folder: folder.to_string(),
            change,
            internet_message_id: self.internet_message_id,
            subject: self.subject,
            sender_address: sender.as_ref().and_then(|s| s.address.clone()),
            sender_name: sender.and_then(|s| s.name),
            recipients,
            body_preview: self.body_preview,
            importance: self.importance,
            is_read: self.is_read.unwrap_or(false),
            has_attachments: self.has_attachments.unwrap_or(false),
            received_at: self.received_date_time,
            sent_at: self.sent_date_time,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeltaPage {
    #[serde(default)]
    pub value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub change_type: String,
    pub notification_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle_notification_url: Option<String>,
    pub resource: String,
    pub expiration_date_time: DateTime<Utc>,
    pub client_state: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSubscription {
    pub id: String,
    pub resource: Option<String>,
    pub expiration_date_time: DateTime<Utc>,
}

/// Body of a webhook POST.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationPayload {
    #[serde(default)]
    pub value: Vec<ChangeNotification>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub subscription_id: String,
    pub client_state: Option<String>,
    pub change_type: Option<String>,
    pub resource: Option<String>,
    pub tenant_id: Option<String>,
    pub lifecycle_event: Option<String>,
    pub subscription_expiration_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "bearer")]
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

fn bearer() -> String {
    "Bearer".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: i64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
    pub message: Option<String>,
}

fn default_poll_interval() -> u64 {
    5
}

/// Error body of the identity platform token endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthErrorBody {
    pub error: Option<String>,
    pub error_description: Option<String>,
}
