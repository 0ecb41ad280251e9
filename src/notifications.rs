use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::subscription::SubscriptionManager;
use crate::sync::SyncCommand;

/// Entry point for webhook traffic. Whatever HTTP layer hosts the
/// notification URL hands the raw request here.
///
/// Subscriptions are only created while at least one ingress is alive.
pub struct NotificationIngress {
    subscriptions: Arc<SubscriptionManager>,
    command_tx: mpsc::Sender<SyncCommand>,
}

impl NotificationIngress {
    pub fn new(subscriptions: Arc<SubscriptionManager>, command_tx: mpsc::Sender<SyncCommand>) -> Self {
        subscriptions.attach_ingress();
        Self {
            subscriptions,
            command_tx,
        }
    }

    /// Body to return for a `validationToken` request.
    pub async fn validate(&self, validation_token: &str) -> SyncResult<String> {
        self.subscriptions.handle_validation(validation_token).await
    }

    /// Validate a notification payload and queue a sync for every account
    /// it names. Returns how many accounts were queued.
    pub async fn receive(&self, body: &str) -> SyncResult<usize> {
        let accounts = self.subscriptions.handle_notification(body).await?;
        for account_id in &accounts {
            debug!(account_id = %account_id, "notification queued a sync");
            if self
                .command_tx
                .send(SyncCommand::Notification(account_id.clone()))
                .await
                .is_err()
            {
                warn!("sync service is not running, dropping notification");
                return Err(SyncError::InvalidState(
                    "sync service is not running".to_string(),
                ));
            }
        }
        Ok(accounts.len())
    }
}

impl Drop for NotificationIngress {
    fn drop(&mut self) {
        self.subscriptions.detach_ingress();
    }
}
