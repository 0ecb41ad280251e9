//! Storage contract consumed by the engine.
//!
//! Every method is atomic per key. The engine never spans a transaction
//! across calls; per-account serialization happens above this layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::types::{
    Account, AccountId, AuthEvent, Credential, ForwardFailure, MailItem, PendingAuthorization,
    PruneReport, Subscription, SyncCursor, SyncRun,
};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_account(&self, id: &AccountId) -> SyncResult<Option<Account>>;
    async fn find_account_by_email(&self, email: &str) -> SyncResult<Option<Account>>;
    /// All accounts, including deactivated ones.
    async fn list_accounts(&self) -> SyncResult<Vec<Account>>;
    async fn save_account(&self, account: &Account) -> SyncResult<()>;

    async fn load_credential(&self, id: &AccountId) -> SyncResult<Option<Credential>>;
    async fn save_credential(&self, id: &AccountId, credential: &Credential) -> SyncResult<()>;
    async fn delete_credential(&self, id: &AccountId) -> SyncResult<()>;

    async fn load_pending_authorization(
        &self,
        id: &AccountId,
    ) -> SyncResult<Option<PendingAuthorization>>;
    async fn save_pending_authorization(
        &self,
        id: &AccountId,
        pending: &PendingAuthorization,
    ) -> SyncResult<()>;
    async fn delete_pending_authorization(&self, id: &AccountId) -> SyncResult<()>;

    async fn load_cursor(&self, id: &AccountId, folder: &str) -> SyncResult<Option<SyncCursor>>;
    async fn save_cursor(&self, cursor: &SyncCursor) -> SyncResult<()>;
    async fn delete_cursor(&self, id: &AccountId, folder: &str) -> SyncResult<()>;

    async fn load_subscription(&self, id: &AccountId) -> SyncResult<Option<Subscription>>;
    /// Lookup by the remote subscription id carried in notifications.
    async fn find_subscription(&self, subscription_id: &str) -> SyncResult<Option<Subscription>>;
    async fn save_subscription(&self, subscription: &Subscription) -> SyncResult<()>;
    async fn delete_subscription(&self, id: &AccountId) -> SyncResult<()>;

    async fn upsert_message(&self, item: &MailItem) -> SyncResult<()>;
    async fn delete_message(&self, id: &AccountId, message_id: &str) -> SyncResult<()>;
    async fn is_forwarded(&self, id: &AccountId, message_id: &str) -> SyncResult<bool>;
    async fn mark_forwarded(&self, id: &AccountId, message_id: &str) -> SyncResult<()>;

    async fn record_auth_event(&self, event: &AuthEvent) -> SyncResult<()>;
    async fn auth_events(&self, id: &AccountId, limit: u32) -> SyncResult<Vec<AuthEvent>>;
    async fn record_sync_run(&self, run: &SyncRun) -> SyncResult<()>;

    async fn record_forward_failure(
        &self,
        id: &AccountId,
        message_id: &str,
        reason: &str,
        payload: &str,
    ) -> SyncResult<()>;
    async fn forward_failures(&self, limit: u32) -> SyncResult<Vec<ForwardFailure>>;
    /// Queue entries replayed fewer than `max_replays` times, oldest first.
    async fn replayable_forward_failures(
        &self,
        max_replays: u32,
        limit: u32,
    ) -> SyncResult<Vec<ForwardFailure>>;
    /// Count one more failed replay and keep its reason.
    async fn record_forward_replay(&self, failure_id: i64, reason: &str) -> SyncResult<()>;
    async fn delete_forward_failure(&self, failure_id: i64) -> SyncResult<()>;

    /// Drop history older than `history_before` and messages received
    /// before `messages_before`. Queue entries are only dropped once their
    /// replays are used up.
    async fn prune_history(
        &self,
        history_before: DateTime<Utc>,
        messages_before: DateTime<Utc>,
        max_replays: u32,
    ) -> SyncResult<PruneReport>;
}
