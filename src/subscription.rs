//! Push subscriptions per account, with polling as the fallback.
//!
//! `None → Pending → Active → RenewalDue → Active | Lapsed`. `Pending` only
//! exists while the create call (and the provider's validation handshake)
//! is in flight, so it is never persisted. A lapsed subscription is
//! recreated once its cool-down (stored in `renew_at`) has passed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SubscriptionSettings;
use crate::error::{SyncError, SyncResult};
use crate::graph_api::auth::random_token;
use crate::graph_api::{
    ChangeNotification, MailApi, NotificationPayload, RemoteError, SubscriptionRequest,
};
use crate::rate_limit::RateLimitCoordinator;
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::token::TokenLifecycleManager;
use crate::types::{Account, AccessToken, AccountId, DeliveryMode, Subscription, SubscriptionState};

const CHANGE_TYPES: &str = "created,updated,deleted";
const RENEWAL_BACKOFF_BASE: Duration = Duration::from_secs(60);
const RENEWAL_BACKOFF_MAX: Duration = Duration::from_secs(30 * 60);

/// `min(start + fraction * (expiry - start), expiry - margin)`, never
/// earlier than `start`.
pub fn renewal_instant(
    start: DateTime<Utc>,
    expiry: DateTime<Utc>,
    fraction: f64,
    safety_margin: ChronoDuration,
) -> DateTime<Utc> {
    let lifetime_ms = (expiry - start).num_milliseconds() as f64;
    let by_fraction = start + ChronoDuration::milliseconds((lifetime_ms * fraction) as i64);
    by_fraction.min(expiry - safety_margin).max(start)
}

/// Graph writes resources as `Users/{id}/Messages/{id}` or
/// `Users('{id}')/Messages('{id}')`.
fn resource_belongs_to(resource: &str, user_id: &str) -> bool {
    let resource = resource.trim_start_matches('/').to_lowercase();
    let user_id = user_id.to_lowercase();
    resource.starts_with(&format!("users/{}/", user_id))
        || resource.starts_with(&format!("users('{}')/", user_id))
}

pub struct SubscriptionManager {
    repo: Arc<dyn Repository>,
    api: Arc<dyn MailApi>,
    tokens: Arc<TokenLifecycleManager>,
    limiter: Arc<RateLimitCoordinator>,
    settings: SubscriptionSettings,
    poll_interval: ChronoDuration,
    renewal_backoff: RetryPolicy,
    locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
    /// Accounts with a create call (and so a validation handshake) in flight.
    handshakes: Mutex<HashMap<AccountId, Instant>>,
    /// Accounts whose first subscription failed, and when to try again.
    creation_retry_at: Mutex<HashMap<AccountId, DateTime<Utc>>>,
    last_polled: Mutex<HashMap<AccountId, DateTime<Utc>>>,
    /// Live `NotificationIngress` handles; without one nobody can answer
    /// the validation handshake.
    ingresses: AtomicUsize,
}

impl SubscriptionManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        api: Arc<dyn MailApi>,
        tokens: Arc<TokenLifecycleManager>,
        limiter: Arc<RateLimitCoordinator>,
        settings: SubscriptionSettings,
        poll_interval: Duration,
    ) -> Self {
        let renewal_backoff = RetryPolicy::new(
            settings.max_renewal_attempts,
            RENEWAL_BACKOFF_BASE,
            RENEWAL_BACKOFF_MAX,
        );
        Self {
            repo,
            api,
            tokens,
            limiter,
            settings,
            poll_interval: ChronoDuration::from_std(poll_interval)
                .unwrap_or_else(|_| ChronoDuration::minutes(5)),
            renewal_backoff,
            locks: Mutex::new(HashMap::new()),
            handshakes: Mutex::new(HashMap::new()),
            creation_retry_at: Mutex::new(HashMap::new()),
            last_polled: Mutex::new(HashMap::new()),
            ingresses: AtomicUsize::new(0),
        }
    }

    /// Push is configured and something in this process receives webhooks.
    pub fn push_enabled(&self) -> bool {
        self.settings.enabled
            && self.settings.notification_url.is_some()
            && self.ingress_attached()
    }

    pub fn ingress_attached(&self) -> bool {
        self.ingresses.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn attach_ingress(&self) {
        self.ingresses.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn detach_ingress(&self) {
        self.ingresses.fetch_sub(1, Ordering::SeqCst);
    }

    fn lifetime(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.settings.lifetime_minutes)
    }

    fn cooldown(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.settings.lapse_cooldown_minutes)
    }

    fn schedule(&self, start: DateTime<Utc>, expiry: DateTime<Utc>) -> DateTime<Utc> {
        renewal_instant(
            start,
            expiry,
            self.settings.renewal_fraction,
            ChronoDuration::minutes(self.settings.safety_margin_minutes),
        )
    }

    async fn lock_for(&self, id: &AccountId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id.clone()).or_default().clone()
    }

    async fn active_account(&self, id: &AccountId) -> SyncResult<Account> {
        match self.repo.load_account(id).await? {
            Some(account) if account.active => Ok(account),
            _ => Err(SyncError::AccountNotFound(id.clone())),
        }
    }

    /// Remote call with a valid token, under the rate limiter.
    async fn call<T, F, Fut>(&self, id: &AccountId, mut op: F) -> SyncResult<T>
    where
        F: FnMut(AccessToken) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let limiter = &self.limiter;
        self.tokens
            .with_token(id, |token| {
                let call = op(token);
                async move { limiter.run(id, move || call).await }
            })
            .await
    }

    /// Bring the account's subscription to the state it should be in now:
    /// create, renew, or recreate after a lapse.
    pub async fn ensure_subscription(&self, id: &AccountId) -> SyncResult<SubscriptionState> {
        if !self.push_enabled() {
            if self.settings.enabled {
                debug!(account_id = %id, "no notification ingress attached, polling");
            }
            return Ok(SubscriptionState::None);
        }
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let account = self.active_account(id).await?;
        let now = Utc::now();

        let Some(subscription) = self.repo.load_subscription(id).await? else {
            if let Some(retry_at) = self.creation_retry_at.lock().await.get(id) {
                if now < *retry_at {
                    return Ok(SubscriptionState::None);
                }
            }
            return Ok(match self.create(&account, now).await? {
                Some(_) => SubscriptionState::Active,
                None => SubscriptionState::None,
            });
        };

        match subscription.state {
            SubscriptionState::Active | SubscriptionState::RenewalDue
                if now < subscription.renew_at =>
            {
                Ok(subscription.state)
            }
            SubscriptionState::Active | SubscriptionState::RenewalDue
                if now < subscription.expires_at =>
            {
                self.renew(&account, subscription, now).await
            }
            SubscriptionState::Lapsed if now < subscription.renew_at => Ok(SubscriptionState::Lapsed),
            _ => self.recreate(&account, subscription, now).await,
        }
    }

    async fn renew(
        &self,
        account: &Account,
        mut subscription: Subscription,
        now: DateTime<Utc>,
    ) -> SyncResult<SubscriptionState> {
        let requested_expiry = now + self.lifetime();
        let api = &self.api;
        let subscription_id = subscription.id.clone();
        let result = self
            .call(&account.id, |token| {
                let subscription_id = subscription_id.clone();
                async move {
                    api.renew_subscription(&token, &subscription_id, requested_expiry)
                        .await
                }
            })
            .await;

        match result {
            Ok(remote) => {
                subscription.state = SubscriptionState::Active;
                subscription.expires_at = remote.expiration_date_time;
                subscription.window_started_at = now;
                subscription.renew_at = self.schedule(now, remote.expiration_date_time);
                subscription.renewal_count += 1;
                subscription.consecutive_failures = 0;
                self.repo.save_subscription(&subscription).await?;
                info!(
                    account_id = %account.id,
                    subscription_id = %subscription.id,
                    expires_at = %subscription.expires_at,
                    renew_at = %subscription.renew_at,
                    "subscription renewed"
                );
                Ok(SubscriptionState::Active)
            }
            Err(SyncError::RemoteNotFound(_)) => {
                warn!(account_id = %account.id, subscription_id = %subscription.id, "subscription vanished remotely, recreating");
                self.recreate(account, subscription, now).await
            }
            Err(e @ (SyncError::ReauthenticationRequired(_) | SyncError::AccountNotFound(_))) => {
                Err(e)
            }
            Err(e) => {
                subscription.consecutive_failures += 1;
                if subscription.consecutive_failures >= self.settings.max_renewal_attempts {
                    subscription.state = SubscriptionState::Lapsed;
                    subscription.renew_at = now + self.cooldown();
                    warn!(
                        account_id = %account.id,
                        attempts = subscription.consecutive_failures,
                        error = %e,
                        "subscription renewal exhausted, falling back to polling"
                    );
                } else {
                    let delay = self
                        .renewal_backoff
                        .delay_for(subscription.consecutive_failures);
                    let retry_at = now
                        + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::minutes(1));
                    subscription.state = SubscriptionState::RenewalDue;
                    subscription.renew_at = retry_at.min(subscription.expires_at);
                    warn!(
                        account_id = %account.id,
                        attempt = subscription.consecutive_failures,
                        retry_at = %subscription.renew_at,
                        error = %e,
                        "subscription renewal failed"
                    );
                }
                self.repo.save_subscription(&subscription).await?;
                Ok(subscription.state)
            }
        }
    }

    /// Replace an expired or lapsed subscription. On failure the old record
    /// stays as `Lapsed` with a new cool-down.
    async fn recreate(
        &self,
        account: &Account,
        mut old: Subscription,
        now: DateTime<Utc>,
    ) -> SyncResult<SubscriptionState> {
        self.delete_remote(&account.id, &old.id).await;
        match self.create(account, now).await? {
            Some(_) => Ok(SubscriptionState::Active),
            None => {
                old.state = SubscriptionState::Lapsed;
                old.renew_at = now + self.cooldown();
                self.repo.save_subscription(&old).await?;
                Ok(SubscriptionState::Lapsed)
            }
        }
    }

    /// Create a subscription with a fresh secret. `Ok(None)` means the
    /// remote side refused and the account stays on polling.
    async fn create(
        &self,
        account: &Account,
        now: DateTime<Utc>,
    ) -> SyncResult<Option<Subscription>> {
        let notification_url = self.settings.notification_url.clone().ok_or_else(|| {
            SyncError::Config("subscriptions.notification_url is not set".to_string())
        })?;
        let secret = random_token(32);
        let resource = format!(
            "users/{}/mailFolders('{}')/messages",
            account.user_id, self.settings.folder
        );
        let request = SubscriptionRequest {
            change_type: CHANGE_TYPES.to_string(),
            notification_url: notification_url.clone(),
            lifecycle_notification_url: Some(notification_url),
            resource: resource.clone(),
            expiration_date_time: now + self.lifetime(),
            client_state: secret.clone(),
        };

        self.handshakes
            .lock()
            .await
            .insert(account.id.clone(), Instant::now());
        let api = &self.api;
        let request = &request;
        let result = self
            .call(&account.id, |token| async move {
                api.create_subscription(&token, request).await
            })
            .await;
        self.handshakes.lock().await.remove(&account.id);

        match result {
            Ok(remote) => {
                let subscription = Subscription {
                    id: remote.id,
                    account_id: account.id.clone(),
                    resource,
                    secret,
                    state: SubscriptionState::Active,
                    expires_at: remote.expiration_date_time,
                    window_started_at: now,
                    renew_at: self.schedule(now, remote.expiration_date_time),
                    renewal_count: 0,
                    consecutive_failures: 0,
                    created_at: now,
                };
                self.repo.save_subscription(&subscription).await?;
                self.creation_retry_at.lock().await.remove(&account.id);
                info!(
                    account_id = %account.id,
                    subscription_id = %subscription.id,
                    expires_at = %subscription.expires_at,
                    "subscription created"
                );
                Ok(Some(subscription))
            }
            Err(e @ (SyncError::ReauthenticationRequired(_) | SyncError::AccountNotFound(_))) => {
                Err(e)
            }
            Err(e) => {
                let retry_at = now + self.cooldown();
                self.creation_retry_at
                    .lock()
                    .await
                    .insert(account.id.clone(), retry_at);
                warn!(account_id = %account.id, error = %e, %retry_at, "subscription creation failed, polling instead");
                Ok(None)
            }
        }
    }

    async fn delete_remote(&self, id: &AccountId, subscription_id: &str) {
        let api = &self.api;
        let result = self
            .call(id, |token| async move {
                api.delete_subscription(&token, subscription_id).await
            })
            .await;
        match result {
            Ok(()) | Err(SyncError::RemoteNotFound(_)) => {}
            Err(e) => {
                warn!(account_id = %id, subscription_id, error = %e, "failed to delete remote subscription")
            }
        }
    }

    /// Answer the provider's validation request by echoing its token. Only
    /// accepted while a create call is in flight and inside the window.
    pub async fn handle_validation(&self, validation_token: &str) -> SyncResult<String> {
        if validation_token.is_empty() {
            return Err(SyncError::InvalidNotification(
                "empty validation token".to_string(),
            ));
        }
        let window = Duration::from_secs(self.settings.validation_window_secs);
        let handshakes = self.handshakes.lock().await;
        if handshakes.values().any(|opened| opened.elapsed() <= window) {
            debug!("validation handshake answered");
            Ok(validation_token.to_string())
        } else {
            Err(SyncError::InvalidNotification(
                "no subscription handshake in progress".to_string(),
            ))
        }
    }

    /// Validate a webhook payload and return the accounts that need a sync.
    ///
    /// Every entry is checked before anything is applied; one bad entry
    /// rejects the whole payload.
    pub async fn handle_notification(&self, body: &str) -> SyncResult<BTreeSet<AccountId>> {
        let payload: NotificationPayload = serde_json::from_str(body)
            .map_err(|e| SyncError::InvalidNotification(format!("malformed payload: {}", e)))?;
        if payload.value.is_empty() {
            return Err(SyncError::InvalidNotification(
                "payload has no notifications".to_string(),
            ));
        }

        let mut validated = Vec::with_capacity(payload.value.len());
        for notification in &payload.value {
            validated.push((notification, self.validate(notification).await?));
        }

        let mut accounts = BTreeSet::new();
        for (notification, account_id) in validated {
            match notification.lifecycle_event.as_deref() {
                None | Some("missed") => {
                    accounts.insert(account_id);
                }
                Some("subscriptionRemoved") => {
                    self.mark_lapsed(&account_id).await?;
                    accounts.insert(account_id);
                }
                Some("reauthorizationRequired") => {
                    self.mark_renewal_due(&account_id).await?;
                }
                Some(other) => {
                    debug!(account_id = %account_id, event = other, "ignoring lifecycle event");
                }
            }
        }
        Ok(accounts)
    }

    async fn validate(&self, notification: &ChangeNotification) -> SyncResult<AccountId> {
        let invalid = |reason: &str| {
            warn!(subscription_id = %notification.subscription_id, reason, "notification rejected");
            SyncError::InvalidNotification(reason.to_string())
        };

        let Some(subscription) = self
            .repo
            .find_subscription(&notification.subscription_id)
            .await?
        else {
            return Err(invalid("unknown subscription"));
        };
        if notification.client_state.as_deref() != Some(subscription.secret.as_str()) {
            return Err(invalid("client state mismatch"));
        }
        if !matches!(
            subscription.state,
            SubscriptionState::Active | SubscriptionState::RenewalDue
        ) {
            return Err(invalid("subscription is not active"));
        }

        let account = match self.repo.load_account(&subscription.account_id).await? {
            Some(account) if account.active => account,
            _ => return Err(invalid("subscription belongs to no active account")),
        };

        match (&notification.resource, &notification.lifecycle_event) {
            (Some(resource), _) if !resource_belongs_to(resource, &account.user_id) => {
                Err(invalid("resource outside the account's mailbox"))
            }
            (None, None) => Err(invalid("change notification without resource")),
            _ => Ok(account.id),
        }
    }

    async fn mark_lapsed(&self, id: &AccountId) -> SyncResult<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        if let Some(mut subscription) = self.repo.load_subscription(id).await? {
            subscription.state = SubscriptionState::Lapsed;
            // Removed remotely: recreate on the next ensure without waiting.
            subscription.renew_at = Utc::now();
            self.repo.save_subscription(&subscription).await?;
            warn!(account_id = %id, "subscription removed by provider");
        }
        Ok(())
    }

    async fn mark_renewal_due(&self, id: &AccountId) -> SyncResult<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        if let Some(mut subscription) = self.repo.load_subscription(id).await? {
            subscription.state = SubscriptionState::RenewalDue;
            subscription.renew_at = Utc::now();
            self.repo.save_subscription(&subscription).await?;
            info!(account_id = %id, "provider asked for reauthorization");
        }
        Ok(())
    }

    /// Delete the subscription remotely and locally.
    pub async fn cancel_subscription(&self, id: &AccountId) -> SyncResult<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        if let Some(subscription) = self.repo.load_subscription(id).await? {
            self.delete_remote(id, &subscription.id).await;
            self.repo.delete_subscription(id).await?;
            info!(account_id = %id, subscription_id = %subscription.id, "subscription cancelled");
        }
        self.creation_retry_at.lock().await.remove(id);
        Ok(())
    }

    /// Replace the subscription with a new one carrying a new secret.
    pub async fn rotate_secret(&self, id: &AccountId) -> SyncResult<SubscriptionState> {
        if !self.push_enabled() {
            return Err(SyncError::InvalidState(
                "push notifications are disabled or no notification ingress is attached"
                    .to_string(),
            ));
        }
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let account = self.active_account(id).await?;

        if let Some(old) = self.repo.load_subscription(id).await? {
            self.delete_remote(id, &old.id).await;
            self.repo.delete_subscription(id).await?;
        }
        Ok(match self.create(&account, Utc::now()).await? {
            Some(_) => SubscriptionState::Active,
            None => SubscriptionState::None,
        })
    }

    pub async fn record_poll(&self, id: &AccountId, at: DateTime<Utc>) {
        self.last_polled.lock().await.insert(id.clone(), at);
    }

    pub async fn delivery_mode(&self, id: &AccountId) -> SyncResult<DeliveryMode> {
        self.delivery_mode_at(id, Utc::now()).await
    }

    /// An account that was never polled is due at `now`. Without an
    /// attached ingress every account polls, whatever its stored
    /// subscription says.
    pub async fn delivery_mode_at(
        &self,
        id: &AccountId,
        now: DateTime<Utc>,
    ) -> SyncResult<DeliveryMode> {
        let stored = if self.push_enabled() {
            self.repo.load_subscription(id).await?
        } else {
            None
        };
        if let Some(subscription) = stored {
            if matches!(
                subscription.state,
                SubscriptionState::Active | SubscriptionState::RenewalDue
            ) && subscription.expires_at > now
            {
                return Ok(DeliveryMode::Push { subscription });
            }
        }
        let next_poll_at = self
            .last_polled
            .lock()
            .await
            .get(id)
            .map(|last| *last + self.poll_interval)
            .unwrap_or(now);
        Ok(DeliveryMode::Poll { next_poll_at })
    }
}
