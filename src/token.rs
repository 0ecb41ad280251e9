//! Per-account OAuth lifecycle: registration, the two login flows, refresh
//! and revocation.
//!
//! Refreshes are single-flight per account. The first caller spawns the
//! exchange and parks a shared future in `in_flight`; later callers await
//! the same future. The spawned task removes its own entry once the new
//! credential is stored, so a caller arriving afterwards reads the fresh
//! credential instead of starting another exchange.
//!
//! A refresh holds the account's lifecycle lock from its state check to its
//! last write, and so do `revoke` and `deactivate`. Revocation therefore
//! waits for an exchange in flight, and an exchange that starts afterwards
//! sees the revoked state.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::GraphSettings;
use crate::error::{SyncError, SyncResult};
use crate::graph_api::auth::{random_token, Pkce};
use crate::graph_api::{RemoteError, TokenEndpoint, TokenResponse};
use crate::repository::Repository;
use crate::types::{
    AccessToken, Account, AccountId, AccountStatus, AuthEvent, AuthEventKind, AuthFlow,
    Credential, DevicePoll, LifecycleState, NewAccount, PendingAction, PendingAuthorization,
    TokenStatus,
};

type SharedRefresh = Shared<BoxFuture<'static, SyncResult<Credential>>>;

/// Identity platform codes meaning the refresh token is no longer usable.
const GRANT_REJECTED: &[&str] = &["invalid_grant", "interaction_required", "consent_required"];
const USER_DECLINED: &[&str] = &["access_denied", "authorization_declined", "consent_required"];
const FLOW_EXPIRED: &[&str] = &["expired_token", "code_expired"];
const SLOW_DOWN_STEP_SECS: u64 = 5;

#[derive(Debug, Clone)]
enum RefreshReason {
    Proactive,
    /// The remote API refused this access token.
    Rejected(String),
}

pub struct TokenLifecycleManager {
    repo: Arc<dyn Repository>,
    endpoint: Arc<dyn TokenEndpoint>,
    settings: GraphSettings,
    in_flight: Arc<Mutex<HashMap<AccountId, SharedRefresh>>>,
    lifecycle_locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl TokenLifecycleManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        endpoint: Arc<dyn TokenEndpoint>,
        settings: GraphSettings,
    ) -> Self {
        Self {
            repo,
            endpoint,
            settings,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            lifecycle_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lifecycle_lock(&self, id: &AccountId) -> Arc<Mutex<()>> {
        let mut locks = self.lifecycle_locks.lock().await;
        locks.entry(id.clone()).or_default().clone()
    }

    fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.settings.refresh_margin_secs)
    }

    async fn active_account(&self, id: &AccountId) -> SyncResult<Account> {
        match self.repo.load_account(id).await? {
            Some(account) if account.active => Ok(account),
            _ => Err(SyncError::AccountNotFound(id.clone())),
        }
    }

    async fn save_state(&self, account: &mut Account, state: LifecycleState) -> SyncResult<()> {
        account.state = state;
        account.updated_at = Utc::now();
        self.repo.save_account(account).await
    }

    pub async fn register(&self, new_account: NewAccount) -> SyncResult<Account> {
        let now = Utc::now();
        let tenant_id = new_account
            .tenant_id
            .unwrap_or_else(|| self.settings.tenant_id.clone());
        let scopes = if new_account.scopes.is_empty() {
            self.settings.scopes.clone()
        } else {
            new_account.scopes
        };

        let account = match self.repo.find_account_by_email(&new_account.email).await? {
            Some(existing) if existing.active && existing.state != LifecycleState::Revoked => {
                return Err(SyncError::InvalidState(format!(
                    "{} is already registered as account {}",
                    new_account.email, existing.id
                )));
            }
            // Revoked or deactivated accounts come back under their old id.
            Some(existing) => Account {
                email: new_account.email,
                user_id: new_account.user_id,
                tenant_id,
                flow: new_account.flow,
                scopes,
                state: LifecycleState::Unauthenticated,
                active: true,
                updated_at: now,
                ..existing
            },
            None => Account {
                id: AccountId::generate(),
                email: new_account.email,
                user_id: new_account.user_id,
                tenant_id,
                flow: new_account.flow,
                scopes,
                state: LifecycleState::Unauthenticated,
                active: true,
                created_at: now,
                updated_at: now,
                last_authenticated_at: None,
            },
        };

        self.repo.delete_credential(&account.id).await?;
        self.repo.save_account(&account).await?;
        self.record(&account.id, AuthEventKind::Registration, true, None)
            .await;
        info!(account_id = %account.id, email = %account.email, "account registered");
        Ok(account)
    }

    pub async fn begin_authentication(&self, id: &AccountId) -> SyncResult<PendingAction> {
        let mut account = self.active_account(id).await?;
        match account.state {
            LifecycleState::Unauthenticated
            | LifecycleState::Expired
            | LifecycleState::PendingUserAction => {}
            LifecycleState::Revoked => {
                return Err(SyncError::InvalidState(format!(
                    "account {} was revoked; register it again",
                    id
                )))
            }
            LifecycleState::Authenticated | LifecycleState::Refreshing => {
                return Err(SyncError::InvalidState(format!(
                    "account {} is already authenticated",
                    id
                )))
            }
        }

        let now = Utc::now();
        let (pending, action) = match account.flow {
            AuthFlow::AuthorizationCode => {
                let pkce = Pkce::generate();
                let state = random_token(24);
                let url = self.endpoint.authorization_url(
                    &account.tenant_id,
                    &account.scopes,
                    &state,
                    &pkce.challenge,
                );
                let deadline =
                    now + chrono::Duration::seconds(self.settings.authorization_window_secs as i64);
                (
                    PendingAuthorization::AuthorizationCode {
                        state: state.clone(),
                        code_verifier: pkce.verifier,
                        deadline,
                    },
                    PendingAction::OpenUrl { url, state },
                )
            }
            AuthFlow::DeviceCode => {
                let response = self
                    .endpoint
                    .request_device_code(&account.tenant_id, &account.scopes)
                    .await
                    .map_err(SyncError::from)?;
                let deadline = now + chrono::Duration::seconds(response.expires_in);
                (
                    PendingAuthorization::DeviceCode {
                        device_code: response.device_code,
                        user_code: response.user_code.clone(),
                        verification_uri: response.verification_uri.clone(),
                        interval_secs: response.interval,
                        deadline,
                    },
                    PendingAction::EnterCode {
                        user_code: response.user_code,
                        verification_uri: response.verification_uri,
                        expires_at: deadline,
                        interval_secs: response.interval,
                    },
                )
            }
        };

        self.repo.save_pending_authorization(id, &pending).await?;
        self.save_state(&mut account, LifecycleState::PendingUserAction)
            .await?;
        self.record(
            id,
            AuthEventKind::AuthenticationStarted,
            true,
            Some(account.flow.as_str().to_string()),
        )
        .await;
        info!(account_id = %id, flow = account.flow.as_str(), "authentication started");
        Ok(action)
    }

    async fn pending_for(&self, account: &Account) -> SyncResult<PendingAuthorization> {
        if account.state != LifecycleState::PendingUserAction {
            return Err(SyncError::InvalidState(format!(
                "account {} has no authentication in progress",
                account.id
            )));
        }
        self.repo
            .load_pending_authorization(&account.id)
            .await?
            .ok_or_else(|| {
                SyncError::InvalidState(format!(
                    "account {} has no pending authorization",
                    account.id
                ))
            })
    }

    /// Drop the in-progress login and return `error` to the caller.
    async fn abandon(&self, account: &mut Account, error: SyncError) -> SyncResult<()> {
        self.repo.delete_pending_authorization(&account.id).await?;
        self.save_state(account, LifecycleState::Unauthenticated)
            .await?;
        self.record(
            &account.id,
            AuthEventKind::Authentication,
            false,
            Some(error.to_string()),
        )
        .await;
        warn!(account_id = %account.id, error = %error, "authentication abandoned");
        Err(error)
    }

    async fn store_grant(&self, account: &mut Account, response: TokenResponse) -> SyncResult<()> {
        let now = Utc::now();
        let credential = credential_from_response(response, None, &account.scopes, now);
        self.repo.save_credential(&account.id, &credential).await?;
        self.repo.delete_pending_authorization(&account.id).await?;
        account.last_authenticated_at = Some(now);
        self.save_state(account, LifecycleState::Authenticated)
            .await?;
        self.record(&account.id, AuthEventKind::Authentication, true, None)
            .await;
        info!(account_id = %account.id, expires_at = %credential.expires_at, "account authenticated");
        Ok(())
    }

    /// Finish the code flow with the `code` and `state` from the redirect.
    pub async fn complete_authorization(
        &self,
        id: &AccountId,
        code: &str,
        state: &str,
    ) -> SyncResult<Account> {
        let mut account = self.active_account(id).await?;
        let (expected_state, verifier, deadline) = match self.pending_for(&account).await? {
            PendingAuthorization::AuthorizationCode {
                state,
                code_verifier,
                deadline,
            } => (state, code_verifier, deadline),
            PendingAuthorization::DeviceCode { .. } => {
                return Err(SyncError::InvalidState(format!(
                    "account {} is in a device code login",
                    id
                )))
            }
        };

        if expected_state != state {
            return Err(SyncError::InvalidState(
                "authorization state does not match".to_string(),
            ));
        }
        if Utc::now() >= deadline {
            self.abandon(&mut account, SyncError::AuthorizationTimeout)
                .await?;
        }

        match self
            .endpoint
            .exchange_code(&account.tenant_id, code, &verifier, &account.scopes)
            .await
        {
            Ok(response) => {
                self.store_grant(&mut account, response).await?;
                Ok(account)
            }
            Err(e) => {
                let error = flow_error(e);
                if error.is_transient() {
                    return Err(error);
                }
                self.abandon(&mut account, error.clone()).await?;
                Err(error)
            }
        }
    }

    /// Finish the code flow from the full redirect URL, including the
    /// `error=access_denied` redirect of a user who declined.
    pub async fn complete_from_redirect(
        &self,
        id: &AccountId,
        redirect_url: &str,
    ) -> SyncResult<Account> {
        let url = Url::parse(redirect_url)
            .map_err(|e| SyncError::InvalidState(format!("invalid redirect url: {}", e)))?;
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

        if let Some(code) = params.get("error") {
            let mut account = self.active_account(id).await?;
            let description = params.get("error_description").cloned().unwrap_or_default();
            let error = flow_error(RemoteError::OAuth {
                code: code.clone(),
                description,
            });
            self.abandon(&mut account, error.clone()).await?;
            return Err(error);
        }

        match (params.get("code"), params.get("state")) {
            (Some(code), Some(state)) => self.complete_authorization(id, code, state).await,
            _ => Err(SyncError::InvalidState(
                "redirect url carries no code and state".to_string(),
            )),
        }
    }

    /// One poll of the device code flow.
    pub async fn poll_device_authorization(&self, id: &AccountId) -> SyncResult<DevicePoll> {
        let mut account = self.active_account(id).await?;
        let pending = self.pending_for(&account).await?;
        let PendingAuthorization::DeviceCode {
            ref device_code,
            deadline,
            ..
        } = pending
        else {
            return Err(SyncError::InvalidState(format!(
                "account {} is in a code flow login",
                id
            )));
        };

        if Utc::now() >= deadline {
            self.abandon(&mut account, SyncError::AuthorizationTimeout)
                .await?;
        }

        match self
            .endpoint
            .poll_device_code(&account.tenant_id, device_code)
            .await
        {
            Ok(response) => {
                self.store_grant(&mut account, response).await?;
                Ok(DevicePoll::Authenticated)
            }
            Err(e) => match e.oauth_code() {
                Some("authorization_pending") => Ok(DevicePoll::Pending),
                Some("slow_down") => {
                    if let PendingAuthorization::DeviceCode {
                        device_code,
                        user_code,
                        verification_uri,
                        interval_secs,
                        deadline,
                    } = pending
                    {
                        let slowed = PendingAuthorization::DeviceCode {
                            device_code,
                            user_code,
                            verification_uri,
                            interval_secs: interval_secs + SLOW_DOWN_STEP_SECS,
                            deadline,
                        };
                        self.repo.save_pending_authorization(id, &slowed).await?;
                    }
                    debug!(account_id = %id, "device flow asked to slow down");
                    Ok(DevicePoll::Pending)
                }
                _ => {
                    let error = flow_error(e);
                    if error.is_transient() {
                        return Err(error);
                    }
                    self.abandon(&mut account, error.clone()).await?;
                    Err(error)
                }
            },
        }
    }

    /// Poll the device flow at the provider's interval until it finishes.
    pub async fn wait_for_device_authorization(&self, id: &AccountId) -> SyncResult<Account> {
        loop {
            let account = self.active_account(id).await?;
            let interval = match self.pending_for(&account).await? {
                PendingAuthorization::DeviceCode { interval_secs, .. } => interval_secs,
                PendingAuthorization::AuthorizationCode { .. } => {
                    return Err(SyncError::InvalidState(format!(
                        "account {} is in a code flow login",
                        id
                    )))
                }
            };
            tokio::time::sleep(Duration::from_secs(interval)).await;

            if self.poll_device_authorization(id).await? == DevicePoll::Authenticated {
                return self.active_account(id).await;
            }
        }
    }

    /// A non-expired access token, refreshing first when the stored one is
    /// inside the safety margin.
    pub async fn get_valid_token(&self, id: &AccountId) -> SyncResult<AccessToken> {
        let account = self.active_account(id).await?;
        if !matches!(
            account.state,
            LifecycleState::Authenticated | LifecycleState::Refreshing
        ) {
            return Err(SyncError::ReauthenticationRequired(id.clone()));
        }

        let credential = self
            .repo
            .load_credential(id)
            .await?
            .ok_or_else(|| SyncError::ReauthenticationRequired(id.clone()))?;

        if !credential.expires_within(self.refresh_margin(), Utc::now()) {
            return Ok(credential.access_token());
        }

        match self.single_flight(id, RefreshReason::Proactive).await {
            Ok(fresh) => unexpired(fresh),
            Err(e) if e.is_transient() && !credential.is_expired_at(Utc::now()) => {
                warn!(account_id = %id, error = %e, "proactive refresh failed, using current token");
                Ok(credential.access_token())
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh after the remote API refused `rejected`. If another caller
    /// already replaced that token, the replacement is returned as is.
    pub async fn refresh_after_rejection(
        &self,
        id: &AccountId,
        rejected: &AccessToken,
    ) -> SyncResult<AccessToken> {
        let account = self.active_account(id).await?;
        if matches!(
            account.state,
            LifecycleState::Expired
                | LifecycleState::Revoked
                | LifecycleState::Unauthenticated
                | LifecycleState::PendingUserAction
        ) {
            return Err(SyncError::ReauthenticationRequired(id.clone()));
        }
        let fresh = self
            .single_flight(id, RefreshReason::Rejected(rejected.secret().to_string()))
            .await?;
        unexpired(fresh)
    }

    /// Run `call` with a valid token; on an authentication failure refresh
    /// once and run it again with the new token.
    pub async fn with_token<T, F, Fut>(&self, id: &AccountId, mut call: F) -> SyncResult<T>
    where
        F: FnMut(AccessToken) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let token = self.get_valid_token(id).await?;
        match call(token.clone()).await {
            Err(SyncError::AuthenticationFailure(reason)) => {
                debug!(account_id = %id, reason = %reason, "token rejected, refreshing");
                let fresh = self.refresh_after_rejection(id, &token).await?;
                call(fresh).await
            }
            other => other,
        }
    }

    async fn single_flight(&self, id: &AccountId, reason: RefreshReason) -> SyncResult<Credential> {
        let lifecycle = self.lifecycle_lock(id).await;
        let shared = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(id) {
                Some(existing) => {
                    debug!(account_id = %id, "joining in-flight refresh");
                    existing.clone()
                }
                None => {
                    let job = RefreshJob {
                        repo: self.repo.clone(),
                        endpoint: self.endpoint.clone(),
                        in_flight: self.in_flight.clone(),
                        lifecycle,
                        account_id: id.clone(),
                        reason,
                        margin: self.refresh_margin(),
                    };
                    let handle = tokio::spawn(job.run());
                    let shared = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(SyncError::InvalidState(format!("refresh task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(id.clone(), shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    pub async fn revoke(&self, id: &AccountId) -> SyncResult<()> {
        let lock = self.lifecycle_lock(id).await;
        let _guard = lock.lock().await;
        let mut account = self.active_account(id).await?;
        if !matches!(
            account.state,
            LifecycleState::Authenticated | LifecycleState::Expired | LifecycleState::Refreshing
        ) {
            return Err(SyncError::InvalidState(format!(
                "account {} cannot be revoked from {}",
                id,
                account.state.as_str()
            )));
        }

        self.repo.delete_credential(id).await?;
        self.repo.delete_pending_authorization(id).await?;
        self.save_state(&mut account, LifecycleState::Revoked).await?;
        self.record(id, AuthEventKind::Revocation, true, None).await;
        info!(account_id = %id, "credentials revoked");
        Ok(())
    }

    /// Soft delete. The account and its history stay in the repository.
    pub async fn deactivate(&self, id: &AccountId) -> SyncResult<()> {
        let lock = self.lifecycle_lock(id).await;
        let _guard = lock.lock().await;
        let mut account = self.active_account(id).await?;
        account.active = false;
        account.updated_at = Utc::now();
        self.repo.save_account(&account).await?;
        self.record(id, AuthEventKind::Deactivation, true, None).await;
        info!(account_id = %id, "account deactivated");
        Ok(())
    }

    pub async fn account_status(&self, id: &AccountId) -> SyncResult<AccountStatus> {
        let account = self
            .repo
            .load_account(id)
            .await?
            .ok_or_else(|| SyncError::AccountNotFound(id.clone()))?;
        self.status_of(account).await
    }

    pub async fn list_account_status(&self) -> SyncResult<Vec<AccountStatus>> {
        let mut statuses = Vec::new();
        for account in self.repo.list_accounts().await? {
            statuses.push(self.status_of(account).await?);
        }
        Ok(statuses)
    }

    async fn status_of(&self, account: Account) -> SyncResult<AccountStatus> {
        let now = Utc::now();
        let credential = self.repo.load_credential(&account.id).await?;
        let (token_status, token_expires_in) = match credential {
            Some(c) if c.is_expired_at(now) => (TokenStatus::Expired, Some(0)),
            Some(c) => (TokenStatus::Valid, Some(c.expires_in_seconds(now))),
            None => (TokenStatus::None, None),
        };
        Ok(AccountStatus {
            account,
            token_status,
            token_expires_in,
        })
    }

    async fn record(
        &self,
        id: &AccountId,
        kind: AuthEventKind,
        success: bool,
        detail: Option<String>,
    ) {
        record_event(self.repo.as_ref(), id, kind, success, detail).await;
    }
}

/// State carried into the spawned refresh task.
struct RefreshJob {
    repo: Arc<dyn Repository>,
    endpoint: Arc<dyn TokenEndpoint>,
    in_flight: Arc<Mutex<HashMap<AccountId, SharedRefresh>>>,
    lifecycle: Arc<Mutex<()>>,
    account_id: AccountId,
    reason: RefreshReason,
    margin: chrono::Duration,
}

impl RefreshJob {
    async fn run(self) -> SyncResult<Credential> {
        let lifecycle = self.lifecycle.clone();
        let _guard = lifecycle.lock().await;
        let result = self.refresh().await;
        self.in_flight.lock().await.remove(&self.account_id);
        result
    }

    async fn refresh(&self) -> SyncResult<Credential> {
        let id = &self.account_id;
        let mut account = match self.repo.load_account(id).await? {
            Some(account) if account.active => account,
            _ => return Err(SyncError::AccountNotFound(id.clone())),
        };
        // Revoked or expired while this job waited for the lifecycle lock.
        if !matches!(
            account.state,
            LifecycleState::Authenticated | LifecycleState::Refreshing
        ) {
            return Err(SyncError::ReauthenticationRequired(id.clone()));
        }
        let credential = self.repo.load_credential(id).await?;
        let now = Utc::now();

        // Another refresh may have finished between the caller's read and now.
        if let Some(current) = &credential {
            let still_good = match &self.reason {
                RefreshReason::Proactive => !current.expires_within(self.margin, now),
                RefreshReason::Rejected(token) => {
                    current.access_token != *token && !current.is_expired_at(now)
                }
            };
            if still_good {
                return Ok(current.clone());
            }
        }

        let Some(refresh_token) = credential.as_ref().and_then(|c| c.refresh_token.clone()) else {
            self.expire(&mut account, "no refresh token").await?;
            return Err(SyncError::ReauthenticationRequired(id.clone()));
        };

        account.state = LifecycleState::Refreshing;
        account.updated_at = now;
        self.repo.save_account(&account).await?;

        match self
            .endpoint
            .refresh(&account.tenant_id, &refresh_token, &account.scopes)
            .await
        {
            Ok(response) => {
                let fresh =
                    credential_from_response(response, Some(refresh_token), &account.scopes, Utc::now());
                self.repo.save_credential(id, &fresh).await?;
                account.state = LifecycleState::Authenticated;
                account.updated_at = Utc::now();
                self.repo.save_account(&account).await?;
                record_event(self.repo.as_ref(), id, AuthEventKind::TokenRefresh, true, None).await;
                info!(account_id = %id, expires_at = %fresh.expires_at, "access token refreshed");
                Ok(fresh)
            }
            Err(e) if e.oauth_code().is_some_and(|code| GRANT_REJECTED.contains(&code)) => {
                // The dead credential stays on record until a new login replaces it.
                self.expire(&mut account, &e.to_string()).await?;
                Err(SyncError::ReauthenticationRequired(id.clone()))
            }
            Err(e) => {
                account.state = LifecycleState::Authenticated;
                account.updated_at = Utc::now();
                self.repo.save_account(&account).await?;
                record_event(
                    self.repo.as_ref(),
                    id,
                    AuthEventKind::TokenRefresh,
                    false,
                    Some(e.to_string()),
                )
                .await;
                warn!(account_id = %id, error = %e, "token refresh failed");
                Err(e.into())
            }
        }
    }

    async fn expire(&self, account: &mut Account, reason: &str) -> SyncResult<()> {
        account.state = LifecycleState::Expired;
        account.updated_at = Utc::now();
        self.repo.save_account(account).await?;
        record_event(
            self.repo.as_ref(),
            &account.id,
            AuthEventKind::TokenRefresh,
            false,
            Some(reason.to_string()),
        )
        .await;
        warn!(account_id = %account.id, reason, "refresh impossible, account must re-authenticate");
        Ok(())
    }
}

async fn record_event(
    repo: &dyn Repository,
    id: &AccountId,
    kind: AuthEventKind,
    success: bool,
    detail: Option<String>,
) {
    let event = AuthEvent {
        account_id: id.clone(),
        kind,
        success,
        detail,
        at: Utc::now(),
    };
    if let Err(e) = repo.record_auth_event(&event).await {
        warn!(account_id = %id, error = %e, "failed to record auth event");
    }
}

fn credential_from_response(
    response: TokenResponse,
    previous_refresh_token: Option<String>,
    requested_scopes: &[String],
    now: DateTime<Utc>,
) -> Credential {
    let scopes = response
        .scope
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_else(|| requested_scopes.to_vec());
    Credential {
        access_token: response.access_token,
        // The identity platform may omit a rotated refresh token.
        refresh_token: response.refresh_token.or(previous_refresh_token),
        token_type: response.token_type,
        expires_at: now + chrono::Duration::seconds(response.expires_in),
        scopes,
        issued_at: now,
    }
}

/// Map a login-flow failure to the error surfaced to the user.
fn flow_error(e: RemoteError) -> SyncError {
    match e.oauth_code() {
        Some(code) if USER_DECLINED.contains(&code) => SyncError::AuthorizationDenied,
        Some(code) if FLOW_EXPIRED.contains(&code) => SyncError::AuthorizationTimeout,
        _ => e.into(),
    }
}

fn unexpired(credential: Credential) -> SyncResult<AccessToken> {
    if credential.is_expired_at(Utc::now()) {
        return Err(SyncError::AuthenticationFailure(
            "identity platform issued an already expired token".to_string(),
        ));
    }
    Ok(credential.access_token())
}
