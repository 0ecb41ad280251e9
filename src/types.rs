use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlow {
    AuthorizationCode,
    DeviceCode,
}

impl AuthFlow {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFlow::AuthorizationCode => "authorization_code",
            AuthFlow::DeviceCode => "device_code",
        }
    }
}

impl FromStr for AuthFlow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization_code" | "code" => Ok(AuthFlow::AuthorizationCode),
            "device_code" | "device" => Ok(AuthFlow::DeviceCode),
            other => Err(format!("unknown authentication flow '{}'", other)),
        }
    }
}

/// Token lifecycle state of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unauthenticated,
    PendingUserAction,
    Authenticated,
    Refreshing,
    Expired,
    Revoked,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Unauthenticated => "unauthenticated",
            LifecycleState::PendingUserAction => "pending_user_action",
            LifecycleState::Authenticated => "authenticated",
            LifecycleState::Refreshing => "refreshing",
            LifecycleState::Expired => "expired",
            LifecycleState::Revoked => "revoked",
        }
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unauthenticated" => Ok(LifecycleState::Unauthenticated),
            "pending_user_action" => Ok(LifecycleState::PendingUserAction),
            "authenticated" => Ok(LifecycleState::Authenticated),
            "refreshing" => Ok(LifecycleState::Refreshing),
            "expired" => Ok(LifecycleState::Expired),
            "revoked" => Ok(LifecycleState::Revoked),
            other => Err(format!("unknown lifecycle state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    /// Mailbox owner id as known to the remote API.
    pub user_id: String,
    pub tenant_id: String,
    pub flow: AuthFlow,
    pub scopes: Vec<String>,
    pub state: LifecycleState,
    /// Cleared by deactivation; accounts are never physically deleted.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_authenticated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub user_id: String,
    /// Falls back to the configured tenant when absent.
    pub tenant_id: Option<String>,
    pub flow: AuthFlow,
    pub scopes: Vec<String>,
}

/// Bearer token handed to callers of the token manager.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Credential material for one account. Replaced wholesale on refresh.
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= margin
    }

    pub fn expires_in_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }

    pub fn access_token(&self) -> AccessToken {
        AccessToken::new(self.access_token.clone(), self.expires_at)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Data kept while an account waits for the user to finish a login flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum PendingAuthorization {
    AuthorizationCode {
        state: String,
        code_verifier: String,
        deadline: DateTime<Utc>,
    },
    DeviceCode {
        device_code: String,
        user_code: String,
        verification_uri: String,
        interval_secs: u64,
        deadline: DateTime<Utc>,
    },
}

impl PendingAuthorization {
    pub fn deadline(&self) -> DateTime<Utc> {
        match self {
            PendingAuthorization::AuthorizationCode { deadline, .. }
            | PendingAuthorization::DeviceCode { deadline, .. } => *deadline,
        }
    }
}

/// What the user has to do to finish authenticating.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    OpenUrl {
        url: String,
        state: String,
    },
    EnterCode {
        user_code: String,
        verification_uri: String,
        expires_at: DateTime<Utc>,
        interval_secs: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePoll {
    Pending,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Valid,
    Expired,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub account: Account,
    pub token_status: TokenStatus,
    pub token_expires_in: Option<i64>,
}

/// Continuation marker for one account and folder.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCursor {
    pub account_id: AccountId,
    pub folder: String,
    /// Opaque delta link issued by the remote API.
    pub delta_link: String,
    /// Incremented on every commit; never decreases.
    pub sequence: u64,
    /// Incremented on every full resync.
    pub epoch: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    None,
    Pending,
    Active,
    RenewalDue,
    Lapsed,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::None => "none",
            SubscriptionState::Pending => "pending",
            SubscriptionState::Active => "active",
            SubscriptionState::RenewalDue => "renewal_due",
            SubscriptionState::Lapsed => "lapsed",
        }
    }
}

impl FromStr for SubscriptionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SubscriptionState::None),
            "pending" => Ok(SubscriptionState::Pending),
            "active" => Ok(SubscriptionState::Active),
            "renewal_due" => Ok(SubscriptionState::RenewalDue),
            "lapsed" => Ok(SubscriptionState::Lapsed),
            other => Err(format!("unknown subscription state '{}'", other)),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct Subscription {
    /// Remote subscription id.
    pub id: String,
    pub account_id: AccountId,
    pub resource: String,
    /// Client state echoed back in every notification.
    pub secret: String,
    pub state: SubscriptionState,
    pub expires_at: DateTime<Utc>,
    /// Start of the current lifetime window (creation or last renewal).
    pub window_started_at: DateTime<Utc>,
    pub renew_at: DateTime<Utc>,
    pub renewal_count: u32,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("resource", &self.resource)
            .field("secret", &"<redacted>")
            .field("state", &self.state)
            .field("expires_at", &self.expires_at)
            .field("renew_at", &self.renew_at)
            .field("renewal_count", &self.renewal_count)
            .finish()
    }
}

/// Push or poll, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryMode {
    Push { subscription: Subscription },
    Poll { next_poll_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Upserted,
    Removed,
}

/// One synchronized message as handed to the store and the forwarder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailItem {
    pub id: String,
    pub account_id: AccountId,
    pub folder: String,
    pub change: ChangeKind,
    pub internet_message_id: Option<String>,
    pub subject: Option<String>,
    pub sender_address: Option<String>,
    pub sender_name: Option<String>,
    pub recipients: Vec<String>,
    pub body_preview: Option<String>,
    pub importance: Option<String>,
    pub is_read: bool,
    pub has_attachments: bool,
    pub received_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    Registration,
    AuthenticationStarted,
    Authentication,
    TokenRefresh,
    Revocation,
    Deactivation,
}

impl AuthEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEventKind::Registration => "registration",
            AuthEventKind::AuthenticationStarted => "authentication_started",
            AuthEventKind::Authentication => "authentication",
            AuthEventKind::TokenRefresh => "token_refresh",
            AuthEventKind::Revocation => "revocation",
            AuthEventKind::Deactivation => "deactivation",
        }
    }
}

impl FromStr for AuthEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registration" => Ok(AuthEventKind::Registration),
            "authentication_started" => Ok(AuthEventKind::AuthenticationStarted),
            "authentication" => Ok(AuthEventKind::Authentication),
            "token_refresh" => Ok(AuthEventKind::TokenRefresh),
            "revocation" => Ok(AuthEventKind::Revocation),
            "deactivation" => Ok(AuthEventKind::Deactivation),
            other => Err(format!("unknown auth event '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub account_id: AccountId,
    pub kind: AuthEventKind,
    pub success: bool,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SyncRun {
    pub account_id: AccountId,
    pub folder: String,
    pub items_found: usize,
    pub new_items: usize,
    pub full_resync: bool,
    pub duration_ms: i64,
    pub success: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ForwardFailure {
    pub id: i64,
    pub account_id: AccountId,
    pub message_id: String,
    pub reason: String,
    pub payload: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Rows removed by one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub auth_events: u64,
    pub sync_runs: u64,
    pub messages: u64,
    pub ledger: u64,
    pub failures: u64,
}

impl PruneReport {
    pub fn total(&self) -> u64 {
        self.auth_events + self.sync_runs + self.messages + self.ledger + self.failures
    }
}
