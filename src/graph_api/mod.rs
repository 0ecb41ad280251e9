//! Microsoft Graph and identity platform clients, split into:
//! - auth: authorize URL, device code, code exchange, refresh
//! - messages: mailbox delta queries
//! - subscriptions: change-notification subscriptions
//! - types: wire formats

pub mod auth;
pub mod messages;
pub mod subscriptions;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::error::SyncError;
use crate::rate_limit::ThrottleScope;
use crate::types::AccessToken;

pub use auth::IdentityClient;
pub use types::{
    ChangeNotification, DeltaPage, DeviceCodeResponse, GraphMessage, NotificationPayload,
    RemoteSubscription, SubscriptionRequest, TokenResponse,
};

/// Used when a throttling response carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Failure of a single remote call, before the engine decides what it means.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("access token rejected: {0}")]
    Unauthorized(String),
    #[error("throttled for {retry_after:?}")]
    Throttled {
        retry_after: Duration,
        scope: ThrottleScope,
    },
    #[error("delta token is no longer valid")]
    CursorExpired,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("oauth error {code}: {description}")]
    OAuth { code: String, description: String },
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    /// The request could not be built; nothing was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request rejected with {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    /// OAuth error code, when the identity platform sent one.
    pub fn oauth_code(&self) -> Option<&str> {
        match self {
            RemoteError::OAuth { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if e.is_decode() {
            RemoteError::InvalidResponse(e.to_string())
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Unauthorized(reason) => SyncError::AuthenticationFailure(reason),
            RemoteError::Throttled { retry_after, .. } => SyncError::QuotaExceeded { retry_after },
            RemoteError::CursorExpired => SyncError::CursorExpired,
            RemoteError::NotFound(what) => SyncError::RemoteNotFound(what),
            RemoteError::OAuth { code, description } => {
                SyncError::AuthenticationFailure(format!("{}: {}", code, description))
            }
            RemoteError::Server { status, message } => {
                SyncError::RemoteUnavailable(format!("{} {}", status, message))
            }
            RemoteError::Timeout => SyncError::RemoteUnavailable("request timed out".to_string()),
            RemoteError::Transport(reason) | RemoteError::InvalidResponse(reason) => {
                SyncError::RemoteUnavailable(reason)
            }
            RemoteError::InvalidRequest(reason) => {
                SyncError::InvalidState(format!("invalid request: {}", reason))
            }
            RemoteError::Rejected { status, message } => {
                SyncError::InvalidState(format!("remote rejected request ({}): {}", status, message))
            }
        }
    }
}

/// Where a delta query starts: a fresh listing or a stored/next link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaRequest {
    Start {
        user_id: String,
        folder: String,
        page_size: u32,
    },
    Link(String),
}

/// Mailbox operations against the remote API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailApi: Send + Sync {
    async fn delta_page(
        &self,
        token: &AccessToken,
        request: &DeltaRequest,
    ) -> Result<DeltaPage, RemoteError>;

    async fn create_subscription(
        &self,
        token: &AccessToken,
        request: &SubscriptionRequest,
    ) -> Result<RemoteSubscription, RemoteError>;

    async fn renew_subscription(
        &self,
        token: &AccessToken,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<RemoteSubscription, RemoteError>;

    async fn delete_subscription(
        &self,
        token: &AccessToken,
        subscription_id: &str,
    ) -> Result<(), RemoteError>;
}

/// OAuth token operations against the identity platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    fn authorization_url(
        &self,
        tenant_id: &str,
        scopes: &[String],
        state: &str,
        code_challenge: &str,
    ) -> String;

    async fn request_device_code(
        &self,
        tenant_id: &str,
        scopes: &[String],
    ) -> Result<DeviceCodeResponse, RemoteError>;

    async fn exchange_code(
        &self,
        tenant_id: &str,
        code: &str,
        code_verifier: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, RemoteError>;

    async fn poll_device_code(
        &self,
        tenant_id: &str,
        device_code: &str,
    ) -> Result<TokenResponse, RemoteError>;

    async fn refresh(
        &self,
        tenant_id: &str,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, RemoteError>;
}

/// reqwest-backed Graph client. Delta and subscription calls live in the
/// `messages` and `subscriptions` submodules.
#[derive(Clone)]
pub struct GraphClient {
    client: reqwest::Client,
    api_base: String,
}

impl GraphClient {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl MailApi for GraphClient {
    async fn delta_page(
        &self,
        token: &AccessToken,
        request: &DeltaRequest,
    ) -> Result<DeltaPage, RemoteError> {
        messages::delta_page(self, token, request).await
    }

    async fn create_subscription(
        &self,
        token: &AccessToken,
        request: &SubscriptionRequest,
    ) -> Result<RemoteSubscription, RemoteError> {
        subscriptions::create(self, token, request).await
    }

    async fn renew_subscription(
        &self,
        token: &AccessToken,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<RemoteSubscription, RemoteError> {
        subscriptions::renew(self, token, subscription_id, expires_at).await
    }

    async fn delete_subscription(
        &self,
        token: &AccessToken,
        subscription_id: &str,
    ) -> Result<(), RemoteError> {
        subscriptions::delete(self, token, subscription_id).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct GraphErrorBody {
    error: Option<GraphErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct GraphErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

/// Delta token codes that mean the stored link must be discarded.
const CURSOR_EXPIRED_CODES: &[&str] = &["syncStateNotFound", "syncStateInvalid", "resyncRequired"];

fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn throttle_scope(headers: &HeaderMap) -> ThrottleScope {
    // Graph reports tenant- or app-wide throttling in this header.
    match headers
        .get("x-ms-throttle-scope")
        .and_then(|value| value.to_str().ok())
    {
        Some(scope) if scope.contains("Application") || scope.starts_with("Tenant") => {
            ThrottleScope::Application
        }
        _ => ThrottleScope::Account,
    }
}

/// Map a non-success Graph response to a `RemoteError`.
pub(crate) fn classify_graph_error(status: StatusCode, headers: &HeaderMap, body: &str) -> RemoteError {
    let detail = serde_json::from_str::<GraphErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_default();
    let code = detail.code.unwrap_or_default();
    let message = detail.message.unwrap_or_else(|| body.chars().take(200).collect());

    if status == StatusCode::GONE || CURSOR_EXPIRED_CODES.contains(&code.as_str()) {
        return RemoteError::CursorExpired;
    }

    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Throttled {
            retry_after: retry_after(headers),
            scope: throttle_scope(headers),
        },
        StatusCode::SERVICE_UNAVAILABLE if headers.contains_key(RETRY_AFTER) => {
            RemoteError::Throttled {
                retry_after: retry_after(headers),
                scope: throttle_scope(headers),
            }
        }
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout,
        s if s.is_server_error() => RemoteError::Server {
            status: s.as_u16(),
            message,
        },
        s => RemoteError::Rejected {
            status: s.as_u16(),
            message: if code.is_empty() {
                message
            } else {
                format!("{}: {}", code, message)
            },
        },
    }
}

pub(crate) async fn read_graph_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(classify_graph_error(status, &headers, &body))
}
