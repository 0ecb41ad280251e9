//! Error taxonomy shared by every component of the engine.

use std::time::Duration;
use thiserror::Error;

use crate::types::AccountId;

pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the synchronization engine.
///
/// The type is `Clone` because a single token refresh result is handed to
/// every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The remote API rejected the access token. Recoverable by refresh.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// The refresh token is gone or rejected. Needs a human to log in again.
    #[error("account {0} must re-authenticate")]
    ReauthenticationRequired(AccountId),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("user declined the authorization request")]
    AuthorizationDenied,

    #[error("authorization window elapsed before the user completed the flow")]
    AuthorizationTimeout,

    /// Only used inside the delta engine; callers never observe it.
    #[error("sync cursor expired")]
    CursorExpired,

    #[error("quota exceeded, retry after {retry_after:?}")]
    QuotaExceeded { retry_after: Duration },

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// The remote resource (subscription, folder) no longer exists.
    #[error("remote resource not found: {0}")]
    RemoteNotFound(String),

    #[error("invalid notification: {0}")]
    InvalidNotification(String),

    #[error("permanent forwarding failure for message {message_id}: {reason}")]
    PermanentForwardFailure { message_id: String, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// How a failure should be presented to whoever watches an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NeedsReauthentication,
    WillRetry,
    OperatorAttention,
}

impl SyncError {
    /// Failures worth retrying in place with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::RemoteUnavailable(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::ReauthenticationRequired(_)
            | SyncError::AuthorizationDenied
            | SyncError::AuthorizationTimeout => FailureKind::NeedsReauthentication,
            SyncError::AuthenticationFailure(_)
            | SyncError::CursorExpired
            | SyncError::QuotaExceeded { .. }
            | SyncError::RemoteUnavailable(_) => FailureKind::WillRetry,
            SyncError::AccountNotFound(_)
            | SyncError::RemoteNotFound(_)
            | SyncError::InvalidNotification(_)
            | SyncError::PermanentForwardFailure { .. }
            | SyncError::Storage(_)
            | SyncError::Crypto(_)
            | SyncError::Config(_)
            | SyncError::InvalidState(_) => FailureKind::OperatorAttention,
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Storage(format!("serialization: {}", e))
    }
}
