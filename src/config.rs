//! TOML configuration with defaults for every section.
//!
//! Lookup order for the file: explicit `--config` path, `GRAPHSYNC_CONFIG`,
//! then `graphsync.toml` in the working directory. A missing default file is
//! not an error; every setting has a default except the client id.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use yup_oauth2::ApplicationSecret;

use crate::error::SyncError;

pub const CONFIG_ENV: &str = "GRAPHSYNC_CONFIG";
pub const CLIENT_SECRET_ENV: &str = "GRAPHSYNC_CLIENT_SECRET";
pub const DATABASE_URL_ENV: &str = "GRAPHSYNC_DATABASE_URL";
const DEFAULT_CONFIG_FILE: &str = "graphsync.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for SyncError {
    fn from(e: ConfigError) -> Self {
        SyncError::Config(e.to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub graph: GraphSettings,
    pub sync: SyncSettings,
    pub subscriptions: SubscriptionSettings,
    pub rate_limit: RateLimitSettings,
    pub forwarder: ForwarderSettings,
    pub database: DatabaseSettings,
    pub security: SecuritySettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphSettings {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Installed-application JSON, read with `yup_oauth2`.
    pub client_secret_file: Option<PathBuf>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub api_base: String,
    pub authority: String,
    /// How long a code-flow login may stay open.
    pub authorization_window_secs: u64,
    /// Proactive refresh margin.
    pub refresh_margin_secs: i64,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            tenant_id: "common".to_string(),
            client_id: String::new(),
            client_secret: None,
            client_secret_file: None,
            redirect_uri: "http://localhost:5000/auth/callback".to_string(),
            scopes: vec![
                "offline_access".to_string(),
                "https://graph.microsoft.com/Mail.Read".to_string(),
            ],
            api_base: "https://graph.microsoft.com/v1.0".to_string(),
            authority: "https://login.microsoftonline.com".to_string(),
            authorization_window_secs: 600,
            refresh_margin_secs: 300,
        }
    }
}

impl GraphSettings {
    pub fn authorize_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/authorize", self.authority, tenant_id)
    }

    pub fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, tenant_id)
    }

    pub fn device_code_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/devicecode", self.authority, tenant_id)
    }

    /// Client application identity, from the JSON file when configured.
    pub async fn application_secret(&self) -> Result<ApplicationSecret, ConfigError> {
        if let Some(path) = &self.client_secret_file {
            return yup_oauth2::read_application_secret(path)
                .await
                .map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                });
        }

        if self.client_id.is_empty() {
            return Err(ConfigError::Invalid(
                "graph.client_id or graph.client_secret_file must be set".to_string(),
            ));
        }

        Ok(ApplicationSecret {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone().unwrap_or_default(),
            auth_uri: self.authorize_url(&self.tenant_id),
            token_uri: self.token_url(&self.tenant_id),
            redirect_uris: vec![self.redirect_uri.clone()],
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    pub interval_secs: u64,
    pub folders: Vec<String>,
    pub max_concurrent_accounts: usize,
    pub poll_interval_secs: u64,
    /// Push-mode accounts still get a full cycle this often.
    pub push_safety_interval_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub page_size: u32,
    /// Failure queue replay and history pruning run this often.
    pub maintenance_interval_secs: u64,
    /// Auth events and sync runs older than this are pruned.
    pub history_retention_days: i64,
    /// Stored messages received earlier than this are pruned, together with
    /// their delivery ledger rows.
    pub message_retention_days: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            folders: vec!["inbox".to_string()],
            max_concurrent_accounts: 8,
            poll_interval_secs: 300,
            push_safety_interval_secs: 3600,
            retry_max_attempts: 4,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            page_size: 50,
            maintenance_interval_secs: 3600,
            history_retention_days: 90,
            message_retention_days: 90,
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubscriptionSettings {
    /// Only takes effect while a `NotificationIngress` is alive in the same
    /// process to answer the validation handshake; otherwise accounts poll.
    pub enabled: bool,
    pub notification_url: Option<String>,
    pub folder: String,
    pub lifetime_minutes: i64,
    pub renewal_fraction: f64,
    pub safety_margin_minutes: i64,
    pub max_renewal_attempts: u32,
    pub lapse_cooldown_minutes: i64,
    pub validation_window_secs: u64,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            notification_url: None,
            folder: "inbox".to_string(),
            lifetime_minutes: 4230,
            renewal_fraction: 0.75,
            safety_margin_minutes: 30,
            max_renewal_attempts: 5,
            lapse_cooldown_minutes: 15,
            validation_window_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    pub account_limit: usize,
    pub app_limit: usize,
    pub window_secs: u64,
    pub max_in_flight_per_account: usize,
    pub call_timeout_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            account_limit: 10_000,
            app_limit: 50_000,
            window_secs: 600,
            max_in_flight_per_account: 4,
            call_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForwarderSettings {
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    /// Replays of a queued failure before it is left to the operator.
    pub max_replays: u32,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 30,
            max_attempts: 3,
            max_replays: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSettings {
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:graphsync.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySettings {
    /// Base64 AES-256 key. When absent the key lives in the OS keyring.
    pub encryption_key: Option<String>,
    pub keyring_service: String,
    pub keyring_user: String,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            encryption_key: None,
            keyring_service: "graphsync-credential-key".to_string(),
            keyring_user: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut settings = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::from_file(fallback)?
                } else {
                    Settings::default()
                }
            }
        };

        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var(CLIENT_SECRET_ENV) {
            if !secret.is_empty() {
                self.graph.client_secret = Some(secret);
            }
        }
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.is_empty() {
                self.database.url = url;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let subs = &self.subscriptions;
        if !(subs.renewal_fraction > 0.0 && subs.renewal_fraction <= 1.0) {
            return Err(ConfigError::Invalid(
                "subscriptions.renewal_fraction must be in (0, 1]".to_string(),
            ));
        }
        if subs.safety_margin_minutes >= subs.lifetime_minutes {
            return Err(ConfigError::Invalid(
                "subscriptions.safety_margin_minutes must be below lifetime_minutes".to_string(),
            ));
        }
        if subs.enabled && subs.notification_url.is_none() {
            return Err(ConfigError::Invalid(
                "subscriptions.enabled requires subscriptions.notification_url".to_string(),
            ));
        }
        if self.rate_limit.max_in_flight_per_account == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_in_flight_per_account must be at least 1".to_string(),
            ));
        }
        if self.sync.max_concurrent_accounts == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_concurrent_accounts must be at least 1".to_string(),
            ));
        }
        if self.sync.folders.is_empty() {
            return Err(ConfigError::Invalid(
                "sync.folders must name at least one folder".to_string(),
            ));
        }
        Ok(())
    }
}
