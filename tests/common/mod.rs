#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use graphsync::config::Settings;
use graphsync::crypto::AesGcmEncryptor;
use graphsync::database::Database;
use graphsync::delta::DeltaSyncEngine;
use graphsync::error::SyncResult;
use graphsync::forwarder::{ForwardError, Forwarder};
use graphsync::graph_api::types::RemovedMarker;
use graphsync::notifications::NotificationIngress;
use graphsync::graph_api::{
    DeltaPage, DeltaRequest, DeviceCodeResponse, GraphMessage, MailApi, RemoteError,
    RemoteSubscription, SubscriptionRequest, TokenEndpoint, TokenResponse,
};
use graphsync::rate_limit::RateLimitCoordinator;
use graphsync::repository::Repository;
use graphsync::retry::RetryPolicy;
use graphsync::subscription::SubscriptionManager;
use graphsync::sync::{SyncCommand, SyncOrchestrator};
use graphsync::token::TokenLifecycleManager;
use graphsync::types::{
    AccessToken, AccountId, AuthFlow, Credential, LifecycleState, MailItem, NewAccount,
};

pub const NOTIFICATION_URL: &str = "https://hooks.example.com/graph";

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.graph.client_id = "test-client".to_string();
    settings.sync.retry_base_delay_ms = 1;
    settings.sync.retry_max_delay_ms = 5;
    settings.sync.interval_secs = 3600;
    settings.subscriptions.enabled = true;
    settings.subscriptions.notification_url = Some(NOTIFICATION_URL.to_string());
    settings.forwarder.max_attempts = 3;
    settings
}

pub fn message(id: &str) -> GraphMessage {
    GraphMessage {
        id: id.to_string(),
        subject: Some(format!("Subject {}", id)),
        ..Default::default()
    }
}

pub fn removed(id: &str) -> GraphMessage {
    GraphMessage {
        id: id.to_string(),
        removed: Some(RemovedMarker {
            reason: Some("deleted".to_string()),
        }),
        ..Default::default()
    }
}

pub fn page(messages: Vec<GraphMessage>, next: Option<&str>, delta: Option<&str>) -> DeltaPage {
    DeltaPage {
        value: messages,
        next_link: next.map(str::to_string),
        delta_link: delta.map(str::to_string),
    }
}

pub fn start_key(user_id: &str, folder: &str) -> String {
    format!("start:{}:{}", user_id, folder)
}

/// Scripted Graph double. Unscripted delta requests fail with `NotFound`.
#[derive(Default)]
pub struct FakeMailApi {
    delta: Mutex<HashMap<String, VecDeque<Result<DeltaPage, RemoteError>>>>,
    pub delta_calls: Mutex<Vec<String>>,
    create_results: Mutex<VecDeque<Result<RemoteSubscription, RemoteError>>>,
    renew_results: Mutex<VecDeque<Result<RemoteSubscription, RemoteError>>>,
    pub created: Mutex<Vec<SubscriptionRequest>>,
    pub renewed: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    next_subscription: AtomicU32,
    /// When set, every create answers a validation handshake first.
    pub validator: Mutex<Option<Weak<SubscriptionManager>>>,
    pub validation_echoes: Mutex<Vec<SyncResult<String>>>,
}

impl FakeMailApi {
    pub fn script_delta(&self, key: &str, result: Result<DeltaPage, RemoteError>) {
        self.delta
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn script_renewal(&self, result: Result<RemoteSubscription, RemoteError>) {
        self.renew_results.lock().unwrap().push_back(result);
    }

    pub fn script_creation(&self, result: Result<RemoteSubscription, RemoteError>) {
        self.create_results.lock().unwrap().push_back(result);
    }

    pub fn renew_count(&self) -> usize {
        self.renewed.lock().unwrap().len()
    }

    pub fn create_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl MailApi for FakeMailApi {
    async fn delta_page(
        &self,
        _token: &AccessToken,
        request: &DeltaRequest,
    ) -> Result<DeltaPage, RemoteError> {
        let key = match request {
            DeltaRequest::Start {
                user_id, folder, ..
            } => start_key(user_id, folder),
            DeltaRequest::Link(link) => link.clone(),
        };
        self.delta_calls.lock().unwrap().push(key.clone());
        self.delta
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(RemoteError::NotFound(format!("no scripted page for {}", key))))
    }

    async fn create_subscription(
        &self,
        _token: &AccessToken,
        request: &SubscriptionRequest,
    ) -> Result<RemoteSubscription, RemoteError> {
        self.created.lock().unwrap().push(request.clone());
        let validator = self.validator.lock().unwrap().clone();
        if let Some(manager) = validator.and_then(|w| w.upgrade()) {
            let echo = manager.handle_validation("validation-token-1").await;
            self.validation_echoes.lock().unwrap().push(echo);
        }
        let n = self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        self.create_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(RemoteSubscription {
                    id: format!("sub-{}", n),
                    resource: Some(request.resource.clone()),
                    expiration_date_time: request.expiration_date_time,
                })
            })
    }

    async fn renew_subscription(
        &self,
        _token: &AccessToken,
        subscription_id: &str,
        expires_at: chrono::DateTime<Utc>,
    ) -> Result<RemoteSubscription, RemoteError> {
        self.renewed
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        self.renew_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(RemoteSubscription {
                    id: subscription_id.to_string(),
                    resource: None,
                    expiration_date_time: expires_at,
                })
            })
    }

    async fn delete_subscription(
        &self,
        _token: &AccessToken,
        subscription_id: &str,
    ) -> Result<(), RemoteError> {
        self.deleted
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        Ok(())
    }
}

/// Identity platform double that only knows how to refresh.
#[derive(Default)]
pub struct FakeTokenEndpoint {
    pub refreshes: AtomicU32,
    pub delay: Duration,
    pub fail_with: Mutex<Option<RemoteError>>,
}

impl FakeTokenEndpoint {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenEndpoint for FakeTokenEndpoint {
    fn authorization_url(
        &self,
        _tenant_id: &str,
        _scopes: &[String],
        state: &str,
        _code_challenge: &str,
    ) -> String {
        format!("https://login.example.com/authorize?state={}", state)
    }

    async fn request_device_code(
        &self,
        _tenant_id: &str,
        _scopes: &[String],
    ) -> Result<DeviceCodeResponse, RemoteError> {
        Err(RemoteError::InvalidResponse("device code not scripted".into()))
    }

    async fn exchange_code(
        &self,
        _tenant_id: &str,
        _code: &str,
        _code_verifier: &str,
        _scopes: &[String],
    ) -> Result<TokenResponse, RemoteError> {
        Err(RemoteError::InvalidResponse("code exchange not scripted".into()))
    }

    async fn poll_device_code(
        &self,
        _tenant_id: &str,
        _device_code: &str,
    ) -> Result<TokenResponse, RemoteError> {
        Err(RemoteError::InvalidResponse("device polling not scripted".into()))
    }

    async fn refresh(
        &self,
        _tenant_id: &str,
        _refresh_token: &str,
        _scopes: &[String],
    ) -> Result<TokenResponse, RemoteError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(TokenResponse {
            access_token: format!("refreshed-{}", n),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            refresh_token: Some(format!("rt-{}", n)),
            scope: None,
        })
    }
}

/// Records deliveries; scripted failures are consumed per message id.
#[derive(Default)]
pub struct FakeForwarder {
    scripted: Mutex<HashMap<String, VecDeque<ForwardError>>>,
    pub delivered: Mutex<Vec<String>>,
    pub attempts: AtomicU32,
}

impl FakeForwarder {
    pub fn fail(&self, message_id: &str, error: ForwardError, times: usize) {
        let mut scripted = self.scripted.lock().unwrap();
        let queue = scripted.entry(message_id.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Forwarder for FakeForwarder {
    async fn forward(&self, item: &MailItem) -> Result<(), ForwardError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&item.id)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }
        self.delivered.lock().unwrap().push(item.id.clone());
        Ok(())
    }
}

/// Every component wired to in-memory storage and the fakes above.
pub struct Harness {
    pub settings: Settings,
    pub db: Arc<Database>,
    pub repo: Arc<dyn Repository>,
    pub api: Arc<FakeMailApi>,
    pub endpoint: Arc<FakeTokenEndpoint>,
    pub forwarder: Arc<FakeForwarder>,
    pub limiter: Arc<RateLimitCoordinator>,
    pub tokens: Arc<TokenLifecycleManager>,
    pub delta: Arc<DeltaSyncEngine>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub orchestrator: Arc<SyncOrchestrator>,
    /// Attached so subscriptions can be created; `take()` it to run
    /// without a webhook host.
    pub ingress: Option<NotificationIngress>,
    pub ingress_commands: mpsc::Receiver<SyncCommand>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(test_settings(), FakeTokenEndpoint::default()).await
    }

    pub async fn build(settings: Settings, endpoint: FakeTokenEndpoint) -> Self {
        let db = Arc::new(
            Database::in_memory(Arc::new(AesGcmEncryptor::new(&[9u8; 32])))
                .await
                .unwrap(),
        );
        let repo: Arc<dyn Repository> = db.clone();
        let api = Arc::new(FakeMailApi::default());
        let endpoint = Arc::new(endpoint);
        let forwarder = Arc::new(FakeForwarder::default());
        let limiter = Arc::new(RateLimitCoordinator::new(settings.rate_limit.clone()));

        let tokens = Arc::new(TokenLifecycleManager::new(
            repo.clone(),
            endpoint.clone(),
            settings.graph.clone(),
        ));
        let delta = Arc::new(DeltaSyncEngine::new(
            repo.clone(),
            api.clone(),
            tokens.clone(),
            limiter.clone(),
            RetryPolicy::from_settings(&settings.sync),
            settings.sync.page_size,
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            repo.clone(),
            api.clone(),
            tokens.clone(),
            limiter.clone(),
            settings.subscriptions.clone(),
            Duration::from_secs(settings.sync.poll_interval_secs),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            repo.clone(),
            tokens.clone(),
            delta.clone(),
            subscriptions.clone(),
            forwarder.clone(),
            &settings.sync,
            &settings.forwarder,
        ));
        let (command_tx, ingress_commands) = mpsc::channel(16);
        let ingress = Some(NotificationIngress::new(subscriptions.clone(), command_tx));

        Self {
            settings,
            db,
            repo,
            api,
            endpoint,
            forwarder,
            limiter,
            tokens,
            delta,
            subscriptions,
            orchestrator,
            ingress,
            ingress_commands,
        }
    }

    /// Register an account and store a credential valid for `valid_for`.
    pub async fn account_with_token(
        &self,
        email: &str,
        user_id: &str,
        valid_for: ChronoDuration,
        refresh_token: Option<&str>,
    ) -> AccountId {
        let mut account = self
            .tokens
            .register(NewAccount {
                email: email.to_string(),
                user_id: user_id.to_string(),
                tenant_id: None,
                flow: AuthFlow::AuthorizationCode,
                scopes: Vec::new(),
            })
            .await
            .unwrap();
        let now = Utc::now();
        account.state = LifecycleState::Authenticated;
        account.last_authenticated_at = Some(now);
        self.repo.save_account(&account).await.unwrap();
        self.repo
            .save_credential(
                &account.id,
                &Credential {
                    access_token: format!("at-{}", user_id),
                    refresh_token: refresh_token.map(str::to_string),
                    token_type: "Bearer".to_string(),
                    expires_at: now + valid_for,
                    scopes: Vec::new(),
                    issued_at: now,
                },
            )
            .await
            .unwrap();
        account.id
    }

    pub async fn account(&self, email: &str, user_id: &str) -> AccountId {
        self.account_with_token(email, user_id, ChronoDuration::hours(1), Some("rt-0"))
            .await
    }
}
