use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tracing::info;

use crate::config::Settings;
use crate::crypto::{AesGcmEncryptor, Encryptor};
use crate::database::Database;
use crate::delta::DeltaSyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::forwarder::{Forwarder, HttpForwarder, LogForwarder};
use crate::graph_api::{GraphClient, IdentityClient, MailApi, TokenEndpoint};
use crate::notifications::NotificationIngress;
use crate::rate_limit::RateLimitCoordinator;
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::subscription::SubscriptionManager;
use crate::sync::{create_sync_channels, SyncCommand, SyncEvent, SyncOrchestrator, SyncService};
use crate::token::TokenLifecycleManager;

const USER_AGENT: &str = concat!("graphsync/", env!("CARGO_PKG_VERSION"));

/// Every component wired to the same repository, limiter and token manager.
pub struct Engine {
    pub settings: Settings,
    pub database: Arc<Database>,
    pub tokens: Arc<TokenLifecycleManager>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

pub async fn initialize_app(settings: Settings) -> SyncResult<Engine> {
    let encryptor: Arc<dyn Encryptor> =
        Arc::new(AesGcmEncryptor::from_settings(&settings.security)?);
    let database = Arc::new(Database::new(&settings.database.url, encryptor).await?);
    let repo: Arc<dyn Repository> = database.clone();

    let http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| SyncError::Config(format!("http client: {}", e)))?;

    let secret = settings.graph.application_secret().await?;
    let endpoint: Arc<dyn TokenEndpoint> = Arc::new(IdentityClient::new(
        http.clone(),
        &secret,
        &settings.graph.authority,
    ));
    let api: Arc<dyn MailApi> = Arc::new(GraphClient::new(
        http.clone(),
        settings.graph.api_base.clone(),
    ));
    let limiter = Arc::new(RateLimitCoordinator::new(settings.rate_limit.clone()));

    let tokens = Arc::new(TokenLifecycleManager::new(
        repo.clone(),
        endpoint,
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
        api,
        tokens.clone(),
        limiter,
        settings.subscriptions.clone(),
        Duration::from_secs(settings.sync.poll_interval_secs),
    ));

    let forwarder: Arc<dyn Forwarder> = match &settings.forwarder.endpoint {
        Some(endpoint) => Arc::new(HttpForwarder::new(
            http,
            endpoint.clone(),
            &settings.forwarder,
        )),
        None => {
            info!("no forwarder endpoint configured, new messages are only logged");
            Arc::new(LogForwarder)
        }
    };

    let orchestrator = Arc::new(SyncOrchestrator::new(
        repo,
        tokens.clone(),
        delta,
        subscriptions.clone(),
        forwarder,
        &settings.sync,
        &settings.forwarder,
    ));

    Ok(Engine {
        settings,
        database,
        tokens,
        subscriptions,
        orchestrator,
    })
}

/// Handles to a running background service.
pub struct RunningService {
    pub commands: tokio::sync::mpsc::Sender<SyncCommand>,
    pub events: Receiver<SyncEvent>,
    pub ingress: NotificationIngress,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Spawn the sync service and queue an initial pass over every account.
pub async fn start_service(engine: &Engine) -> RunningService {
    let (command_tx, command_rx, event_tx, event_rx) = create_sync_channels();
    let mut service = SyncService::new(
        engine.orchestrator.clone(),
        command_rx,
        event_tx,
        engine.settings.sync.interval(),
    )
    .with_maintenance_interval(engine.settings.sync.maintenance_interval());
    let handle = tokio::spawn(async move {
        service.run().await;
    });

    let _ = command_tx.send(SyncCommand::SyncAll).await;
    let ingress = NotificationIngress::new(engine.subscriptions.clone(), command_tx.clone());

    RunningService {
        commands: command_tx,
        events: event_rx,
        ingress,
        handle,
    }
}
