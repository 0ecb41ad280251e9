//! Per-account sync cycles and the background service that schedules them.
//!
//! One cycle: valid token, delta fetch for every configured folder, local
//! store, forwarding, cursor commit, then subscription upkeep. Cycles of
//! one account never overlap; different accounts run in parallel up to
//! `sync.max_concurrent_accounts`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{ForwarderSettings, SyncSettings};
use crate::delta::{DeltaSyncEngine, FetchedDelta};
use crate::error::{FailureKind, SyncError, SyncResult};
use crate::forwarder::{ForwardError, Forwarder};
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::subscription::SubscriptionManager;
use crate::token::TokenLifecycleManager;
use crate::types::{
    Account, AccountId, ChangeKind, DeliveryMode, LifecycleState, MailItem, PruneReport,
    SubscriptionState, SyncRun,
};

/// Queue entries looked at per replay pass.
const REPLAY_BATCH: u32 = 100;

#[derive(Debug, Clone)]
pub enum SyncCommand {
    SyncAccount(AccountId),
    SyncAll,
    /// A validated push notification named this account.
    Notification(AccountId),
    /// Replay the failure queue and run the retention sweep.
    Maintenance,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    AccountSynced {
        account_id: AccountId,
        forwarded: usize,
        full_resync: bool,
    },
    ForwardFailed {
        account_id: AccountId,
        message_id: String,
    },
    SubscriptionChanged {
        account_id: AccountId,
        state: SubscriptionState,
    },
    SyncFailed {
        account_id: AccountId,
        kind: FailureKind,
        error: String,
    },
    MaintenanceFinished {
        replay: ReplayReport,
        pruned: PruneReport,
    },
}

#[derive(Debug, Clone, Default)]
pub struct FolderReport {
    pub folder: String,
    pub items_found: usize,
    pub forwarded: usize,
    /// Messages moved to the operator queue.
    pub failed: Vec<String>,
    pub full_resync: bool,
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub account_id: AccountId,
    pub folders: Vec<FolderReport>,
    pub subscription: SubscriptionState,
}

impl CycleReport {
    pub fn forwarded(&self) -> usize {
        self.folders.iter().map(|f| f.forwarded).sum()
    }

    pub fn full_resync(&self) -> bool {
        self.folders.iter().any(|f| f.full_resync)
    }
}

/// Outcome of one pass over the failure queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    pub failed: usize,
    /// Entries whose message was forwarded by a later cycle.
    pub skipped: usize,
}

fn is_syncable(account: &Account) -> bool {
    account.active
        && matches!(
            account.state,
            LifecycleState::Authenticated | LifecycleState::Refreshing
        )
}

pub struct SyncOrchestrator {
    repo: Arc<dyn Repository>,
    tokens: Arc<TokenLifecycleManager>,
    delta: Arc<DeltaSyncEngine>,
    subscriptions: Arc<SubscriptionManager>,
    forwarder: Arc<dyn Forwarder>,
    folders: Vec<String>,
    push_safety_interval: ChronoDuration,
    forward_retry: RetryPolicy,
    max_replays: u32,
    history_retention: ChronoDuration,
    message_retention: ChronoDuration,
    ceiling: Semaphore,
    account_locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
    /// Accounts with a cycle waiting for the account lock.
    queued: Mutex<HashSet<AccountId>>,
    last_cycle: Mutex<HashMap<AccountId, DateTime<Utc>>>,
}

impl SyncOrchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        tokens: Arc<TokenLifecycleManager>,
        delta: Arc<DeltaSyncEngine>,
        subscriptions: Arc<SubscriptionManager>,
        forwarder: Arc<dyn Forwarder>,
        settings: &SyncSettings,
        forwarder_settings: &ForwarderSettings,
    ) -> Self {
        let forward_retry = RetryPolicy::new(
            forwarder_settings.max_attempts,
            std::time::Duration::from_millis(settings.retry_base_delay_ms),
            std::time::Duration::from_millis(settings.retry_max_delay_ms),
        );
        Self {
            repo,
            tokens,
            delta,
            subscriptions,
            forwarder,
            folders: settings.folders.clone(),
            push_safety_interval: ChronoDuration::seconds(settings.push_safety_interval_secs as i64),
            forward_retry,
            max_replays: forwarder_settings.max_replays,
            history_retention: ChronoDuration::days(settings.history_retention_days),
            message_retention: ChronoDuration::days(settings.message_retention_days),
            ceiling: Semaphore::new(settings.max_concurrent_accounts.max(1)),
            account_locks: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashSet::new()),
            last_cycle: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, id: &AccountId) -> Arc<Mutex<()>> {
        let mut locks = self.account_locks.lock().await;
        locks.entry(id.clone()).or_default().clone()
    }

    /// False when a cycle for the account is already waiting to run.
    async fn try_queue(&self, id: &AccountId) -> bool {
        self.queued.lock().await.insert(id.clone())
    }

    pub async fn sync_account(&self, id: &AccountId) -> SyncResult<CycleReport> {
        let lock = self.lock_for(id).await;
        let _account_guard = lock.lock().await;
        self.queued.lock().await.remove(id);
        let _permit = self
            .ceiling
            .acquire()
            .await
            .map_err(|_| SyncError::InvalidState("sync service is shutting down".to_string()))?;

        let started = Utc::now();
        self.subscriptions.record_poll(id, started).await;
        self.last_cycle.lock().await.insert(id.clone(), started);

        self.tokens.get_valid_token(id).await?;

        let mut folders = Vec::with_capacity(self.folders.len());
        for folder in &self.folders {
            folders.push(self.sync_folder(id, folder).await?);
        }

        let subscription = match self.subscriptions.ensure_subscription(id).await {
            Ok(state) => state,
            Err(e @ SyncError::ReauthenticationRequired(_)) => return Err(e),
            Err(e) => {
                warn!(account_id = %id, error = %e, "subscription upkeep failed");
                SubscriptionState::None
            }
        };

        let report = CycleReport {
            account_id: id.clone(),
            folders,
            subscription,
        };
        info!(
            account_id = %id,
            forwarded = report.forwarded(),
            full_resync = report.full_resync(),
            subscription = subscription.as_str(),
            elapsed_ms = (Utc::now() - started).num_milliseconds(),
            "sync cycle finished"
        );
        Ok(report)
    }

    /// Every syncable account, in parallel under the global ceiling.
    pub async fn sync_all(&self) -> SyncResult<Vec<(AccountId, SyncResult<CycleReport>)>> {
        let accounts: Vec<AccountId> = self
            .repo
            .list_accounts()
            .await?
            .into_iter()
            .filter(is_syncable)
            .map(|a| a.id)
            .collect();

        let results = join_all(accounts.iter().map(|id| self.sync_account(id))).await;
        Ok(accounts.into_iter().zip(results).collect())
    }

    /// Accounts whose next cycle is due: poll-mode accounts at
    /// `next_poll_at`, push-mode accounts after the safety interval.
    pub async fn due_accounts(&self, now: DateTime<Utc>) -> SyncResult<Vec<AccountId>> {
        let mut due = Vec::new();
        for account in self.repo.list_accounts().await? {
            if !is_syncable(&account) {
                continue;
            }
            let is_due = match self.subscriptions.delivery_mode_at(&account.id, now).await? {
                DeliveryMode::Poll { next_poll_at } => now >= next_poll_at,
                DeliveryMode::Push { .. } => match self.last_cycle.lock().await.get(&account.id) {
                    Some(last) => now - *last >= self.push_safety_interval,
                    None => true,
                },
            };
            if is_due {
                due.push(account.id);
            }
        }
        Ok(due)
    }

    async fn sync_folder(&self, id: &AccountId, folder: &str) -> SyncResult<FolderReport> {
        let started = Utc::now();
        let mut report = FolderReport {
            folder: folder.to_string(),
            ..Default::default()
        };
        let result = self.run_folder(id, folder, &mut report).await;

        let run = SyncRun {
            account_id: id.clone(),
            folder: folder.to_string(),
            items_found: report.items_found,
            new_items: report.forwarded,
            full_resync: report.full_resync,
            duration_ms: (Utc::now() - started).num_milliseconds(),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            at: Utc::now(),
        };
        if let Err(e) = self.repo.record_sync_run(&run).await {
            warn!(account_id = %id, folder, error = %e, "failed to record sync run");
        }

        result.map(|()| report)
    }

    async fn run_folder(
        &self,
        id: &AccountId,
        folder: &str,
        report: &mut FolderReport,
    ) -> SyncResult<()> {
        let fetched = self.delta.fetch(id, folder).await?;
        report.items_found = fetched.items.len();
        report.full_resync = fetched.had_full_resync;

        self.deliver(&fetched, report).await?;

        let cursor = self.delta.commit(&fetched).await?;
        report.sequence = cursor.sequence;
        Ok(())
    }

    /// Store every change and forward what the ledger has not seen. A
    /// transient forwarding failure that outlives its retries aborts the
    /// folder so the cursor stays where it was.
    async fn deliver(&self, fetched: &FetchedDelta, report: &mut FolderReport) -> SyncResult<()> {
        let id = &fetched.account_id;
        for item in &fetched.items {
            match item.change {
                ChangeKind::Removed => {
                    self.repo.delete_message(id, &item.id).await?;
                    continue;
                }
                ChangeKind::Upserted => self.repo.upsert_message(item).await?,
            }

            if self.repo.is_forwarded(id, &item.id).await? {
                debug!(account_id = %id, message_id = %item.id, "already forwarded");
                continue;
            }

            match self.forward(item).await {
                Ok(()) => {
                    self.repo.mark_forwarded(id, &item.id).await?;
                    report.forwarded += 1;
                }
                Err(SyncError::PermanentForwardFailure { message_id, reason }) => {
                    let payload = serde_json::to_string(item)?;
                    self.repo
                        .record_forward_failure(id, &message_id, &reason, &payload)
                        .await?;
                    error!(account_id = %id, message_id = %message_id, reason = %reason, "message moved to the failure queue");
                    report.failed.push(message_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Give every queued forwarding failure another attempt. An entry is
    /// replayed at most `forwarder.max_replays` times, after which it waits
    /// for the operator.
    pub async fn replay_failures(&self) -> SyncResult<ReplayReport> {
        let mut report = ReplayReport::default();
        let queue = self
            .repo
            .replayable_forward_failures(self.max_replays, REPLAY_BATCH)
            .await?;

        for failure in queue {
            let id = &failure.account_id;
            let lock = self.lock_for(id).await;
            let _account_guard = lock.lock().await;

            if self.repo.is_forwarded(id, &failure.message_id).await? {
                self.repo.delete_forward_failure(failure.id).await?;
                report.skipped += 1;
                continue;
            }

            let item: MailItem = match serde_json::from_str(&failure.payload) {
                Ok(item) => item,
                Err(e) => {
                    self.repo
                        .record_forward_replay(failure.id, &format!("unreadable payload: {}", e))
                        .await?;
                    report.failed += 1;
                    continue;
                }
            };

            match self.forward(&item).await {
                Ok(()) => {
                    self.repo.mark_forwarded(id, &failure.message_id).await?;
                    self.repo.delete_forward_failure(failure.id).await?;
                    info!(account_id = %id, message_id = %failure.message_id, "queued message delivered");
                    report.delivered += 1;
                }
                Err(e) => {
                    let reason = match e {
                        SyncError::PermanentForwardFailure { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    self.repo.record_forward_replay(failure.id, &reason).await?;
                    if failure.retry_count + 1 >= self.max_replays {
                        error!(account_id = %id, message_id = %failure.message_id, reason = %reason, "replays exhausted, left for the operator");
                    } else {
                        warn!(account_id = %id, message_id = %failure.message_id, reason = %reason, "replay failed");
                    }
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Retention sweep relative to `now`.
    pub async fn prune_history(&self, now: DateTime<Utc>) -> SyncResult<PruneReport> {
        let report = self
            .repo
            .prune_history(
                now - self.history_retention,
                now - self.message_retention,
                self.max_replays,
            )
            .await?;
        if report.total() > 0 {
            info!(
                auth_events = report.auth_events,
                sync_runs = report.sync_runs,
                messages = report.messages,
                ledger = report.ledger,
                failures = report.failures,
                "old history pruned"
            );
        }
        Ok(report)
    }

    async fn forward(&self, item: &MailItem) -> SyncResult<()> {
        self.forward_retry
            .retry("forward", || async {
                self.forwarder.forward(item).await.map_err(|e| match e {
                    ForwardError::Transient(reason) => {
                        SyncError::RemoteUnavailable(format!("forwarder: {}", reason))
                    }
                    ForwardError::Permanent(reason) => SyncError::PermanentForwardFailure {
                        message_id: item.id.clone(),
                        reason,
                    },
                })
            })
            .await
    }
}

/// Background loop: commands from the CLI and the notification ingress,
/// plus a timer that picks up due accounts.
pub struct SyncService {
    orchestrator: Arc<SyncOrchestrator>,
    command_rx: mpsc::Receiver<SyncCommand>,
    event_tx: mpsc::Sender<SyncEvent>,
    tick: Duration,
    maintenance: Duration,
    tasks: JoinSet<()>,
}

impl SyncService {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        command_rx: mpsc::Receiver<SyncCommand>,
        event_tx: mpsc::Sender<SyncEvent>,
        tick: Duration,
    ) -> Self {
        Self {
            orchestrator,
            command_rx,
            event_tx,
            tick,
            maintenance: Duration::from_secs(3600),
            tasks: JoinSet::new(),
        }
    }

    /// How often the failure queue is replayed and old history pruned.
    pub fn with_maintenance_interval(mut self, every: Duration) -> Self {
        self.maintenance = every;
        self
    }

    pub async fn run(&mut self) {
        let mut sync_interval = interval(self.tick);
        sync_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance_interval = interval(self.maintenance);
        maintenance_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick.
        maintenance_interval.tick().await;

        loop {
            tokio::select! {
                Some(command) = self.command_rx.recv() => {
                    match command {
                        SyncCommand::Shutdown => break,
                        _ => self.handle_command(command).await,
                    }
                }

                _ = sync_interval.tick() => {
                    self.dispatch_due().await;
                }

                _ = maintenance_interval.tick() => {
                    self.spawn_maintenance();
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "sync task panicked");
                    }
                }
            }
        }

        info!(running = self.tasks.len(), "sync service stopping");
        while self.tasks.join_next().await.is_some() {}
    }

    async fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::SyncAccount(id) | SyncCommand::Notification(id) => {
                self.spawn_cycle(id).await;
            }
            SyncCommand::SyncAll => match self.orchestrator.repo.list_accounts().await {
                Ok(accounts) => {
                    for account in accounts.into_iter().filter(is_syncable) {
                        self.spawn_cycle(account.id).await;
                    }
                }
                Err(e) => error!(error = %e, "failed to list accounts"),
            },
            SyncCommand::Maintenance => self.spawn_maintenance(),
            SyncCommand::Shutdown => {}
        }
    }

    fn spawn_maintenance(&mut self) {
        let orchestrator = self.orchestrator.clone();
        let event_tx = self.event_tx.clone();
        self.tasks.spawn(async move {
            let replay = match orchestrator.replay_failures().await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "failure queue replay failed");
                    ReplayReport::default()
                }
            };
            let pruned = match orchestrator.prune_history(Utc::now()).await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "retention sweep failed");
                    PruneReport::default()
                }
            };
            let _ = event_tx
                .send(SyncEvent::MaintenanceFinished { replay, pruned })
                .await;
        });
    }

    async fn dispatch_due(&mut self) {
        match self.orchestrator.due_accounts(Utc::now()).await {
            Ok(due) => {
                for id in due {
                    self.spawn_cycle(id).await;
                }
            }
            Err(e) => error!(error = %e, "failed to schedule due accounts"),
        }
    }

    async fn spawn_cycle(&mut self, id: AccountId) {
        if !self.orchestrator.try_queue(&id).await {
            debug!(account_id = %id, "cycle already queued");
            return;
        }
        let orchestrator = self.orchestrator.clone();
        let event_tx = self.event_tx.clone();
        self.tasks.spawn(async move {
            for event in cycle_events(&id, orchestrator.sync_account(&id).await) {
                let _ = event_tx.send(event).await;
            }
        });
    }
}

fn cycle_events(id: &AccountId, result: SyncResult<CycleReport>) -> Vec<SyncEvent> {
    match result {
        Ok(report) => {
            let mut events: Vec<SyncEvent> = report
                .folders
                .iter()
                .flat_map(|f| f.failed.iter())
                .map(|message_id| SyncEvent::ForwardFailed {
                    account_id: id.clone(),
                    message_id: message_id.clone(),
                })
                .collect();
            events.push(SyncEvent::SubscriptionChanged {
                account_id: id.clone(),
                state: report.subscription,
            });
            events.push(SyncEvent::AccountSynced {
                account_id: id.clone(),
                forwarded: report.forwarded(),
                full_resync: report.full_resync(),
            });
            events
        }
        Err(e) => {
            match e.kind() {
                FailureKind::NeedsReauthentication => {
                    warn!(account_id = %id, error = %e, "sync halted until the account logs in again")
                }
                FailureKind::WillRetry => warn!(account_id = %id, error = %e, "sync cycle failed, will retry"),
                FailureKind::OperatorAttention => error!(account_id = %id, error = %e, "sync cycle failed"),
            }
            vec![SyncEvent::SyncFailed {
                account_id: id.clone(),
                kind: e.kind(),
                error: e.to_string(),
            }]
        }
    }
}

pub fn create_sync_channels() -> (
    mpsc::Sender<SyncCommand>,
    mpsc::Receiver<SyncCommand>,
    mpsc::Sender<SyncEvent>,
    mpsc::Receiver<SyncEvent>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(100);
    let (event_tx, event_rx) = mpsc::channel(100);
    (cmd_tx, cmd_rx, event_tx, event_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_cycle_maps_to_one_event_with_its_kind() {
        let id = AccountId::from("a1");
        let events = cycle_events(&id, Err(SyncError::ReauthenticationRequired(id.clone())));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SyncEvent::SyncFailed { kind: FailureKind::NeedsReauthentication, .. }
        ));
    }

    #[test]
    fn report_events_list_failures_before_the_summary() {
        let id = AccountId::from("a1");
        let report = CycleReport {
            account_id: id.clone(),
            folders: vec![FolderReport {
                folder: "inbox".into(),
                items_found: 3,
                forwarded: 2,
                failed: vec!["m3".into()],
                full_resync: true,
                sequence: 4,
            }],
            subscription: SubscriptionState::Active,
        };
        let events = cycle_events(&id, Ok(report));
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], SyncEvent::ForwardFailed { message_id, .. } if message_id == "m3"));
        assert!(matches!(
            &events[2],
            SyncEvent::AccountSynced { forwarded: 2, full_resync: true, .. }
        ));
    }
}
