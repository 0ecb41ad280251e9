//! Quota and concurrency gate in front of every call to the mail API.
//!
//! Two sliding windows are kept: one per account and one for the whole
//! application. A call reserves a slot in both. Throttling responses block
//! their scope for exactly the advertised wait, and callers get
//! `QuotaExceeded` instead of a silent retry. Independently of the windows,
//! each account has a fixed number of in-flight slots.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitSettings;
use crate::error::{SyncError, SyncResult};
use crate::graph_api::RemoteError;
use crate::types::AccountId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleScope {
    Account,
    Application,
}

#[derive(Debug, Default)]
struct Window {
    calls: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant, span: Duration) {
        while let Some(oldest) = self.calls.front() {
            if now.duration_since(*oldest) >= span {
                self.calls.pop_front();
            } else {
                break;
            }
        }
        if matches!(self.blocked_until, Some(until) if until <= now) {
            self.blocked_until = None;
        }
    }

    /// Wait before this window admits another call, if any.
    fn wait(&self, now: Instant, span: Duration, limit: usize) -> Option<Duration> {
        if let Some(until) = self.blocked_until {
            return Some(until - now);
        }
        if self.calls.len() >= limit {
            let oldest = self.calls.front().copied().unwrap_or(now);
            return Some((oldest + span).saturating_duration_since(now));
        }
        None
    }

    fn remove(&mut self, at: Instant) {
        if let Some(pos) = self.calls.iter().position(|t| *t == at) {
            self.calls.remove(pos);
        }
    }
}

#[derive(Debug, Default)]
struct Quotas {
    app: Window,
    accounts: HashMap<AccountId, Window>,
}

/// A reserved call slot. Dropping it frees the in-flight slot; the window
/// reservation stays unless handed back through `release`.
#[derive(Debug)]
pub struct CallPermit {
    account_id: AccountId,
    reserved_at: Instant,
    _in_flight: OwnedSemaphorePermit,
}

impl CallPermit {
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }
}

pub struct RateLimitCoordinator {
    settings: RateLimitSettings,
    quotas: Mutex<Quotas>,
    in_flight: Mutex<HashMap<AccountId, Arc<Semaphore>>>,
}

impl RateLimitCoordinator {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            quotas: Mutex::new(Quotas::default()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn window_span(&self) -> Duration {
        Duration::from_secs(self.settings.window_secs)
    }

    async fn semaphore(&self, account: &AccountId) -> Arc<Semaphore> {
        let mut in_flight = self.in_flight.lock().await;
        in_flight
            .entry(account.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.settings.max_in_flight_per_account)))
            .clone()
    }

    /// Reserve a slot in both windows and one in-flight slot for `account`.
    ///
    /// Waits for an in-flight slot; fails fast with `QuotaExceeded` when a
    /// window is full or its scope is blocked.
    pub async fn acquire(&self, account: &AccountId) -> SyncResult<CallPermit> {
        self.check(account).await?;

        let semaphore = self.semaphore(account).await;
        let slot = semaphore
            .acquire_owned()
            .await
            .map_err(|_| SyncError::InvalidState("rate limiter closed".to_string()))?;

        let span = self.window_span();
        let mut guard = self.quotas.lock().await;
        let quotas = &mut *guard;
        let now = Instant::now();

        quotas.app.prune(now, span);
        let account_window = quotas.accounts.entry(account.clone()).or_default();
        account_window.prune(now, span);

        let wait = account_window
            .wait(now, span, self.settings.account_limit)
            .into_iter()
            .chain(quotas.app.wait(now, span, self.settings.app_limit))
            .max();
        if let Some(retry_after) = wait {
            debug!(account_id = %account, ?retry_after, "call refused by quota");
            return Err(SyncError::QuotaExceeded { retry_after });
        }

        quotas.app.calls.push_back(now);
        if let Some(window) = quotas.accounts.get_mut(account) {
            window.calls.push_back(now);
        }

        Ok(CallPermit {
            account_id: account.clone(),
            reserved_at: now,
            _in_flight: slot,
        })
    }

    /// Fail fast before queueing for an in-flight slot.
    async fn check(&self, account: &AccountId) -> SyncResult<()> {
        let quotas = self.quotas.lock().await;
        let now = Instant::now();
        let blocked = [
            quotas.app.blocked_until,
            quotas.accounts.get(account).and_then(|w| w.blocked_until),
        ]
        .into_iter()
        .flatten()
        .filter(|until| *until > now)
        .max();

        match blocked {
            Some(until) => Err(SyncError::QuotaExceeded {
                retry_after: until - now,
            }),
            None => Ok(()),
        }
    }

    /// Hand back a reservation for a call that was never sent.
    pub async fn release(&self, permit: CallPermit) {
        let mut quotas = self.quotas.lock().await;
        quotas.app.remove(permit.reserved_at);
        if let Some(window) = quotas.accounts.get_mut(&permit.account_id) {
            window.remove(permit.reserved_at);
        }
    }

    /// Block a scope for exactly `retry_after` from now.
    pub async fn record_throttle(
        &self,
        account: &AccountId,
        scope: ThrottleScope,
        retry_after: Duration,
    ) {
        let mut guard = self.quotas.lock().await;
        let quotas = &mut *guard;
        let until = Instant::now() + retry_after;
        let window = match scope {
            ThrottleScope::Application => &mut quotas.app,
            ThrottleScope::Account => quotas.accounts.entry(account.clone()).or_default(),
        };
        window.blocked_until = Some(match window.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        warn!(account_id = %account, ?scope, ?retry_after, "remote API throttled calls");
    }

    /// How long the account must wait before its next call, if blocked.
    pub async fn blocked_for(&self, account: &AccountId) -> Option<Duration> {
        self.check(account).await.err().and_then(|e| match e {
            SyncError::QuotaExceeded { retry_after } => Some(retry_after),
            _ => None,
        })
    }

    /// Run one remote call under a permit and the call timeout.
    ///
    /// Throttling responses are recorded against their scope and surface as
    /// `QuotaExceeded`; an elapsed timeout surfaces as `RemoteUnavailable`.
    /// A call rejected locally as `InvalidRequest` hands its reservation back.
    pub async fn run<T, F, Fut>(&self, account: &AccountId, call: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let permit = self.acquire(account).await?;
        let outcome = timeout(Duration::from_secs(self.settings.call_timeout_secs), call()).await;

        // A request that failed to build never reached the API.
        if let Ok(Err(RemoteError::InvalidRequest(_))) = &outcome {
            self.release(permit).await;
        } else {
            drop(permit);
        }

        match outcome {
            Err(_) => Err(SyncError::RemoteUnavailable(format!(
                "call timed out after {}s",
                self.settings.call_timeout_secs
            ))),
            Ok(Err(RemoteError::Throttled { retry_after, scope })) => {
                self.record_throttle(account, scope, retry_after).await;
                Err(SyncError::QuotaExceeded { retry_after })
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(value)) => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(account_limit: usize, app_limit: usize) -> RateLimitCoordinator {
        RateLimitCoordinator::new(RateLimitSettings {
            account_limit,
            app_limit,
            window_secs: 60,
            max_in_flight_per_account: 4,
            call_timeout_secs: 5,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn account_window_slides() {
        let limiter = limiter(2, 100);
        let a1 = AccountId::from("a1");
        drop(limiter.acquire(&a1).await.unwrap());
        tokio::time::advance(Duration::from_secs(10)).await;
        drop(limiter.acquire(&a1).await.unwrap());

        match limiter.acquire(&a1).await {
            Err(SyncError::QuotaExceeded { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(50))
            }
            other => panic!("expected quota error, got {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(limiter.acquire(&a1).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn app_window_is_shared_between_accounts() {
        let limiter = limiter(10, 2);
        drop(limiter.acquire(&AccountId::from("a1")).await.unwrap());
        drop(limiter.acquire(&AccountId::from("a2")).await.unwrap());
        assert!(matches!(
            limiter.acquire(&AccountId::from("a3")).await,
            Err(SyncError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn released_reservation_frees_the_window() {
        let limiter = limiter(1, 10);
        let a1 = AccountId::from("a1");
        let permit = limiter.acquire(&a1).await.unwrap();
        limiter.release(permit).await;
        assert!(limiter.acquire(&a1).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn application_throttle_blocks_everyone() {
        let limiter = limiter(10, 10);
        let a1 = AccountId::from("a1");
        limiter
            .record_throttle(&a1, ThrottleScope::Application, Duration::from_secs(5))
            .await;
        assert!(limiter.acquire(&AccountId::from("a2")).await.is_err());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.acquire(&AccountId::from("a2")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_calls_are_capped_per_account() {
        let limiter = Arc::new(limiter(100, 100));
        let a1 = AccountId::from("a1");
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(limiter.acquire(&a1).await.unwrap());
        }

        let waiter = {
            let limiter = limiter.clone();
            let a1 = a1.clone();
            tokio::spawn(async move { limiter.acquire(&a1).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // Another account is not affected by a1's in-flight calls.
        assert!(limiter.acquire(&AccountId::from("a2")).await.is_ok());

        held.pop();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn run_records_throttling_and_maps_timeouts() {
        let limiter = limiter(100, 100);
        let a1 = AccountId::from("a1");

        let result: SyncResult<()> = limiter
            .run(&a1, || async {
                Err(RemoteError::Throttled {
                    retry_after: Duration::from_secs(12),
                    scope: ThrottleScope::Account,
                })
            })
            .await;
        assert!(matches!(result, Err(SyncError::QuotaExceeded { .. })));
        assert_eq!(limiter.blocked_for(&a1).await, Some(Duration::from_secs(12)));

        tokio::time::advance(Duration::from_secs(12)).await;
        let result: SyncResult<()> = limiter
            .run(&a1, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(SyncError::RemoteUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn locally_invalid_call_gives_back_its_reservation() {
        let limiter = limiter(1, 10);
        let a1 = AccountId::from("a1");

        let result: SyncResult<()> = limiter
            .run(&a1, || async {
                Err(RemoteError::InvalidRequest("bad delta url".into()))
            })
            .await;
        match &result {
            Err(e) => assert!(!e.is_transient(), "unexpected transient error {:?}", e),
            Ok(()) => panic!("expected an error"),
        }
        assert!(limiter.acquire(&a1).await.is_ok());

        // A call that reached the API keeps its slot.
        let a2 = AccountId::from("a2");
        let result: SyncResult<()> = limiter
            .run(&a2, || async {
                Err(RemoteError::InvalidResponse("garbled".into()))
            })
            .await;
        assert!(matches!(result, Err(SyncError::RemoteUnavailable(_))));
        assert!(matches!(
            limiter.acquire(&a2).await,
            Err(SyncError::QuotaExceeded { .. })
        ));
    }
}
