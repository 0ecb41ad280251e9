//! Incremental mailbox synchronization over Graph delta queries.
//!
//! A cycle is split in two: `fetch` pages through the delta query and
//! returns every change without persisting anything, `commit` stores the
//! new delta link. Callers that forward items commit only after the items
//! are safely delivered, so a crash in between replays the same changes.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::graph_api::{DeltaPage, DeltaRequest, GraphMessage, MailApi};
use crate::rate_limit::RateLimitCoordinator;
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::token::TokenLifecycleManager;
use crate::types::{Account, AccountId, MailItem, SyncCursor};

/// Changes of one folder since the stored cursor, not yet committed.
#[derive(Debug, Clone)]
pub struct FetchedDelta {
    pub account_id: AccountId,
    pub folder: String,
    pub items: Vec<MailItem>,
    /// The stored cursor was rejected and a full listing replaced it.
    pub had_full_resync: bool,
    delta_link: String,
    base: Option<SyncCursor>,
}

impl FetchedDelta {
    pub fn base_cursor(&self) -> Option<&SyncCursor> {
        self.base.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub items: Vec<MailItem>,
    pub had_full_resync: bool,
    pub cursor: SyncCursor,
}

pub struct DeltaSyncEngine {
    repo: Arc<dyn Repository>,
    api: Arc<dyn MailApi>,
    tokens: Arc<TokenLifecycleManager>,
    limiter: Arc<RateLimitCoordinator>,
    retry: RetryPolicy,
    page_size: u32,
}

impl DeltaSyncEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        api: Arc<dyn MailApi>,
        tokens: Arc<TokenLifecycleManager>,
        limiter: Arc<RateLimitCoordinator>,
        retry: RetryPolicy,
        page_size: u32,
    ) -> Self {
        Self {
            repo,
            api,
            tokens,
            limiter,
            retry,
            page_size,
        }
    }

    /// Fetch and commit in one step, for callers that do not forward.
    pub async fn sync(&self, account_id: &AccountId, folder: &str) -> SyncResult<SyncOutcome> {
        let fetched = self.fetch(account_id, folder).await?;
        let cursor = self.commit(&fetched).await?;
        Ok(SyncOutcome {
            items: fetched.items,
            had_full_resync: fetched.had_full_resync,
            cursor,
        })
    }

    pub async fn fetch(&self, account_id: &AccountId, folder: &str) -> SyncResult<FetchedDelta> {
        let account = match self.repo.load_account(account_id).await? {
            Some(account) if account.active => account,
            _ => return Err(SyncError::AccountNotFound(account_id.clone())),
        };
        let base = self.repo.load_cursor(account_id, folder).await?;

        let (messages, delta_link, had_full_resync) = match &base {
            None => {
                debug!(account_id = %account_id, folder, "no cursor, listing folder");
                let (messages, link) = self.full_listing(&account, folder).await?;
                (messages, link, false)
            }
            Some(cursor) => {
                match self
                    .collect(&account, DeltaRequest::Link(cursor.delta_link.clone()))
                    .await
                {
                    Ok((messages, link)) => (messages, link, false),
                    Err(SyncError::CursorExpired) => {
                        warn!(
                            account_id = %account_id,
                            folder,
                            sequence = cursor.sequence,
                            "sync cursor expired, incremental history lost; running full resync"
                        );
                        let (messages, link) = self.full_listing(&account, folder).await?;
                        (messages, link, true)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let items: Vec<MailItem> = messages
            .into_iter()
            .map(|m| m.into_mail_item(account_id, folder))
            .collect();
        info!(
            account_id = %account_id,
            folder,
            changes = items.len(),
            had_full_resync,
            "delta fetched"
        );

        Ok(FetchedDelta {
            account_id: account_id.clone(),
            folder: folder.to_string(),
            items,
            had_full_resync,
            delta_link,
            base,
        })
    }

    /// Persist the cursor of a fetched delta.
    ///
    /// Fails if the stored cursor moved since the fetch; a cursor never
    /// goes backwards. The sequence always grows and the epoch grows on a
    /// full resync.
    pub async fn commit(&self, fetched: &FetchedDelta) -> SyncResult<SyncCursor> {
        let current = self
            .repo
            .load_cursor(&fetched.account_id, &fetched.folder)
            .await?;
        let current_sequence = current.as_ref().map(|c| c.sequence);
        let base_sequence = fetched.base.as_ref().map(|c| c.sequence);
        if current_sequence != base_sequence {
            return Err(SyncError::InvalidState(format!(
                "cursor for {}/{} moved from {:?} to {:?} during the cycle",
                fetched.account_id, fetched.folder, base_sequence, current_sequence
            )));
        }

        let (sequence, epoch) = match &fetched.base {
            Some(base) if fetched.had_full_resync => (base.sequence + 1, base.epoch + 1),
            Some(base) => (base.sequence + 1, base.epoch),
            None => (1, 0),
        };
        let cursor = SyncCursor {
            account_id: fetched.account_id.clone(),
            folder: fetched.folder.clone(),
            delta_link: fetched.delta_link.clone(),
            sequence,
            epoch,
            updated_at: Utc::now(),
        };
        self.repo.save_cursor(&cursor).await?;
        debug!(account_id = %cursor.account_id, folder = %cursor.folder, sequence, epoch, "cursor committed");
        Ok(cursor)
    }

    async fn full_listing(
        &self,
        account: &Account,
        folder: &str,
    ) -> SyncResult<(Vec<GraphMessage>, String)> {
        let request = DeltaRequest::Start {
            user_id: account.user_id.clone(),
            folder: folder.to_string(),
            page_size: self.page_size,
        };
        let (mut messages, link) = self
            .collect(account, request)
            .await
            .map_err(|e| match e {
                SyncError::CursorExpired => SyncError::RemoteUnavailable(format!(
                    "full listing of {} was refused as an expired delta",
                    folder
                )),
                e => e,
            })?;
        // Stable server id order for the initial snapshot.
        messages.sort_by(|a, b| a.id.cmp(&b.id));
        Ok((messages, link))
    }

    /// Follow next links until the delta link; nothing is returned unless
    /// every page arrived.
    async fn collect(
        &self,
        account: &Account,
        first: DeltaRequest,
    ) -> SyncResult<(Vec<GraphMessage>, String)> {
        let mut request = first;
        let mut messages = Vec::new();
        let mut pages = 0usize;

        loop {
            let page = self.page(&account.id, &request).await?;
            pages += 1;
            messages.extend(page.value);

            match (page.next_link, page.delta_link) {
                (Some(next), _) => request = DeltaRequest::Link(next),
                (None, Some(delta)) => {
                    debug!(account_id = %account.id, pages, "delta pages exhausted");
                    return Ok((messages, delta));
                }
                (None, None) => {
                    return Err(SyncError::RemoteUnavailable(
                        "delta page carried neither next nor delta link".to_string(),
                    ))
                }
            }
        }
    }

    /// One page, with transient retries and one reactive token refresh.
    async fn page(&self, account_id: &AccountId, request: &DeltaRequest) -> SyncResult<DeltaPage> {
        let api = &self.api;
        let limiter = &self.limiter;
        self.retry
            .retry("delta page", || {
                self.tokens.with_token(account_id, move |token| async move {
                    limiter
                        .run(account_id, || api.delta_page(&token, request))
                        .await
                })
            })
            .await
    }
}
