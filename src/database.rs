use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use crate::crypto::Encryptor;
use crate::error::{SyncError, SyncResult};
use crate::repository::Repository;
use crate::types::{
    Account, AccountId, AuthEvent, Credential, ForwardFailure, MailItem, PendingAuthorization,
    PruneReport, Subscription, SyncCursor, SyncRun,
};

/// SQLite-backed repository. Credential material is encrypted before it is
/// written and decrypted after it is read.
pub struct Database {
    pool: SqlitePool,
    encryptor: Arc<dyn Encryptor>,
}

impl Database {
    pub async fn new(database_url: &str, encryptor: Arc<dyn Encryptor>) -> SyncResult<Self> {
        // Use connect_with to ensure the database file is created if it doesn't exist
        let options = SqliteConnectOptions::new()
            .filename(database_url.trim_start_matches("sqlite:"))
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        let db = Database { pool, encryptor };
        db.create_tables().await?;
        Ok(db)
    }

    /// Private in-memory database; one connection so every query sees it.
    pub async fn in_memory(encryptor: Arc<dyn Encryptor>) -> SyncResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            // The database lives only as long as its single connection.
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Database { pool, encryptor };
        db.create_tables().await?;
        Ok(db)
    }

    async fn create_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                flow TEXT NOT NULL,
                scopes TEXT NOT NULL,
                state TEXT NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                last_authenticated_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                account_id TEXT PRIMARY KEY,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                token_type TEXT NOT NULL,
                expires_at DATETIME NOT NULL,
                scopes TEXT NOT NULL,
                issued_at DATETIME NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_authorizations (
                account_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                account_id TEXT NOT NULL,
                folder TEXT NOT NULL,
                delta_link TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                epoch INTEGER NOT NULL,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (account_id, folder)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                account_id TEXT PRIMARY KEY,
                subscription_id TEXT NOT NULL UNIQUE,
                resource TEXT NOT NULL,
                secret TEXT NOT NULL,
                state TEXT NOT NULL,
                expires_at DATETIME NOT NULL,
                window_started_at DATETIME NOT NULL,
                renew_at DATETIME NOT NULL,
                renewal_count INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                account_id TEXT NOT NULL,
                id TEXT NOT NULL,
                folder TEXT NOT NULL,
                internet_message_id TEXT,
                subject TEXT,
                sender_address TEXT,
                sender_name TEXT,
                recipients TEXT NOT NULL,
                body_preview TEXT,
                importance TEXT,
                is_read BOOLEAN DEFAULT FALSE,
                has_attachments BOOLEAN DEFAULT FALSE,
                received_at DATETIME,
                sent_at DATETIME,
                synced_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (account_id, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS forwarded_messages (
                account_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                forwarded_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (account_id, message_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auth_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                success BOOLEAN NOT NULL,
                detail TEXT,
                at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                folder TEXT NOT NULL,
                items_found INTEGER NOT NULL,
                new_items INTEGER NOT NULL,
                full_resync BOOLEAN NOT NULL,
                duration_ms INTEGER NOT NULL,
                success BOOLEAN NOT NULL,
                error TEXT,
                at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS forward_failures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                payload TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                last_attempt_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Databases created before failures were replayed lack these columns.
        let replay_columns: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pragma_table_info('forward_failures') WHERE name = 'retry_count'",
        )
        .fetch_one(&self.pool)
        .await?;
        if replay_columns.0 == 0 {
            sqlx::query("ALTER TABLE forward_failures ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0")
                .execute(&self.pool)
                .await?;
            sqlx::query("ALTER TABLE forward_failures ADD COLUMN last_attempt_at DATETIME")
                .execute(&self.pool)
                .await?;
        }

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_auth_events_account ON auth_events(account_id, at DESC)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_runs_account ON sync_runs(account_id, at DESC)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Row counts per table, for the CLI status output.
    pub async fn stats(&self) -> SyncResult<Vec<(String, i64)>> {
        let mut stats = Vec::new();
        for table in [
            "accounts",
            "messages",
            "forwarded_messages",
            "forward_failures",
            "auth_events",
            "sync_runs",
        ] {
            let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&self.pool)
                .await?;
            stats.push((table.to_string(), count.0));
        }
        Ok(stats)
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: &str) -> SyncResult<T> {
    value.parse::<T>().map_err(SyncError::Storage)
}

fn account_from_row(row: &SqliteRow) -> SyncResult<Account> {
    let id: String = row.try_get("id")?;
    let flow: String = row.try_get("flow")?;
    let state: String = row.try_get("state")?;
    let scopes: String = row.try_get("scopes")?;
    Ok(Account {
        id: AccountId::from(id),
        email: row.try_get("email")?,
        user_id: row.try_get("user_id")?,
        tenant_id: row.try_get("tenant_id")?,
        flow: parse_column(&flow)?,
        scopes: serde_json::from_str(&scopes)?,
        state: parse_column(&state)?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_authenticated_at: row.try_get("last_authenticated_at")?,
    })
}

fn subscription_from_row(row: &SqliteRow) -> SyncResult<Subscription> {
    let account_id: String = row.try_get("account_id")?;
    let state: String = row.try_get("state")?;
    let renewal_count: i64 = row.try_get("renewal_count")?;
    let failures: i64 = row.try_get("consecutive_failures")?;
    Ok(Subscription {
        id: row.try_get("subscription_id")?,
        account_id: AccountId::from(account_id),
        resource: row.try_get("resource")?,
        secret: row.try_get("secret")?,
        state: parse_column(&state)?,
        expires_at: row.try_get("expires_at")?,
        window_started_at: row.try_get("window_started_at")?,
        renew_at: row.try_get("renew_at")?,
        renewal_count: renewal_count as u32,
        consecutive_failures: failures as u32,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Repository for Database {
    async fn load_account(&self, id: &AccountId) -> SyncResult<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_account_by_email(&self, email: &str) -> SyncResult<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE lower(email) = lower(?)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_accounts(&self) -> SyncResult<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn save_account(&self, account: &Account) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, email, user_id, tenant_id, flow, scopes, state, active,
                created_at, updated_at, last_authenticated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                user_id = excluded.user_id,
                tenant_id = excluded.tenant_id,
                flow = excluded.flow,
                scopes = excluded.scopes,
                state = excluded.state,
                active = excluded.active,
                updated_at = excluded.updated_at,
                last_authenticated_at = excluded.last_authenticated_at
            "#,
        )
        .bind(account.id.as_str())
        .bind(&account.email)
        .bind(&account.user_id)
        .bind(&account.tenant_id)
        .bind(account.flow.as_str())
        .bind(serde_json::to_string(&account.scopes)?)
        .bind(account.state.as_str())
        .bind(account.active)
        .bind(account.created_at)
        .bind(account.updated_at)
        .bind(account.last_authenticated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_credential(&self, id: &AccountId) -> SyncResult<Option<Credential>> {
        let row = sqlx::query("SELECT * FROM credentials WHERE account_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let access_token: String = row.try_get("access_token")?;
        let refresh_token: Option<String> = row.try_get("refresh_token")?;
        let scopes: String = row.try_get("scopes")?;
        Ok(Some(Credential {
            access_token: self.encryptor.decrypt(&access_token)?,
            refresh_token: refresh_token
                .map(|sealed| self.encryptor.decrypt(&sealed))
                .transpose()?,
            token_type: row.try_get("token_type")?,
            expires_at: row.try_get("expires_at")?,
            scopes: serde_json::from_str(&scopes)?,
            issued_at: row.try_get("issued_at")?,
        }))
    }

    async fn save_credential(&self, id: &AccountId, credential: &Credential) -> SyncResult<()> {
        let access_token = self.encryptor.encrypt(&credential.access_token)?;
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .map(|plain| self.encryptor.encrypt(plain))
            .transpose()?;

        // Whole-row replacement; a credential is never patched field by field.
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO credentials (
                account_id, access_token, refresh_token, token_type, expires_at, scopes, issued_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(access_token)
        .bind(refresh_token)
        .bind(&credential.token_type)
        .bind(credential.expires_at)
        .bind(serde_json::to_string(&credential.scopes)?)
        .bind(credential.issued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_credential(&self, id: &AccountId) -> SyncResult<()> {
        sqlx::query("DELETE FROM credentials WHERE account_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_pending_authorization(
        &self,
        id: &AccountId,
    ) -> SyncResult<Option<PendingAuthorization>> {
        let row = sqlx::query("SELECT data FROM pending_authorizations WHERE account_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let sealed: String = row.try_get("data")?;
                let data = self.encryptor.decrypt(&sealed)?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn save_pending_authorization(
        &self,
        id: &AccountId,
        pending: &PendingAuthorization,
    ) -> SyncResult<()> {
        // Holds a PKCE verifier or device code, so it is sealed too.
        let sealed = self.encryptor.encrypt(&serde_json::to_string(pending)?)?;
        sqlx::query(
            "INSERT OR REPLACE INTO pending_authorizations (account_id, data, created_at) VALUES (?, ?, CURRENT_TIMESTAMP)",
        )
        .bind(id.as_str())
        .bind(sealed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_pending_authorization(&self, id: &AccountId) -> SyncResult<()> {
        sqlx::query("DELETE FROM pending_authorizations WHERE account_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_cursor(&self, id: &AccountId, folder: &str) -> SyncResult<Option<SyncCursor>> {
        let row = sqlx::query(
            "SELECT delta_link, sequence, epoch, updated_at FROM sync_cursors WHERE account_id = ? AND folder = ?",
        )
        .bind(id.as_str())
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let sequence: i64 = row.try_get("sequence")?;
            let epoch: i64 = row.try_get("epoch")?;
            Ok(Some(SyncCursor {
                account_id: id.clone(),
                folder: folder.to_string(),
                delta_link: row.try_get("delta_link")?,
                sequence: sequence as u64,
                epoch: epoch as u32,
                updated_at: row.try_get("updated_at")?,
            }))
        } else {
            Ok(None)
        }
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (account_id, folder, delta_link, sequence, epoch, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, folder) DO UPDATE SET
                delta_link = excluded.delta_link,
                sequence = excluded.sequence,
                epoch = excluded.epoch,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(cursor.account_id.as_str())
        .bind(&cursor.folder)
        .bind(&cursor.delta_link)
        .bind(cursor.sequence as i64)
        .bind(cursor.epoch as i64)
        .bind(cursor.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_cursor(&self, id: &AccountId, folder: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM sync_cursors WHERE account_id = ? AND folder = ?")
            .bind(id.as_str())
            .bind(folder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_subscription(&self, id: &AccountId) -> SyncResult<Option<Subscription>> {
        let row = sqlx::query("SELECT * FROM subscriptions WHERE account_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn find_subscription(&self, subscription_id: &str) -> SyncResult<Option<Subscription>> {
        let row = sqlx::query("SELECT * FROM subscriptions WHERE subscription_id = ?")
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn save_subscription(&self, subscription: &Subscription) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO subscriptions (
                account_id, subscription_id, resource, secret, state, expires_at,
                window_started_at, renew_at, renewal_count, consecutive_failures, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(subscription.account_id.as_str())
        .bind(&subscription.id)
        .bind(&subscription.resource)
        .bind(&subscription.secret)
        .bind(subscription.state.as_str())
        .bind(subscription.expires_at)
        .bind(subscription.window_started_at)
        .bind(subscription.renew_at)
        .bind(subscription.renewal_count as i64)
        .bind(subscription.consecutive_failures as i64)
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_subscription(&self, id: &AccountId) -> SyncResult<()> {
        sqlx::query("DELETE FROM subscriptions WHERE account_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_message(&self, item: &MailItem) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (
                account_id, id, folder, internet_message_id, subject, sender_address,
                sender_name, recipients, body_preview, importance, is_read,
                has_attachments, received_at, sent_at, synced_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(account_id, id) DO UPDATE SET
                folder = excluded.folder,
                internet_message_id = excluded.internet_message_id,
                subject = excluded.subject,
                sender_address = excluded.sender_address,
                sender_name = excluded.sender_name,
                recipients = excluded.recipients,
                body_preview = excluded.body_preview,
                importance = excluded.importance,
                is_read = excluded.is_read,
                has_attachments = excluded.has_attachments,
                received_at = excluded.received_at,
                sent_at = excluded.sent_at,
                synced_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(item.account_id.as_str())
        .bind(&item.id)
        .bind(&item.folder)
        .bind(&item.internet_message_id)
        .bind(&item.subject)
        .bind(&item.sender_address)
        .bind(&item.sender_name)
        .bind(serde_json::to_string(&item.recipients)?)
        .bind(&item.body_preview)
        .bind(&item.importance)
        .bind(item.is_read)
        .bind(item.has_attachments)
        .bind(item.received_at)
        .bind(item.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_message(&self, id: &AccountId, message_id: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM messages WHERE account_id = ? AND id = ?")
            .bind(id.as_str())
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_forwarded(&self, id: &AccountId, message_id: &str) -> SyncResult<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM forwarded_messages WHERE account_id = ? AND message_id = ?",
        )
        .bind(id.as_str())
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 > 0)
    }

    async fn mark_forwarded(&self, id: &AccountId, message_id: &str) -> SyncResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO forwarded_messages (account_id, message_id, forwarded_at) VALUES (?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(message_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_auth_event(&self, event: &AuthEvent) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO auth_events (account_id, kind, success, detail, at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.account_id.as_str())
        .bind(event.kind.as_str())
        .bind(event.success)
        .bind(&event.detail)
        .bind(event.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn auth_events(&self, id: &AccountId, limit: u32) -> SyncResult<Vec<AuthEvent>> {
        let rows = sqlx::query(
            "SELECT kind, success, detail, at FROM auth_events WHERE account_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind")?;
            events.push(AuthEvent {
                account_id: id.clone(),
                kind: parse_column(&kind)?,
                success: row.try_get("success")?,
                detail: row.try_get("detail")?,
                at: row.try_get("at")?,
            });
        }
        Ok(events)
    }

    async fn record_sync_run(&self, run: &SyncRun) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (
                account_id, folder, items_found, new_items, full_resync,
                duration_ms, success, error, at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.account_id.as_str())
        .bind(&run.folder)
        .bind(run.items_found as i64)
        .bind(run.new_items as i64)
        .bind(run.full_resync)
        .bind(run.duration_ms)
        .bind(run.success)
        .bind(&run.error)
        .bind(run.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_forward_failure(
        &self,
        id: &AccountId,
        message_id: &str,
        reason: &str,
        payload: &str,
    ) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO forward_failures (account_id, message_id, reason, payload, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(message_id)
        .bind(reason)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn forward_failures(&self, limit: u32) -> SyncResult<Vec<ForwardFailure>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, message_id, reason, payload, retry_count, created_at, last_attempt_at
            FROM forward_failures ORDER BY id LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(forward_failure_from_row).collect()
    }

    async fn replayable_forward_failures(
        &self,
        max_replays: u32,
        limit: u32,
    ) -> SyncResult<Vec<ForwardFailure>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, message_id, reason, payload, retry_count, created_at, last_attempt_at
            FROM forward_failures WHERE retry_count < ? ORDER BY id LIMIT ?
            "#,
        )
        .bind(max_replays as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(forward_failure_from_row).collect()
    }

    async fn record_forward_replay(&self, failure_id: i64, reason: &str) -> SyncResult<()> {
        sqlx::query(
            "UPDATE forward_failures SET retry_count = retry_count + 1, reason = ?, last_attempt_at = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(failure_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_forward_failure(&self, failure_id: i64) -> SyncResult<()> {
        sqlx::query("DELETE FROM forward_failures WHERE id = ?")
            .bind(failure_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_history(
        &self,
        history_before: DateTime<Utc>,
        messages_before: DateTime<Utc>,
        max_replays: u32,
    ) -> SyncResult<PruneReport> {
        let mut tx = self.pool.begin().await?;

        let auth_events = sqlx::query("DELETE FROM auth_events WHERE at < ?")
            .bind(history_before)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let sync_runs = sqlx::query("DELETE FROM sync_runs WHERE at < ?")
            .bind(history_before)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let messages = sqlx::query("DELETE FROM messages WHERE received_at < ?")
            .bind(messages_before)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        // Ledger rows go once their message is gone and they are old enough
        // that a late update is unlikely.
        let ledger = sqlx::query(
            r#"
            DELETE FROM forwarded_messages
            WHERE forwarded_at < ?
              AND NOT EXISTS (
                SELECT 1 FROM messages m
                WHERE m.account_id = forwarded_messages.account_id
                  AND m.id = forwarded_messages.message_id
              )
            "#,
        )
        .bind(messages_before)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let failures =
            sqlx::query("DELETE FROM forward_failures WHERE created_at < ? AND retry_count >= ?")
                .bind(history_before)
                .bind(max_replays as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        tx.commit().await?;
        Ok(PruneReport {
            auth_events,
            sync_runs,
            messages,
            ledger,
            failures,
        })
    }
}

fn forward_failure_from_row(row: &SqliteRow) -> SyncResult<ForwardFailure> {
    let account_id: String = row.try_get("account_id")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    Ok(ForwardFailure {
        id: row.try_get("id")?,
        account_id: AccountId::from(account_id),
        message_id: row.try_get("message_id")?,
        reason: row.try_get("reason")?,
        payload: row.try_get("payload")?,
        retry_count: retry_count.max(0) as u32,
        created_at: row.try_get("created_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AesGcmEncryptor;
    use crate::types::{AuthEventKind, AuthFlow, ChangeKind, LifecycleState, SubscriptionState};
    use chrono::Duration;

    async fn setup_test_db() -> Database {
        Database::in_memory(Arc::new(AesGcmEncryptor::new(&[1u8; 32])))
            .await
            .unwrap()
    }

    fn sample_account(id: &str) -> Account {
        let now = Utc::now();
        Account {
            id: AccountId::from(id),
            email: format!("{}@example.com", id),
            user_id: format!("user-{}", id),
            tenant_id: "tenant".to_string(),
            flow: AuthFlow::DeviceCode,
            scopes: vec!["Mail.Read".to_string()],
            state: LifecycleState::Unauthenticated,
            active: true,
            created_at: now,
            updated_at: now,
            last_authenticated_at: None,
        }
    }

    fn sample_item(account_id: &AccountId, id: &str) -> MailItem {
        MailItem {
            id: id.to_string(),
            account_id: account_id.clone(),
            folder: "inbox".to_string(),
            change: ChangeKind::Upserted,
            internet_message_id: None,
            subject: Some("Hello".to_string()),
            sender_address: Some("a@example.com".to_string()),
            sender_name: None,
            recipients: vec!["b@example.com".to_string()],
            body_preview: None,
            importance: Some("normal".to_string()),
            is_read: false,
            has_attachments: false,
            received_at: Some(Utc::now()),
            sent_at: None,
        }
    }

    #[tokio::test]
    async fn test_account_operations() {
        let db = setup_test_db().await;
        let mut account = sample_account("a1");
        db.save_account(&account).await.unwrap();

        account.state = LifecycleState::Authenticated;
        account.active = false;
        db.save_account(&account).await.unwrap();

        let loaded = db.load_account(&account.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, LifecycleState::Authenticated);
        assert!(!loaded.active);
        assert_eq!(loaded.scopes, vec!["Mail.Read".to_string()]);

        let by_email = db.find_account_by_email("A1@EXAMPLE.COM").await.unwrap();
        assert_eq!(by_email.map(|a| a.id), Some(account.id.clone()));
        assert_eq!(db.list_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_credentials_are_encrypted_at_rest() {
        let db = setup_test_db().await;
        let id = AccountId::from("a1");
        let now = Utc::now();
        let credential = Credential {
            access_token: "plain-access".to_string(),
            refresh_token: Some("plain-refresh".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: now + Duration::hours(1),
            scopes: vec!["Mail.Read".to_string()],
            issued_at: now,
        };
        db.save_credential(&id, &credential).await.unwrap();

        let raw: (String, Option<String>) = sqlx::query_as(
            "SELECT access_token, refresh_token FROM credentials WHERE account_id = ?",
        )
        .bind(id.as_str())
        .fetch_one(&db.pool)
        .await
        .unwrap();
        assert!(!raw.0.contains("plain-access"));
        assert!(!raw.1.unwrap().contains("plain-refresh"));

        let loaded = db.load_credential(&id).await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "plain-access");
        assert_eq!(loaded.refresh_token.as_deref(), Some("plain-refresh"));

        db.delete_credential(&id).await.unwrap();
        assert!(db.load_credential(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cursor_operations() {
        let db = setup_test_db().await;
        let id = AccountId::from("a1");
        let cursor = SyncCursor {
            account_id: id.clone(),
            folder: "inbox".to_string(),
            delta_link: "https://graph/delta?$deltatoken=1".to_string(),
            sequence: 1,
            epoch: 0,
            updated_at: Utc::now(),
        };
        db.save_cursor(&cursor).await.unwrap();

        let next = SyncCursor {
            delta_link: "https://graph/delta?$deltatoken=2".to_string(),
            sequence: 2,
            ..cursor.clone()
        };
        db.save_cursor(&next).await.unwrap();

        let loaded = db.load_cursor(&id, "inbox").await.unwrap().unwrap();
        assert_eq!(loaded.sequence, 2);
        assert!(loaded.delta_link.ends_with("=2"));
        assert!(db.load_cursor(&id, "sentitems").await.unwrap().is_none());

        db.delete_cursor(&id, "inbox").await.unwrap();
        assert!(db.load_cursor(&id, "inbox").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscription_lookup_by_remote_id() {
        let db = setup_test_db().await;
        let now = Utc::now();
        let subscription = Subscription {
            id: "sub-1".to_string(),
            account_id: AccountId::from("a1"),
            resource: "users/u1/mailFolders('inbox')/messages".to_string(),
            secret: "s3cret".to_string(),
            state: SubscriptionState::Active,
            expires_at: now + Duration::hours(70),
            window_started_at: now,
            renew_at: now + Duration::hours(52),
            renewal_count: 0,
            consecutive_failures: 0,
            created_at: now,
        };
        db.save_subscription(&subscription).await.unwrap();

        let found = db.find_subscription("sub-1").await.unwrap().unwrap();
        assert_eq!(found.account_id, AccountId::from("a1"));
        assert_eq!(found.state, SubscriptionState::Active);
        assert!(db.find_subscription("sub-2").await.unwrap().is_none());

        db.delete_subscription(&found.account_id).await.unwrap();
        assert!(db.load_subscription(&found.account_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forward_ledger_is_idempotent() {
        let db = setup_test_db().await;
        let id = AccountId::from("a1");
        assert!(!db.is_forwarded(&id, "m1").await.unwrap());
        db.mark_forwarded(&id, "m1").await.unwrap();
        db.mark_forwarded(&id, "m1").await.unwrap();
        assert!(db.is_forwarded(&id, "m1").await.unwrap());
        assert!(!db.is_forwarded(&AccountId::from("a2"), "m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_message_store_and_history() {
        let db = setup_test_db().await;
        let id = AccountId::from("a1");
        let item = sample_item(&id, "m1");
        db.upsert_message(&item).await.unwrap();
        db.upsert_message(&item).await.unwrap();
        let stats = db.stats().await.unwrap();
        assert!(stats.contains(&("messages".to_string(), 1)));

        db.delete_message(&id, "m1").await.unwrap();
        let stats = db.stats().await.unwrap();
        assert!(stats.contains(&("messages".to_string(), 0)));

        db.record_auth_event(&AuthEvent {
            account_id: id.clone(),
            kind: AuthEventKind::TokenRefresh,
            success: false,
            detail: Some("invalid_grant".to_string()),
            at: Utc::now(),
        })
        .await
        .unwrap();
        let events = db.auth_events(&id, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuthEventKind::TokenRefresh);

        db.record_forward_failure(&id, "m9", "400 bad payload", "{}")
            .await
            .unwrap();
        let failures = db.forward_failures(10).await.unwrap();
        assert_eq!(failures.len(), 1);
        db.delete_forward_failure(failures[0].id).await.unwrap();
        assert!(db.forward_failures(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replays_are_counted_until_exhausted() {
        let db = setup_test_db().await;
        let id = AccountId::from("a1");
        db.record_forward_failure(&id, "m1", "400 bad payload", "{}")
            .await
            .unwrap();
        let failure = db.forward_failures(10).await.unwrap().remove(0);
        assert_eq!(failure.retry_count, 0);
        assert!(failure.last_attempt_at.is_none());

        db.record_forward_replay(failure.id, "still 400").await.unwrap();
        let replayable = db.replayable_forward_failures(2, 10).await.unwrap();
        assert_eq!(replayable.len(), 1);
        assert_eq!(replayable[0].retry_count, 1);
        assert_eq!(replayable[0].reason, "still 400");
        assert!(replayable[0].last_attempt_at.is_some());

        db.record_forward_replay(failure.id, "still 400").await.unwrap();
        assert!(db.replayable_forward_failures(2, 10).await.unwrap().is_empty());
        assert_eq!(db.forward_failures(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prune_drops_old_history_but_keeps_recent_rows() {
        let db = setup_test_db().await;
        let id = AccountId::from("a1");
        let now = Utc::now();

        for at in [now - Duration::days(100), now] {
            db.record_auth_event(&AuthEvent {
                account_id: id.clone(),
                kind: AuthEventKind::TokenRefresh,
                success: true,
                detail: None,
                at,
            })
            .await
            .unwrap();
            db.record_sync_run(&SyncRun {
                account_id: id.clone(),
                folder: "inbox".to_string(),
                items_found: 1,
                new_items: 1,
                full_resync: false,
                duration_ms: 5,
                success: true,
                error: None,
                at,
            })
            .await
            .unwrap();
        }

        let mut old = sample_item(&id, "old");
        old.received_at = Some(now - Duration::days(100));
        let mut recent = sample_item(&id, "recent");
        recent.received_at = Some(now);
        db.upsert_message(&old).await.unwrap();
        db.upsert_message(&recent).await.unwrap();
        db.mark_forwarded(&id, "old").await.unwrap();
        db.mark_forwarded(&id, "recent").await.unwrap();

        db.record_forward_failure(&id, "m9", "400", "{}").await.unwrap();
        let failure = db.forward_failures(10).await.unwrap().remove(0);
        db.record_forward_replay(failure.id, "400").await.unwrap();

        let report = db
            .prune_history(now - Duration::days(90), now - Duration::days(90), 1)
            .await
            .unwrap();
        assert_eq!(report.auth_events, 1);
        assert_eq!(report.sync_runs, 1);
        assert_eq!(report.messages, 1);
        // Ledger rows were written just now, so they stay.
        assert_eq!(report.ledger, 0);
        assert_eq!(report.failures, 0);

        assert_eq!(db.auth_events(&id, 10).await.unwrap().len(), 1);
        assert!(db.is_forwarded(&id, "old").await.unwrap());

        let report = db
            .prune_history(now - Duration::days(90), now + Duration::days(1), 1)
            .await
            .unwrap();
        assert_eq!(report.messages, 1);
        assert_eq!(report.ledger, 2);
        assert!(!db.is_forwarded(&id, "old").await.unwrap());
    }
}
