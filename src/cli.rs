use clap::{Parser, Subcommand};
use std::error::Error;
use std::io::{BufRead, Read};
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::app::{start_service, Engine, RunningService};
use crate::config::SecuritySettings;
use crate::crypto::clear_stored_key;
use crate::notifications::NotificationIngress;
use crate::repository::Repository;
use crate::sync::{SyncCommand, SyncEvent};
use crate::types::{AccountId, AuthFlow, NewAccount, PendingAction};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $GRAPHSYNC_CONFIG, then ./graphsync.toml).
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sync service until interrupted.
    Run,
    /// Register a mailbox.
    Register {
        #[clap(long)]
        email: String,
        /// Mailbox owner id (object id or UPN) used in Graph paths.
        #[clap(long)]
        user_id: String,
        #[clap(long)]
        tenant: Option<String>,
        /// `code` or `device`.
        #[clap(long, default_value = "code")]
        flow: AuthFlow,
    },
    /// Log an account in with its configured flow.
    Login {
        account: String,
        /// Redirect URL from the browser, skipping the prompt.
        #[clap(long)]
        redirect_url: Option<String>,
    },
    /// Exchange the refresh token now.
    Refresh { account: String },
    /// Drop stored credentials; the account must log in again.
    Revoke { account: String },
    /// Cancel the subscription and deactivate the account.
    Deactivate { account: String },
    /// List accounts with their token status.
    Accounts,
    /// Run one sync cycle for an account, or for all of them.
    Sync { account: Option<String> },
    /// Delete an account's push subscription.
    Unsubscribe { account: String },
    /// Recreate an account's subscription with a new client secret.
    RotateSecret { account: String },
    /// Feed a webhook payload (file or stdin) through the ingress.
    Notify { file: Option<PathBuf> },
    /// Show the forwarding failure queue.
    Failures {
        /// Remove an entry after it was handled.
        #[clap(long)]
        clear: Option<i64>,
        /// Forward queued entries again, up to `forwarder.max_replays` times each.
        #[clap(long)]
        retry: bool,
        #[clap(long, default_value_t = 50)]
        limit: u32,
    },
    /// Delete history and messages past their retention period.
    Prune,
    /// Remove the credential encryption key from the OS keyring.
    ClearKey,
}

pub type CliResult = Result<(), Box<dyn Error>>;

pub fn handle_key_clear(security: &SecuritySettings) -> CliResult {
    if let Err(e) = clear_stored_key(security) {
        eprintln!("Failed to delete the encryption key from the keyring: {}", e);
    } else {
        println!("Encryption key removed from keyring. Stored credentials are now unreadable.");
    }
    Ok(())
}

pub async fn execute(engine: &Engine, command: Command) -> CliResult {
    match command {
        Command::Run => run(engine).await,
        Command::Register {
            email,
            user_id,
            tenant,
            flow,
        } => {
            let account = engine
                .tokens
                .register(NewAccount {
                    email,
                    user_id,
                    tenant_id: tenant,
                    flow,
                    scopes: Vec::new(),
                })
                .await?;
            println!("Registered {} as {}", account.email, account.id);
            Ok(())
        }
        Command::Login {
            account,
            redirect_url,
        } => login(engine, &AccountId::from(account), redirect_url).await,
        Command::Refresh { account } => {
            let id = AccountId::from(account);
            let current = engine.tokens.get_valid_token(&id).await?;
            let fresh = engine.tokens.refresh_after_rejection(&id, &current).await?;
            println!("Token refreshed, valid until {}", fresh.expires_at);
            Ok(())
        }
        Command::Revoke { account } => {
            engine.tokens.revoke(&AccountId::from(account)).await?;
            println!("Credentials revoked");
            Ok(())
        }
        Command::Deactivate { account } => {
            let id = AccountId::from(account);
            engine.subscriptions.cancel_subscription(&id).await?;
            engine.tokens.deactivate(&id).await?;
            println!("Account {} deactivated", id);
            Ok(())
        }
        Command::Accounts => {
            for status in engine.tokens.list_account_status().await? {
                let account = &status.account;
                println!(
                    "{}  {:<32} {:<20} active={} token={:?} expires_in={}",
                    account.id,
                    account.email,
                    account.state.as_str(),
                    account.active,
                    status.token_status,
                    status
                        .token_expires_in
                        .map(|s| format!("{}s", s))
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
            for (table, count) in engine.database.stats().await? {
                println!("{}: {}", table, count);
            }
            Ok(())
        }
        Command::Sync { account: Some(account) } => {
            let report = engine
                .orchestrator
                .sync_account(&AccountId::from(account))
                .await?;
            println!(
                "Forwarded {} message(s), full resync: {}, subscription: {}",
                report.forwarded(),
                report.full_resync(),
                report.subscription.as_str()
            );
            Ok(())
        }
        Command::Sync { account: None } => {
            for (id, result) in engine.orchestrator.sync_all().await? {
                match result {
                    Ok(report) => println!("{}: forwarded {}", id, report.forwarded()),
                    Err(e) => println!("{}: failed ({:?}): {}", id, e.kind(), e),
                }
            }
            Ok(())
        }
        Command::Unsubscribe { account } => {
            engine
                .subscriptions
                .cancel_subscription(&AccountId::from(account))
                .await?;
            println!("Subscription cancelled");
            Ok(())
        }
        Command::RotateSecret { account } => {
            let state = engine
                .subscriptions
                .rotate_secret(&AccountId::from(account))
                .await?;
            println!("Subscription is now {}", state.as_str());
            Ok(())
        }
        Command::Notify { file } => notify(engine, file).await,
        Command::Failures { clear: Some(id), .. } => {
            engine.database.delete_forward_failure(id).await?;
            println!("Removed failure {}", id);
            Ok(())
        }
        Command::Failures { retry: true, .. } => {
            let report = engine.orchestrator.replay_failures().await?;
            println!(
                "Delivered {}, failed again {}, already forwarded {}",
                report.delivered, report.failed, report.skipped
            );
            Ok(())
        }
        Command::Failures { limit, .. } => {
            for failure in engine.database.forward_failures(limit).await? {
                println!(
                    "#{} {} {} {} replays={} {}",
                    failure.id,
                    failure.created_at,
                    failure.account_id,
                    failure.message_id,
                    failure.retry_count,
                    failure.reason
                );
            }
            Ok(())
        }
        Command::Prune => {
            let report = engine.orchestrator.prune_history(chrono::Utc::now()).await?;
            println!(
                "Pruned {} auth event(s), {} sync run(s), {} message(s), {} ledger row(s), {} failure(s)",
                report.auth_events, report.sync_runs, report.messages, report.ledger, report.failures
            );
            Ok(())
        }
        Command::ClearKey => handle_key_clear(&engine.settings.security),
    }
}

async fn run(engine: &Engine) -> CliResult {
    let RunningService {
        commands,
        mut events,
        ingress,
        handle,
    } = start_service(engine).await;
    if engine.settings.subscriptions.enabled {
        eprintln!(
            "No webhook host runs in this process, so accounts are polled. \
             Serve RunningService::ingress from an embedding HTTP layer for push delivery."
        );
    }
    drop(ingress);
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let SyncEvent::SyncFailed {
                account_id,
                kind,
                error,
            } = event
            {
                eprintln!("{}: {:?}: {}", account_id, kind, error);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("Shutting down, waiting for running cycles");
    let _ = commands.send(SyncCommand::Shutdown).await;
    handle.await?;
    event_log.abort();
    Ok(())
}

async fn login(engine: &Engine, id: &AccountId, redirect_url: Option<String>) -> CliResult {
    match engine.tokens.begin_authentication(id).await? {
        PendingAction::OpenUrl { url, .. } => {
            let redirect = match redirect_url {
                Some(redirect) => redirect,
                None => {
                    println!("Open this URL in a browser and sign in:\n\n{}\n", url);
                    println!("Paste the URL you were redirected to:");
                    let mut line = String::new();
                    std::io::stdin().lock().read_line(&mut line)?;
                    line.trim().to_string()
                }
            };
            let account = engine.tokens.complete_from_redirect(id, &redirect).await?;
            println!("Logged in as {}", account.email);
        }
        PendingAction::EnterCode {
            user_code,
            verification_uri,
            expires_at,
            ..
        } => {
            println!(
                "Visit {} and enter the code {} (expires {})",
                verification_uri, user_code, expires_at
            );
            let account = engine.tokens.wait_for_device_authorization(id).await?;
            println!("Logged in as {}", account.email);
        }
    }
    Ok(())
}

/// Validate a payload and sync the accounts it names right away.
async fn notify(engine: &Engine, file: Option<PathBuf>) -> CliResult {
    let body = match file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut body = String::new();
            std::io::stdin().read_to_string(&mut body)?;
            body
        }
    };

    let (command_tx, mut command_rx) = mpsc::channel(100);
    let ingress = NotificationIngress::new(engine.subscriptions.clone(), command_tx);
    let queued = ingress.receive(&body).await?;
    drop(ingress);
    println!("Notification accepted for {} account(s)", queued);

    while let Some(command) = command_rx.recv().await {
        if let SyncCommand::Notification(id) = command {
            match engine.orchestrator.sync_account(&id).await {
                Ok(report) => println!("{}: forwarded {}", id, report.forwarded()),
                Err(e) => println!("{}: failed: {}", id, e),
            }
        }
    }
    Ok(())
}
