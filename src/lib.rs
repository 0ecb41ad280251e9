//! Account synchronization engine for Microsoft Graph mailboxes.
//!
//! Keeps OAuth credentials valid, pulls mailbox changes through delta
//! queries, keeps push subscriptions alive and forwards new messages to a
//! downstream sink, for any number of accounts at once.

pub mod app;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod database;
pub mod delta;
pub mod error;
pub mod forwarder;
pub mod graph_api;
pub mod logging;
pub mod notifications;
pub mod rate_limit;
pub mod repository;
pub mod retry;
pub mod subscription;
pub mod sync;
pub mod token;
pub mod types;

pub use error::{FailureKind, SyncError, SyncResult};
