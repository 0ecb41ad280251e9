mod common;

use chrono::Duration as ChronoDuration;
use tokio::time::Duration;

use common::{message, page, removed, start_key, test_settings, FakeTokenEndpoint, Harness};
use graphsync::error::{FailureKind, SyncError};
use graphsync::forwarder::ForwardError;
use graphsync::graph_api::RemoteError;
use graphsync::repository::Repository;
use graphsync::sync::{create_sync_channels, SyncCommand, SyncEvent, SyncService};
use graphsync::types::SubscriptionState;

fn stat(stats: &[(String, i64)], table: &str) -> i64 {
    stats
        .iter()
        .find(|(name, _)| name == table)
        .map(|(_, count)| *count)
        .unwrap_or_default()
}

#[tokio::test]
async fn cycle_forwards_new_messages_then_commits() {
    let harness = Harness::new().await;
    let id = harness.account("a@example.com", "user-a").await;
    harness.api.script_delta(
        &start_key("user-a", "inbox"),
        Ok(page(vec![message("m1"), message("m2")], None, Some("delta-1"))),
    );

    let report = harness.orchestrator.sync_account(&id).await.unwrap();

    assert_eq!(report.forwarded(), 2);
    assert_eq!(report.subscription, SubscriptionState::Active);
    assert_eq!(harness.forwarder.delivered(), vec!["m1", "m2"]);
    let cursor = harness.repo.load_cursor(&id, "inbox").await.unwrap().unwrap();
    assert_eq!(cursor.sequence, 1);
    assert!(harness.repo.is_forwarded(&id, "m2").await.unwrap());
    let stats = harness.db.stats().await.unwrap();
    assert_eq!(stat(&stats, "messages"), 2);
}

#[tokio::test]
async fn full_resync_does_not_forward_twice() {
    let harness = Harness::new().await;
    let id = harness.account("b@example.com", "user-b").await;
    let api = &harness.api;
    api.script_delta(
        &start_key("user-b", "inbox"),
        Ok(page(vec![message("m1"), message("m2")], None, Some("delta-1"))),
    );
    harness.orchestrator.sync_account(&id).await.unwrap();

    api.script_delta("delta-1", Err(RemoteError::CursorExpired));
    api.script_delta(
        &start_key("user-b", "inbox"),
        Ok(page(
            vec![message("m1"), message("m2"), message("m3")],
            None,
            Some("delta-2"),
        )),
    );
    let report = harness.orchestrator.sync_account(&id).await.unwrap();

    assert!(report.full_resync());
    assert_eq!(report.forwarded(), 1);
    assert_eq!(harness.forwarder.delivered(), vec!["m1", "m2", "m3"]);
    let cursor = harness.repo.load_cursor(&id, "inbox").await.unwrap().unwrap();
    assert_eq!(cursor.epoch, 1);
}

#[tokio::test]
async fn permanent_failure_is_queued_and_the_cycle_continues() {
    let harness = Harness::new().await;
    let id = harness.account("c@example.com", "user-c").await;
    harness.api.script_delta(
        &start_key("user-c", "inbox"),
        Ok(page(vec![message("m1"), message("m2")], None, Some("delta-1"))),
    );
    harness
        .forwarder
        .fail("m1", ForwardError::Permanent("422 schema".into()), 1);

    let report = harness.orchestrator.sync_account(&id).await.unwrap();

    assert_eq!(report.forwarded(), 1);
    assert_eq!(report.folders[0].failed, vec!["m1"]);
    assert_eq!(harness.forwarder.delivered(), vec!["m2"]);
    let failures = harness.repo.forward_failures(10).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].message_id, "m1");
    assert!(failures[0].payload.contains("Subject m1"));
    assert!(harness.repo.load_cursor(&id, "inbox").await.unwrap().is_some());
}

#[tokio::test]
async fn exhausted_transient_failure_leaves_the_cursor_uncommitted() {
    let harness = Harness::new().await;
    let id = harness.account("d@example.com", "user-d").await;
    let key = start_key("user-d", "inbox");
    harness.api.script_delta(
        &key,
        Ok(page(vec![message("m1"), message("m2")], None, Some("delta-1"))),
    );
    harness
        .forwarder
        .fail("m2", ForwardError::Transient("503".into()), 3);

    let err = harness.orchestrator.sync_account(&id).await.unwrap_err();
    assert!(err.is_transient());
    assert!(harness.repo.load_cursor(&id, "inbox").await.unwrap().is_none());

    // The replay starts from the same place and skips what was delivered.
    harness.api.script_delta(
        &key,
        Ok(page(vec![message("m1"), message("m2")], None, Some("delta-1"))),
    );
    let report = harness.orchestrator.sync_account(&id).await.unwrap();
    assert_eq!(report.forwarded(), 1);
    assert_eq!(harness.forwarder.delivered(), vec!["m1", "m2"]);
    assert!(harness.repo.load_cursor(&id, "inbox").await.unwrap().is_some());
}

#[tokio::test]
async fn removed_messages_leave_the_store_without_forwarding() {
    let harness = Harness::new().await;
    let id = harness.account("e@example.com", "user-e").await;
    harness.api.script_delta(
        &start_key("user-e", "inbox"),
        Ok(page(vec![message("m1"), message("m2")], None, Some("delta-1"))),
    );
    harness
        .api
        .script_delta("delta-1", Ok(page(vec![removed("m1")], None, Some("delta-2"))));

    harness.orchestrator.sync_account(&id).await.unwrap();
    let report = harness.orchestrator.sync_account(&id).await.unwrap();

    assert_eq!(report.forwarded(), 0);
    assert_eq!(report.folders[0].items_found, 1);
    let stats = harness.db.stats().await.unwrap();
    assert_eq!(stat(&stats, "messages"), 1);
}

#[tokio::test]
async fn one_account_needing_login_does_not_stop_the_others() {
    let harness = Harness::new().await;
    let stuck = harness
        .account_with_token("f@example.com", "user-f", ChronoDuration::minutes(-1), None)
        .await;
    let healthy = harness.account("g@example.com", "user-g").await;
    harness.api.script_delta(
        &start_key("user-g", "inbox"),
        Ok(page(vec![message("m1")], None, Some("delta-1"))),
    );

    let results = harness.orchestrator.sync_all().await.unwrap();

    assert_eq!(results.len(), 2);
    for (id, result) in results {
        if id == stuck {
            let err = result.unwrap_err();
            assert!(matches!(err, SyncError::ReauthenticationRequired(_)));
            assert_eq!(err.kind(), FailureKind::NeedsReauthentication);
        } else {
            assert_eq!(id, healthy);
            assert_eq!(result.unwrap().forwarded(), 1);
        }
    }
}

#[tokio::test]
async fn polling_accounts_become_due_after_the_poll_interval() {
    let mut settings = test_settings();
    settings.subscriptions.enabled = false;
    let harness = Harness::build(settings, FakeTokenEndpoint::default()).await;
    let id = harness.account("h@example.com", "user-h").await;
    harness.api.script_delta(
        &start_key("user-h", "inbox"),
        Ok(page(vec![], None, Some("delta-1"))),
    );

    let now = chrono::Utc::now();
    assert_eq!(harness.orchestrator.due_accounts(now).await.unwrap(), vec![id.clone()]);

    let report = harness.orchestrator.sync_account(&id).await.unwrap();
    assert_eq!(report.subscription, SubscriptionState::None);
    assert!(harness.orchestrator.due_accounts(chrono::Utc::now()).await.unwrap().is_empty());

    let later = chrono::Utc::now() + ChronoDuration::seconds(301);
    assert_eq!(harness.orchestrator.due_accounts(later).await.unwrap(), vec![id]);
}

#[tokio::test]
async fn service_runs_notification_commands_and_reports_events() {
    let harness = Harness::new().await;
    let id = harness.account("i@example.com", "user-i").await;
    harness.api.script_delta(
        &start_key("user-i", "inbox"),
        Ok(page(vec![message("m1")], None, Some("delta-1"))),
    );
    for _ in 0..3 {
        harness
            .api
            .script_delta("delta-1", Ok(page(vec![], None, Some("delta-1"))));
    }

    let (command_tx, command_rx, event_tx, mut event_rx) = create_sync_channels();
    let mut service = SyncService::new(
        harness.orchestrator.clone(),
        command_rx,
        event_tx,
        Duration::from_secs(3600),
    );
    let handle = tokio::spawn(async move { service.run().await });

    command_tx
        .send(SyncCommand::Notification(id.clone()))
        .await
        .unwrap();
    command_tx.send(SyncCommand::Shutdown).await.unwrap();
    handle.await.unwrap();

    let mut synced = 0;
    while let Ok(event) = event_rx.try_recv() {
        match event {
            SyncEvent::AccountSynced { account_id, .. } => {
                assert_eq!(account_id, id);
                synced += 1;
            }
            SyncEvent::SyncFailed { error, .. } => panic!("cycle failed: {}", error),
            _ => {}
        }
    }
    assert!(synced >= 1);
    assert_eq!(harness.forwarder.delivered(), vec!["m1"]);
}

#[tokio::test]
async fn queued_failure_is_delivered_once_the_forwarder_recovers() {
    let harness = Harness::new().await;
    let id = harness.account("r@example.com", "user-r").await;
    harness.api.script_delta(
        &start_key("user-r", "inbox"),
        Ok(page(vec![message("m1"), message("m2")], None, Some("delta-1"))),
    );
    harness
        .forwarder
        .fail("m1", ForwardError::Permanent("422 schema".into()), 1);
    harness.orchestrator.sync_account(&id).await.unwrap();
    assert!(!harness.repo.is_forwarded(&id, "m1").await.unwrap());

    let report = harness.orchestrator.replay_failures().await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(harness.forwarder.delivered(), vec!["m2", "m1"]);
    assert!(harness.repo.is_forwarded(&id, "m1").await.unwrap());
    assert!(harness.repo.forward_failures(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn replays_stop_after_the_configured_limit() {
    let harness = Harness::new().await;
    let id = harness.account("s@example.com", "user-s").await;
    let max_replays = harness.settings.forwarder.max_replays;
    harness.api.script_delta(
        &start_key("user-s", "inbox"),
        Ok(page(vec![message("m1")], None, Some("delta-1"))),
    );
    harness.forwarder.fail(
        "m1",
        ForwardError::Permanent("410 gone".into()),
        max_replays as usize + 2,
    );
    harness.orchestrator.sync_account(&id).await.unwrap();

    for _ in 0..max_replays {
        let report = harness.orchestrator.replay_failures().await.unwrap();
        assert_eq!(report.failed, 1);
    }
    let report = harness.orchestrator.replay_failures().await.unwrap();
    assert_eq!(report, Default::default());

    let failures = harness.repo.forward_failures(10).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].retry_count, max_replays);
    assert_eq!(failures[0].reason, "410 gone");
    assert!(failures[0].last_attempt_at.is_some());
    assert!(harness.forwarder.delivered().is_empty());
}

#[tokio::test]
async fn maintenance_command_replays_the_queue() {
    let harness = Harness::new().await;
    let id = harness.account("t@example.com", "user-t").await;
    harness.api.script_delta(
        &start_key("user-t", "inbox"),
        Ok(page(vec![message("m1")], None, Some("delta-1"))),
    );
    harness
        .forwarder
        .fail("m1", ForwardError::Permanent("422 schema".into()), 1);
    harness.orchestrator.sync_account(&id).await.unwrap();

    let (command_tx, command_rx, event_tx, mut event_rx) = create_sync_channels();
    let mut service = SyncService::new(
        harness.orchestrator.clone(),
        command_rx,
        event_tx,
        Duration::from_secs(3600),
    )
    .with_maintenance_interval(Duration::from_secs(3600));
    let handle = tokio::spawn(async move { service.run().await });

    command_tx.send(SyncCommand::Maintenance).await.unwrap();
    command_tx.send(SyncCommand::Shutdown).await.unwrap();
    handle.await.unwrap();

    let mut replayed = None;
    while let Ok(event) = event_rx.try_recv() {
        if let SyncEvent::MaintenanceFinished { replay, .. } = event {
            replayed = Some(replay);
        }
    }
    assert_eq!(replayed.map(|r| r.delivered), Some(1));
    assert!(harness.repo.is_forwarded(&id, "m1").await.unwrap());
}
