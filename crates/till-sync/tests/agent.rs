//! The multi-store agent and its triggers, on real time.

mod common;

use serde_json::json;
use std::time::Duration;

use till_db::{Database, DbConfig};
use till_sync::{SyncAgent, SyncAgentHandle, SyncError, SyncTrigger};

use common::*;

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

async fn start(stores: &[&str]) -> (std::sync::Arc<FakeServer>, Database, SyncAgentHandle) {
    let server = FakeServer::new();
    let db = Database::new(DbConfig::in_memory()).await.unwrap();

    let mut config = config();
    config.sync.poll_interval_secs = 3600;
    config.store.extra = stores.iter().map(|s| s.to_string()).collect();

    let handle = SyncAgent::new(config, db.clone(), server.clone()).spawn();

    // The first poll tick runs a pass for every store right away.
    let watched = handle.clone();
    let expected = handle.stores();
    eventually("startup passes", move || {
        expected
            .iter()
            .all(|s| watched.snapshot(s).last_synced_at.is_some())
    })
    .await;

    (server, db, handle)
}

#[tokio::test]
async fn manual_trigger_drains_the_queue() {
    let (server, db, handle) = start(&[]).await;
    db.mutations()
        .enqueue_at(&create_sale("local-a", json!({})), t(1))
        .await
        .unwrap();

    handle.request_sync(STORE, SyncTrigger::Manual).await.unwrap();

    let watched = server.clone();
    eventually("the queued sale", move || watched.effects().len() == 1).await;
    let snapshot_handle = handle.clone();
    eventually("pending count to drop", move || {
        snapshot_handle.snapshot(STORE).pending_count == 0
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test]
async fn coming_back_online_runs_a_reconnect_pass() {
    let (server, db, handle) = start(&[]).await;

    handle.set_online(false).await.unwrap();
    let watched = handle.clone();
    eventually("offline", move || !watched.is_online()).await;

    let gateway = handle.gateway(STORE).unwrap();
    let submission = gateway
        .submit(create_sale("local-a", json!({ "total": 4 })))
        .await
        .unwrap();
    assert!(submission.is_deferred());
    assert!(server.mutating_calls().is_empty());

    handle.set_online(true).await.unwrap();

    let watched = server.clone();
    eventually("the reconnect pass", move || watched.effects() == vec!["POST /sales"]).await;
    let watched = handle.clone();
    eventually("the queue to empty", move || watched.snapshot(STORE).pending_count == 0).await;
    assert!(!db.mutations().has_pending(STORE).await.unwrap());

    handle.shutdown().await;
}

#[tokio::test]
async fn unknown_store_is_refused() {
    let (_server, _db, handle) = start(&[]).await;

    let err = handle
        .request_sync("elsewhere", SyncTrigger::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownStore(_)));
    assert!(handle.gateway("elsewhere").is_err());

    handle.shutdown().await;
}

#[tokio::test]
async fn sync_all_covers_every_store() {
    let (server, db, handle) = start(&["s2"]).await;
    assert_eq!(handle.stores(), vec!["s1", "s2"]);

    let mut other = create_sale("local-b", json!({}));
    other.store_id = "s2".into();
    db.mutations()
        .enqueue_at(&create_sale("local-a", json!({})), t(1))
        .await
        .unwrap();
    db.mutations().enqueue_at(&other, t(2)).await.unwrap();

    handle.sync_all(SyncTrigger::Login).await.unwrap();

    let watched = server.clone();
    eventually("both stores", move || watched.effects().len() == 2).await;

    let mut stores: Vec<String> = server
        .mutating_calls()
        .iter()
        .filter_map(|c| c.header("X-Store-Id").map(String::from))
        .collect();
    stores.sort();
    assert_eq!(stores, vec!["s1", "s2"]);

    handle.shutdown().await;
}

#[tokio::test]
async fn handle_reports_shutdown() {
    let (_server, _db, handle) = start(&[]).await;
    handle.shutdown().await;

    let watched = handle.clone();
    let waited = tokio::time::timeout(Duration::from_secs(5), async move {
        loop {
            if let Err(SyncError::ShuttingDown) = watched.sync_all(SyncTrigger::Manual).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok());
}
