//! Scenario: happy-path upload of three scans.
//!
//! # Invariants under test
//!
//! 1. One cycle uploads all pending scans in `local_id` order with
//!    idempotency keys `{station}-{badge}-{local_id}`.
//! 2. Wire timestamps are RFC3339 UTC with a `Z` suffix.
//! 3. The bearer credential rides the `Authorization` header.
//! 4. After service acceptance the store reads `{pending:0, synced:3,
//!    failed:0}`.
//! 5. A cycle against an empty ledger reports `{synced:0, batches:0}`.
//! 6. `BatchSize = 1` still drains everything, one event per batch.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use tally_cloud::CloudClient;
use tally_config::Secret;
use tally_sync::SyncEngine;
use tally_testkit::{temp_store, test_config, FakeCloud};

#[tokio::test]
async fn three_scans_upload_in_order_with_expected_keys() {
    let cloud = FakeCloud::spawn().await;
    let ts = temp_store().await;
    let cfg = test_config(&cloud.base_url());

    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
    for (i, badge) in ["A", "B", "C"].iter().enumerate() {
        ts.store
            .insert_scan(badge, "Gate-1", t0 + ChronoDuration::seconds(i as i64), true)
            .await
            .unwrap();
    }

    let client = CloudClient::new(&cfg.cloud.url, Secret::new("test-key".to_string()));
    let engine = SyncEngine::new(ts.store.clone(), client, cfg, CancellationToken::new());

    let summary = engine.sync_now().await.unwrap();
    assert!(!summary.skipped);
    assert_eq!(summary.synced, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.remaining_pending, 0);

    let batches = cloud.batches();
    assert_eq!(batches.len(), 1);
    let events = &batches[0].events;
    assert_eq!(events.len(), 3);
    assert_eq!(
        events.iter().map(|e| e.idempotency_key.as_str()).collect::<Vec<_>>(),
        vec!["Gate-1-A-1", "Gate-1-B-2", "Gate-1-C-3"],
    );
    assert_eq!(events[0].scanned_at, "2026-08-01T10:00:00.000000Z");
    assert!(events[2].scanned_at.ends_with('Z'));
    assert_eq!(events[0].meta.local_id, 1);
    assert!(events[0].meta.matched);

    assert_eq!(
        cloud.bearer_seen(),
        vec![Some("Bearer test-key".to_string())],
    );

    let counts = ts.store.count_by_status().await.unwrap();
    assert_eq!((counts.pending, counts.synced, counts.failed), (0, 3, 0));
}

#[tokio::test]
async fn empty_ledger_completes_with_zero_batches() {
    let cloud = FakeCloud::spawn().await;
    let ts = temp_store().await;
    let cfg = test_config(&cloud.base_url());

    let client = CloudClient::new(&cfg.cloud.url, Secret::new("test-key".to_string()));
    let engine = SyncEngine::new(ts.store.clone(), client, cfg, CancellationToken::new());

    let summary = engine.sync_now().await.unwrap();
    assert!(!summary.skipped);
    assert_eq!(summary.synced, 0);
    assert_eq!(summary.batches, 0);
    assert_eq!(cloud.upload_count(), 0, "no batch endpoint call for an empty ledger");
}

#[tokio::test]
async fn batch_size_one_drains_one_event_per_batch() {
    let cloud = FakeCloud::spawn().await;
    let ts = temp_store().await;
    let mut cfg = test_config(&cloud.base_url());
    cfg.cloud.batch_size = 1;

    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
    for badge in ["A", "B", "C"] {
        ts.store.insert_scan(badge, "Gate-1", t0, true).await.unwrap();
    }

    let client = CloudClient::new(&cfg.cloud.url, Secret::new("test-key".to_string()));
    let engine = SyncEngine::new(ts.store.clone(), client, cfg, CancellationToken::new());

    let summary = engine.sync_now().await.unwrap();
    assert_eq!(summary.synced, 3);
    assert_eq!(summary.batches, 3);
    assert!(cloud.batches().iter().all(|b| b.events.len() == 1));
}
