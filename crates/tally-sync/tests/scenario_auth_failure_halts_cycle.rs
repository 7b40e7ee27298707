//! Scenario: authentication rejection halts the cycle.
//!
//! # Invariants under test
//!
//! 1. A 401 on the first batch transitions that batch to `failed` and
//!    halts the cycle; no further batches are attempted.
//! 2. The summary flags the authentication failure and carries a
//!    credential-facing error message.
//! 3. No retry delay elapses: auth is a permanent class, so exactly one
//!    upload happens and the cycle returns promptly.

use chrono::{TimeZone, Utc};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use tally_cloud::CloudClient;
use tally_config::Secret;
use tally_sync::SyncEngine;
use tally_testkit::{temp_store, test_config, FakeCloud, ScriptedResponse};

#[tokio::test]
async fn unauthorized_first_batch_fails_and_halts() {
    let cloud = FakeCloud::spawn().await;
    let ts = temp_store().await;
    let cfg = test_config(&cloud.base_url());

    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
    for i in 0..150 {
        ts.store
            .insert_scan(&format!("B{i:03}"), "Gate-1", t0, true)
            .await
            .unwrap();
    }

    cloud.push_response(ScriptedResponse::Status(401));

    let client = CloudClient::new(&cfg.cloud.url, Secret::new("bad-key".to_string()));
    let engine = SyncEngine::new(ts.store.clone(), client, cfg, CancellationToken::new());

    let started = Instant::now();
    let summary = engine.sync_now().await.unwrap();

    assert!(summary.auth_failed, "summary must surface the auth failure");
    assert!(
        summary.last_error.as_deref().unwrap_or("").contains("authentication"),
        "error message must point at the credential: {:?}",
        summary.last_error
    );
    assert_eq!(summary.failed, 100, "exactly the first batch fails");
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.remaining_pending, 50, "later batches stay pending");
    assert_eq!(cloud.upload_count(), 1, "no further batch attempted");
    assert!(
        started.elapsed().as_millis() < 900,
        "permanent class must not wait out a backoff"
    );

    let counts = ts.store.count_by_status().await.unwrap();
    assert_eq!((counts.pending, counts.synced, counts.failed), (50, 0, 100));

    // The failed rows carry the classification in last_error.
    let recent = ts.store.fetch_pending(1).await.unwrap();
    assert_eq!(recent[0].local_id, 101, "pending resumes after the failed batch");
}
