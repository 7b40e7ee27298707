//! Scenario: scan lifecycle transitions and conservation.
//!
//! # Invariants under test
//!
//! 1. **Conservation**: `pending + synced + failed` always equals the total
//!    number of inserted scans.
//! 2. **Lifecycle monotonicity**: `pending` is the only initial state;
//!    `mark_synced`/`mark_failed` skip non-pending rows silently; `synced`
//!    is terminal; only the administrative reset returns `failed` rows to
//!    `pending`.
//! 3. `fetch_pending` returns oldest-first by `local_id`, and `local_id`
//!    is strictly increasing across inserts.
//! 4. Idempotency keys embed station, badge, and `local_id`, and survive
//!    a read back unchanged.

use chrono::{TimeZone, Utc};
use tally_db::Store;
use tally_schemas::SyncStatus;

async fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("tally.db")).await.unwrap();
    (dir, store)
}

#[tokio::test]
async fn insert_starts_pending_with_increasing_ids_and_stable_keys() {
    let (_dir, store) = temp_store().await;
    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();

    let a = store.insert_scan("A", "Gate-1", t0, true).await.unwrap();
    let b = store
        .insert_scan("B", "Gate-1", t0 + chrono::Duration::seconds(1), false)
        .await
        .unwrap();

    assert_eq!(a.local_id, 1);
    assert_eq!(b.local_id, 2);
    assert_eq!(a.sync_status, SyncStatus::Pending);
    assert_eq!(a.idempotency_key, "Gate-1-A-1");
    assert_eq!(b.idempotency_key, "Gate-1-B-2");

    // Read back: the persisted key must equal the insert-time key.
    let pending = store.fetch_pending(10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].local_id, 1, "oldest first");
    assert_eq!(pending[0].idempotency_key, "Gate-1-A-1");
    assert_eq!(pending[1].idempotency_key, "Gate-1-B-2");
}

#[tokio::test]
async fn conservation_holds_across_transitions() {
    let (_dir, store) = temp_store().await;
    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();

    for i in 0..5 {
        store
            .insert_scan(&format!("B{i}"), "Gate-1", t0, false)
            .await
            .unwrap();
    }

    store.mark_synced(&[1, 2]).await.unwrap();
    store.mark_failed(&[3], "http 422").await.unwrap();

    let counts = store.count_by_status().await.unwrap();
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.synced, 2);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.total(), 5, "conservation: statuses partition inserts");
}

#[tokio::test]
async fn transitions_skip_non_pending_rows_silently() {
    let (_dir, store) = temp_store().await;
    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
    store.insert_scan("A", "Gate-1", t0, true).await.unwrap();

    assert_eq!(store.mark_synced(&[1]).await.unwrap(), 1);
    // Synced is terminal: neither transition may touch it again.
    assert_eq!(store.mark_synced(&[1]).await.unwrap(), 0);
    assert_eq!(store.mark_failed(&[1], "late error").await.unwrap(), 0);
    // Unknown ids are skipped, not errors.
    assert_eq!(store.mark_synced(&[99]).await.unwrap(), 0);

    let counts = store.count_by_status().await.unwrap();
    assert_eq!((counts.pending, counts.synced, counts.failed), (0, 1, 0));
}

#[tokio::test]
async fn failed_rows_record_error_and_attempts_and_reset_restores_pending() {
    let (_dir, store) = temp_store().await;
    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
    store.insert_scan("A", "Gate-1", t0, true).await.unwrap();

    store.mark_failed(&[1], "http 400: bad event").await.unwrap();
    let failed = store.recent_scans(1).await.unwrap();
    assert_eq!(failed[0].sync_status, SyncStatus::Failed);
    assert_eq!(failed[0].last_error.as_deref(), Some("http 400: bad event"));
    assert_eq!(failed[0].attempt_count, 1);

    let reset = store.reset_failed_to_pending().await.unwrap();
    assert_eq!(reset, 1);
    let back = store.fetch_pending(10).await.unwrap();
    assert_eq!(back.len(), 1);
    assert!(back[0].last_error.is_none(), "reset clears the error text");
}

#[tokio::test]
async fn purge_empties_the_ledger_and_restarts_ids() {
    let (_dir, store) = temp_store().await;
    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
    store.insert_scan("A", "Gate-1", t0, true).await.unwrap();
    store.insert_scan("B", "Gate-1", t0, true).await.unwrap();

    assert_eq!(store.purge_all_scans().await.unwrap(), 2);
    assert_eq!(store.count_by_status().await.unwrap().total(), 0);

    let again = store.insert_scan("C", "Gate-1", t0, true).await.unwrap();
    assert_eq!(again.local_id, 1, "purge starts a fresh id epoch");
}
