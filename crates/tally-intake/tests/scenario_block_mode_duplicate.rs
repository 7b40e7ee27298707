//! Scenario: block-mode duplicate gating with `W = 60s`.
//!
//! # Invariants under test
//!
//! 1. Badge `X` at 10:00:00 records; `X` again at 10:00:30 is rejected with
//!    `{ok:false, is_duplicate:true}` and the store still holds one record.
//! 2. `X` at 10:01:05 (outside the window) records; two records total.
//! 3. The exact window boundary (`t2 − t1 = W`) is NOT a duplicate.
//! 4. Block and warn emit a `duplicate_detected` signal; the blocked
//!    submission leaves no storage effect.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use tokio::sync::broadcast;

use tally_config::{DuplicateAction, DuplicateConfig};
use tally_intake::ScanIntake;
use tally_schemas::Signal;
use tally_sync::ActivityTracker;
use tally_testkit::temp_store;

fn intake_for(
    store: tally_db::Store,
    action: DuplicateAction,
) -> (ScanIntake, broadcast::Receiver<Signal>) {
    let (bus, rx) = broadcast::channel(64);
    let intake = ScanIntake::new(
        store,
        "Gate-1".to_string(),
        DuplicateConfig {
            enabled: true,
            window: Duration::from_secs(60),
            action,
        },
        ActivityTracker::new(Utc::now()),
        bus,
    );
    (intake, rx)
}

#[tokio::test]
async fn block_inside_window_allows_outside() {
    let ts = temp_store().await;
    let (intake, mut rx) = intake_for(ts.store.clone(), DuplicateAction::Block);
    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();

    let first = intake.submit_scan_at("X", t0).await.unwrap();
    assert!(first.ok);
    assert!(!first.is_duplicate);

    // 30s later: inside the window, blocked, no insert.
    let second = intake
        .submit_scan_at("X", t0 + ChronoDuration::seconds(30))
        .await
        .unwrap();
    assert!(!second.ok);
    assert!(second.is_duplicate);
    assert_eq!(second.badge_id.as_deref(), Some("X"));
    assert_eq!(ts.store.count_by_status().await.unwrap().total(), 1);

    // The rejection is surfaced to collaborators as a signal.
    match rx.try_recv() {
        Ok(Signal::DuplicateDetected { badge_id, station_name, .. }) => {
            assert_eq!(badge_id, "X");
            assert_eq!(station_name, "Gate-1");
        }
        other => panic!("expected duplicate signal, got {other:?}"),
    }

    // 65s after the first scan: outside the window, recorded.
    let third = intake
        .submit_scan_at("X", t0 + ChronoDuration::seconds(65))
        .await
        .unwrap();
    assert!(third.ok);
    assert!(!third.is_duplicate);
    assert_eq!(ts.store.count_by_status().await.unwrap().total(), 2);
}

#[tokio::test]
async fn exact_window_boundary_is_not_a_duplicate() {
    let ts = temp_store().await;
    let (intake, _rx) = intake_for(ts.store.clone(), DuplicateAction::Block);
    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();

    intake.submit_scan_at("X", t0).await.unwrap();
    let at_boundary = intake
        .submit_scan_at("X", t0 + ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert!(at_boundary.ok, "t2 − t1 = W must be admitted");
    assert_eq!(ts.store.count_by_status().await.unwrap().total(), 2);
}

#[tokio::test]
async fn warn_records_and_flags_the_duplicate() {
    let ts = temp_store().await;
    let (intake, mut rx) = intake_for(ts.store.clone(), DuplicateAction::Warn);
    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();

    intake.submit_scan_at("X", t0).await.unwrap();
    let dup = intake
        .submit_scan_at("X", t0 + ChronoDuration::seconds(10))
        .await
        .unwrap();

    assert!(dup.ok, "warn mode records the scan");
    assert!(dup.is_duplicate);
    assert_eq!(ts.store.count_by_status().await.unwrap().total(), 2);
    assert!(matches!(rx.try_recv(), Ok(Signal::DuplicateDetected { .. })));
}

#[tokio::test]
async fn silent_records_without_surfacing() {
    let ts = temp_store().await;
    let (intake, mut rx) = intake_for(ts.store.clone(), DuplicateAction::Silent);
    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();

    intake.submit_scan_at("X", t0).await.unwrap();
    let dup = intake
        .submit_scan_at("X", t0 + ChronoDuration::seconds(10))
        .await
        .unwrap();

    assert!(dup.ok);
    assert!(!dup.is_duplicate, "silent mode does not surface the duplicate");
    // The silent duplicate enters the pending stream like any other scan.
    assert_eq!(ts.store.count_by_status().await.unwrap().pending, 2);
    assert!(rx.try_recv().is_err(), "no signal in silent mode");
}
