//! Scenario: probe loop drives the hysteresis state machine.
//!
//! # Invariants under test
//!
//! 1. The first successful probe flips the oracle to online and emits one
//!    `connection_status_changed {ok:true}` signal.
//! 2. Offline requires `H = 2` consecutive failures; a single failed probe
//!    emits nothing.
//! 3. Recovery is immediate on the next success.
//! 4. Interval 0 disables polling (`run` returns), but on-demand probes
//!    still work.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use tally_cloud::CloudClient;
use tally_config::{HealthConfig, Secret};
use tally_health::{ConnState, ConnectivityOracle};
use tally_schemas::Signal;
use tally_testkit::FakeCloud;

fn oracle_for(
    cloud: &FakeCloud,
    interval: Option<Duration>,
) -> (Arc<ConnectivityOracle>, broadcast::Receiver<Signal>) {
    let (bus, rx) = broadcast::channel(64);
    let client = CloudClient::new(&cloud.base_url(), Secret::new("test-key".to_string()));
    let cfg = HealthConfig {
        interval,
        timeout: Duration::from_secs(1),
        initial_delay: Duration::ZERO,
        hysteresis_threshold: 2,
    };
    (ConnectivityOracle::new(client, cfg, bus), rx)
}

async fn next_status(rx: &mut broadcast::Receiver<Signal>) -> (bool, String) {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(Signal::ConnectionStatusChanged { ok, message })) => return (ok, message),
            Ok(Ok(_)) => continue,
            other => panic!("no status signal: {other:?}"),
        }
    }
}

#[tokio::test]
async fn success_flips_online_and_two_failures_flip_offline() {
    let cloud = FakeCloud::spawn().await;
    let (oracle, mut rx) = oracle_for(&cloud, None);

    oracle.probe_once().await;
    assert_eq!(oracle.state(), ConnState::Online);
    let (ok, _) = next_status(&mut rx).await;
    assert!(ok);

    // One failure: still online, no signal.
    cloud.set_healthy(false);
    oracle.probe_once().await;
    assert_eq!(oracle.state(), ConnState::Online);
    assert!(rx.try_recv().is_err(), "below threshold, no notification");

    // Second consecutive failure: offline, one signal.
    oracle.probe_once().await;
    assert_eq!(oracle.state(), ConnState::Offline);
    let (ok, message) = next_status(&mut rx).await;
    assert!(!ok);
    assert!(!message.is_empty());

    // Recovery is immediate.
    cloud.set_healthy(true);
    oracle.probe_once().await;
    assert_eq!(oracle.state(), ConnState::Online);
    let (ok, _) = next_status(&mut rx).await;
    assert!(ok);
}

#[tokio::test]
async fn repeated_success_does_not_re_notify() {
    let cloud = FakeCloud::spawn().await;
    let (oracle, mut rx) = oracle_for(&cloud, None);

    oracle.probe_once().await;
    let _ = next_status(&mut rx).await;

    oracle.probe_once().await;
    oracle.probe_once().await;
    assert!(rx.try_recv().is_err(), "unchanged state emits nothing");
}

#[tokio::test]
async fn periodic_loop_probes_until_cancelled() {
    let cloud = FakeCloud::spawn().await;
    let (oracle, mut rx) = oracle_for(&cloud, Some(Duration::from_millis(100)));

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&oracle).run(shutdown.clone()));

    let (ok, _) = next_status(&mut rx).await;
    assert!(ok, "loop probes on its own");
    // Let a few more ticks land, then stop the loop.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let probes = cloud.probe_count();
    assert!(probes >= 2, "expected repeated probes, saw {probes}");

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn zero_interval_disables_polling_but_manual_probe_works() {
    let cloud = FakeCloud::spawn().await;
    let (oracle, mut rx) = oracle_for(&cloud, None);

    let shutdown = CancellationToken::new();
    // With polling disabled the loop returns immediately.
    Arc::clone(&oracle).run(shutdown).await;
    assert_eq!(cloud.probe_count(), 0);

    // Manual probing still works.
    oracle.probe_once().await;
    assert_eq!(oracle.state(), ConnState::Online);
    let (ok, _) = next_status(&mut rx).await;
    assert!(ok);
}
