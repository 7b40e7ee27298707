//! Connectivity oracle.
//!
//! Wraps the pure [`fsm::HysteresisFsm`] with probe I/O and scheduling:
//! a periodic tick (suppressed for an initial delay at startup, disabled
//! entirely when the interval is zero) plus on-demand probes from external
//! events. Concurrent probes coalesce: a request arriving while one is in
//! flight is dropped. State transitions are broadcast exactly once per
//! change as `connection_status_changed` signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tally_cloud::CloudClient;
use tally_config::HealthConfig;
use tally_schemas::Signal;

pub mod fsm;

pub use fsm::{ConnState, HysteresisFsm};

pub struct ConnectivityOracle {
    client: CloudClient,
    cfg: HealthConfig,
    fsm: Mutex<HysteresisFsm>,
    in_flight: AtomicBool,
    bus: broadcast::Sender<Signal>,
}

impl ConnectivityOracle {
    pub fn new(client: CloudClient, cfg: HealthConfig, bus: broadcast::Sender<Signal>) -> Arc<Self> {
        let fsm = HysteresisFsm::new(cfg.hysteresis_threshold);
        Arc::new(Self {
            client,
            cfg,
            fsm: Mutex::new(fsm),
            in_flight: AtomicBool::new(false),
            bus,
        })
    }

    /// Current observed state.
    pub fn state(&self) -> ConnState {
        self.fsm.lock().map(|g| g.state()).unwrap_or(ConnState::Unknown)
    }

    /// Fire-and-forget probe for external events (window focus, OS network
    /// notification, the `test_connectivity` API). Coalesces with any probe
    /// already in flight.
    pub fn request_probe(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.probe_once().await;
        });
    }

    /// Run one probe unless another is in flight. The probe's own timeout
    /// bounds it; an expired deadline counts as a failure.
    pub async fn probe_once(&self) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("probe already in flight, coalescing");
            return;
        }

        let result = self.client.probe(self.cfg.timeout).await;

        let changed = {
            let mut fsm = match self.fsm.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            match &result {
                Ok(()) => fsm.on_success().map(|s| (s, "online".to_string())),
                Err(e) => fsm.on_failure().map(|s| (s, e.message.clone())),
            }
        };
        self.in_flight.store(false, Ordering::Release);

        if let Some((state, message)) = changed {
            let ok = state.is_online();
            info!(online = ok, %message, "connectivity state changed");
            let _ = self.bus.send(Signal::ConnectionStatusChanged { ok, message });
        }
    }

    /// Periodic probe loop. Waits out the initial delay, then ticks every
    /// configured interval until cancelled. Returns immediately when
    /// periodic probing is disabled; on-demand probes keep working.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.cfg.initial_delay) => {}
        }

        let Some(interval) = self.cfg.interval else {
            debug!("periodic health probing disabled");
            return;
        };

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.probe_once().await,
            }
        }
    }
}
