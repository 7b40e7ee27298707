//! Ordered shutdown: drain, export handoff, exit.
//!
//! The daemon quiesces the scheduler (cancel + await) before invoking the
//! orchestrator, so no tick can land mid-drain; the drain itself holds the
//! engine's single-flight lock, so even a racing manual sync is rejected
//! busy. Collaborator faults (export failure) never block completion:
//! every stage emits its signal and the sequence runs to `complete`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use tally_schemas::{Signal, SyncStage};

use crate::engine::SyncEngine;

/// External report-export collaborator. Runs on the blocking pool; the
/// orchestrator only consumes the result.
pub trait ExportHook: Send + Sync + 'static {
    /// Produce the local report; returns a destination description when
    /// one was written.
    fn export(&self) -> anyhow::Result<Option<String>>;
}

/// Default hook for deployments without an export collaborator.
pub struct NoopExport;

impl ExportHook for NoopExport {
    fn export(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

pub struct ShutdownOrchestrator {
    engine: Arc<SyncEngine>,
    export: Arc<dyn ExportHook>,
    bus: broadcast::Sender<Signal>,
    lock_wait: Duration,
    max_batches: u64,
}

impl ShutdownOrchestrator {
    pub fn new(
        engine: Arc<SyncEngine>,
        export: Arc<dyn ExportHook>,
        bus: broadcast::Sender<Signal>,
    ) -> Self {
        Self {
            engine,
            export,
            bus,
            lock_wait: Duration::from_secs(10),
            max_batches: 50,
        }
    }

    /// Override the bounded lock wait and drain size (defaults 10s / 50).
    pub fn with_limits(mut self, lock_wait: Duration, max_batches: u64) -> Self {
        self.lock_wait = lock_wait;
        self.max_batches = max_batches;
        self
    }

    /// Run the full drain → export → complete sequence.
    pub async fn run(&self) {
        info!("shutdown: draining pending scans");
        match self.engine.drain(self.max_batches, self.lock_wait).await {
            Ok(Some(summary)) => {
                let ok = !summary.auth_failed && summary.last_error.is_none();
                let message = if summary.skipped {
                    "sync skipped: endpoint unreachable; scans remain pending".to_string()
                } else {
                    format!(
                        "synced {} scan(s) in {} batch(es); {} still pending",
                        summary.synced, summary.batches, summary.remaining_pending
                    )
                };
                self.emit(SyncStage::Sync, ok, message, None);
            }
            Ok(None) => {
                warn!("shutdown: engine lock not acquired in time; skipping drain");
                self.emit(
                    SyncStage::Sync,
                    true,
                    "warning: sync skipped (engine busy at shutdown)".to_string(),
                    None,
                );
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "shutdown: storage fault during drain");
                self.emit(
                    SyncStage::Sync,
                    false,
                    format!("storage fault during drain: {e:#}"),
                    None,
                );
            }
        }

        info!("shutdown: requesting export");
        let export = Arc::clone(&self.export);
        match tokio::task::spawn_blocking(move || export.export()).await {
            Ok(Ok(destination)) => {
                self.emit(
                    SyncStage::Export,
                    true,
                    "local report exported".to_string(),
                    destination,
                );
            }
            Ok(Err(e)) => {
                warn!(error = %format!("{e:#}"), "shutdown: export collaborator failed");
                self.emit(SyncStage::Export, false, format!("export failed: {e:#}"), None);
            }
            Err(join) => {
                warn!(error = %join, "shutdown: export task panicked");
                self.emit(SyncStage::Export, false, "export task panicked".to_string(), None);
            }
        }

        self.emit(SyncStage::Complete, true, "shutdown complete".to_string(), None);
    }

    fn emit(&self, stage: SyncStage, ok: bool, message: String, destination: Option<String>) {
        let _ = self.bus.send(Signal::SyncStageChanged {
            stage,
            ok,
            message,
            destination,
        });
    }
}
