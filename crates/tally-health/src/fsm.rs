//! Connectivity hysteresis state machine.
//!
//! # Design
//!
//! Pure state (no I/O, no clocks), so every transition rule is unit
//! testable. The oracle feeds probe results in; the FSM decides whether
//! the observable state changed.
//!
//! ```text
//!              success                    success
//!   Unknown ───────────► Online ◄──────────────────────┐
//!      │                   │                            │
//!      │ failure ×H        │ failure ×H                 │
//!      └────────────► Offline ──────────────────────────┘
//! ```
//!
//! A single success always wins immediately; `Offline` requires `H`
//! *consecutive* failures. The failure counter resets on every success.

/// Observable connectivity state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Startup: no probe has completed yet.
    Unknown,
    Online,
    Offline,
}

impl ConnState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnState::Online)
    }
}

/// Hysteresis core: failures must accumulate, success is immediate.
#[derive(Debug)]
pub struct HysteresisFsm {
    state: ConnState,
    consecutive_failures: u32,
    threshold: u32,
}

impl HysteresisFsm {
    /// `threshold` is the number of consecutive failures required before
    /// declaring `Offline`. Minimum 1 (enforced at config load).
    pub fn new(threshold: u32) -> Self {
        Self {
            state: ConnState::Unknown,
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Apply a successful probe. Returns the new state if it changed.
    pub fn on_success(&mut self) -> Option<ConnState> {
        self.consecutive_failures = 0;
        if self.state != ConnState::Online {
            self.state = ConnState::Online;
            Some(ConnState::Online)
        } else {
            None
        }
    }

    /// Apply a failed probe. Returns the new state if it changed.
    pub fn on_failure(&mut self) -> Option<ConnState> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state != ConnState::Offline && self.consecutive_failures >= self.threshold {
            self.state = ConnState::Offline;
            Some(ConnState::Offline)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unknown() {
        let fsm = HysteresisFsm::new(2);
        assert_eq!(fsm.state(), ConnState::Unknown);
    }

    #[test]
    fn first_success_goes_online_from_any_state() {
        let mut fsm = HysteresisFsm::new(2);
        assert_eq!(fsm.on_success(), Some(ConnState::Online));

        let mut fsm = HysteresisFsm::new(2);
        fsm.on_failure();
        fsm.on_failure();
        assert_eq!(fsm.state(), ConnState::Offline);
        assert_eq!(fsm.on_success(), Some(ConnState::Online));
        assert_eq!(fsm.consecutive_failures(), 0);
    }

    #[test]
    fn offline_requires_threshold_consecutive_failures() {
        let mut fsm = HysteresisFsm::new(3);
        fsm.on_success();
        assert_eq!(fsm.on_failure(), None);
        assert_eq!(fsm.on_failure(), None);
        assert_eq!(fsm.state(), ConnState::Online, "still online below threshold");
        assert_eq!(fsm.on_failure(), Some(ConnState::Offline));
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let mut fsm = HysteresisFsm::new(2);
        fsm.on_success();
        fsm.on_failure();
        fsm.on_success();
        // The earlier failure no longer counts toward the threshold.
        assert_eq!(fsm.on_failure(), None);
        assert_eq!(fsm.on_failure(), Some(ConnState::Offline));
    }

    #[test]
    fn repeated_results_do_not_re_notify() {
        let mut fsm = HysteresisFsm::new(1);
        assert_eq!(fsm.on_success(), Some(ConnState::Online));
        assert_eq!(fsm.on_success(), None, "no change, no notification");
        assert_eq!(fsm.on_failure(), Some(ConnState::Offline));
        assert_eq!(fsm.on_failure(), None, "already offline");
    }

    #[test]
    fn threshold_failures_from_unknown_declare_offline() {
        let mut fsm = HysteresisFsm::new(2);
        assert_eq!(fsm.on_failure(), None);
        assert_eq!(fsm.on_failure(), Some(ConnState::Offline));
    }
}
