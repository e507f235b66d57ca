//! Hysteresis for degraded-status events.
//!
//! A transient degraded reading (a process restarting during log rotation,
//! say) should not page anyone. The first degraded observation opens a dwell
//! window; the degraded event is emitted only if the status is still
//! degraded when the window expires, and then only once. Recovery emits its
//! event only if the degraded event actually went out.

use std::time::{Duration, Instant};

use shep_common::events::EventKey;

pub struct DegradedGate {
    dwell: Duration,
    first_degraded: Option<Instant>,
    sent_degraded: bool,
}

impl DegradedGate {
    pub fn new(dwell: Duration) -> Self {
        Self {
            dwell,
            first_degraded: None,
            sent_degraded: false,
        }
    }

    /// Filter one cycle's transition events. `degraded_now` is whether this
    /// cycle's reported status is degraded.
    pub fn filter(
        &mut self,
        events: &[EventKey],
        degraded_now: bool,
        now: Instant,
    ) -> Vec<EventKey> {
        let mut out = Vec::new();
        for &key in events {
            match key {
                EventKey::StateDegraded => {
                    let first = *self.first_degraded.get_or_insert(now);
                    if !self.sent_degraded && now.duration_since(first) >= self.dwell {
                        self.sent_degraded = true;
                        out.push(key);
                    }
                }
                // Init events carry no expectation of a prior healthy state;
                // they bypass the dwell window.
                EventKey::InitStateDegraded => {
                    self.first_degraded = Some(now);
                    self.sent_degraded = true;
                    out.push(key);
                }
                EventKey::StateStartedAfterDegraded => {
                    if self.sent_degraded {
                        out.push(key);
                    } else {
                        // Nobody heard about the degradation; report a plain
                        // start instead of a recovery.
                        out.push(EventKey::StateStarted);
                    }
                }
                other => out.push(other),
            }
        }
        if !degraded_now {
            self.first_degraded = None;
            self.sent_degraded = false;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DWELL: Duration = Duration::from_secs(120);

    #[test]
    fn test_transient_degraded_is_suppressed() {
        let mut gate = DegradedGate::new(DWELL);
        let t0 = Instant::now();

        let out = gate.filter(&[EventKey::StateDegraded], true, t0);
        assert!(out.is_empty());

        // Recovered before the window expired: plain start, no recovery event.
        let out = gate.filter(
            &[EventKey::StateStartedAfterDegraded],
            false,
            t0 + Duration::from_secs(30),
        );
        assert_eq!(out, vec![EventKey::StateStarted]);
    }

    #[test]
    fn test_sustained_degraded_emits_once() {
        let mut gate = DegradedGate::new(DWELL);
        let t0 = Instant::now();

        assert!(gate.filter(&[EventKey::StateDegraded], true, t0).is_empty());
        assert!(
            gate.filter(&[EventKey::StateDegraded], true, t0 + Duration::from_secs(60))
                .is_empty()
        );
        let out = gate.filter(&[EventKey::StateDegraded], true, t0 + DWELL);
        assert_eq!(out, vec![EventKey::StateDegraded]);
        // Still degraded: no repeat.
        assert!(
            gate.filter(&[EventKey::StateDegraded], true, t0 + DWELL + Duration::from_secs(10))
                .is_empty()
        );
    }

    #[test]
    fn test_recovery_after_sent_event() {
        let mut gate = DegradedGate::new(DWELL);
        let t0 = Instant::now();

        gate.filter(&[EventKey::StateDegraded], true, t0);
        gate.filter(&[EventKey::StateDegraded], true, t0 + DWELL);

        let out = gate.filter(
            &[EventKey::StateStartedAfterDegraded],
            false,
            t0 + DWELL + Duration::from_secs(10),
        );
        assert_eq!(out, vec![EventKey::StateStartedAfterDegraded]);

        // A fresh degradation restarts the window from scratch.
        let t1 = t0 + DWELL + Duration::from_secs(60);
        assert!(gate.filter(&[EventKey::StateDegraded], true, t1).is_empty());
    }

    #[test]
    fn test_healthy_cycle_resets_pending_window() {
        let mut gate = DegradedGate::new(DWELL);
        let t0 = Instant::now();

        gate.filter(&[EventKey::StateDegraded], true, t0);
        // A healthy cycle in between (steady running, no events).
        gate.filter(&[], false, t0 + Duration::from_secs(60));
        // Degraded again: the window starts over, so dwell from t0 does not
        // trigger yet.
        assert!(
            gate.filter(&[EventKey::StateDegraded], true, t0 + DWELL)
                .is_empty()
        );
    }

    #[test]
    fn test_init_degraded_bypasses_dwell() {
        let mut gate = DegradedGate::new(DWELL);
        let out = gate.filter(&[EventKey::InitStateDegraded], true, Instant::now());
        assert_eq!(out, vec![EventKey::InitStateDegraded]);
    }

    #[test]
    fn test_unrelated_events_pass_through() {
        let mut gate = DegradedGate::new(DWELL);
        let out = gate.filter(&[EventKey::StateUnexpectedStopped], false, Instant::now());
        assert_eq!(out, vec![EventKey::StateUnexpectedStopped]);
    }
}
