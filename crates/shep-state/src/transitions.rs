//! Transition table keyed by (prior state, reported status).
//!
//! The status monitor is the only consumer. An entry names the next state,
//! zero or more events to emit, and whether the maintenance page should be
//! taken down or put up as a side effect. The table is validated for
//! completeness at construction, so an unmatched lookup at runtime can only
//! mean a bug, and the monitor logs and abandons the cycle rather than
//! guessing.

use std::collections::HashMap;

use anyhow::{Result, bail};
use shep_common::events::EventKey;

use crate::{LifecycleState, ReportedStatus};

#[derive(Debug, Clone)]
pub struct Transition {
    pub next: LifecycleState,
    pub events: Vec<EventKey>,
    /// Ensure the maintenance page is down (the application serves).
    pub maint_stop: bool,
    /// Ensure the maintenance page is up (the application does not serve).
    pub maint_start: bool,
}

impl Transition {
    fn to(next: LifecycleState) -> Self {
        Self {
            next,
            events: Vec::new(),
            maint_stop: false,
            maint_start: false,
        }
    }

    fn event(mut self, key: EventKey) -> Self {
        self.events.push(key);
        self
    }

    fn maint_stop(mut self) -> Self {
        self.maint_stop = true;
        self
    }

    fn maint_start(mut self) -> Self {
        self.maint_start = true;
        self
    }
}

pub struct TransitionTable {
    map: HashMap<(LifecycleState, ReportedStatus), Transition>,
}

impl TransitionTable {
    /// Build and completeness-check the table: every lifecycle state must
    /// have an entry for every reportable status.
    pub fn new() -> Result<Self> {
        let table = Self::build();
        for state in LifecycleState::all() {
            for status in ReportedStatus::reportable() {
                if !table.map.contains_key(&(*state, *status)) {
                    bail!("Transition table is missing ({state}, {status})");
                }
            }
        }
        Ok(table)
    }

    pub fn lookup(&self, state: LifecycleState, status: ReportedStatus) -> Option<&Transition> {
        self.map.get(&(state, status))
    }

    fn build() -> Self {
        use EventKey::*;
        use LifecycleState::*;
        use ReportedStatus as S;

        let mut map = HashMap::new();
        let mut at = |state: LifecycleState, status: ReportedStatus, t: Transition| {
            map.insert((state, status), t);
        };

        // First observation after connect. No prior expectation, so these
        // emit the INIT variants and reconcile the maintenance page.
        for boot in [Disconnected, Pending] {
            at(boot, S::Running, Transition::to(Started).event(InitStateStarted).maint_stop());
            at(boot, S::Stopped, Transition::to(Stopped).event(InitStateStopped).maint_start());
            at(boot, S::Degraded, Transition::to(Degraded).event(InitStateDegraded));
        }

        // Controller-initiated start in progress. Stopped/degraded readings
        // are expected noise until the application comes up.
        at(Starting, S::Running, Transition::to(Started).event(StateStarted).maint_stop());
        at(Starting, S::Stopped, Transition::to(Starting));
        at(Starting, S::Degraded, Transition::to(Starting));

        at(Started, S::Running, Transition::to(Started));
        at(
            Started,
            S::Stopped,
            Transition::to(StoppedUnexpected).event(StateUnexpectedStopped).maint_start(),
        );
        at(Started, S::Degraded, Transition::to(Degraded).event(StateDegraded));

        // Controller-initiated stop in progress.
        at(Stopping, S::Running, Transition::to(Stopping));
        at(Stopping, S::Stopped, Transition::to(Stopped));
        at(Stopping, S::Degraded, Transition::to(Stopping));

        at(
            Stopped,
            S::Running,
            Transition::to(Started).event(StateUnexpectedStarted).maint_stop(),
        );
        at(Stopped, S::Stopped, Transition::to(Stopped));
        at(Stopped, S::Degraded, Transition::to(Degraded).event(StateDegraded));

        at(
            StoppedUnexpected,
            S::Running,
            Transition::to(Started).event(StateStarted).maint_stop(),
        );
        at(StoppedUnexpected, S::Stopped, Transition::to(StoppedUnexpected));
        at(
            StoppedUnexpected,
            S::Degraded,
            Transition::to(Degraded).event(StateDegraded),
        );

        at(
            Degraded,
            S::Running,
            Transition::to(Started).event(StateStartedAfterDegraded).maint_stop(),
        );
        at(
            Degraded,
            S::Stopped,
            Transition::to(StoppedUnexpected)
                .event(StateUnexpectedStoppedAfterDegraded)
                .maint_start(),
        );
        at(Degraded, S::Degraded, Transition::to(Degraded).event(StateDegraded));

        // States owned by an in-flight user action or upgrade window. The
        // operation itself moves the machine out of them; the monitor holds
        // position and emits nothing.
        for held in [
            StartingRestore,
            StoppingRestore,
            StoppedRestore,
            StartedBackup,
            StoppedBackup,
            StartedBackupRestore,
            StoppedBackupRestore,
            Upgrading,
            Restarting,
        ] {
            for status in ReportedStatus::reportable() {
                at(held, *status, Transition::to(held));
            }
        }

        Self { map }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_complete() {
        let table = TransitionTable::new().unwrap();
        for state in LifecycleState::all() {
            for status in ReportedStatus::reportable() {
                assert!(
                    table.lookup(*state, *status).is_some(),
                    "missing ({state}, {status})"
                );
            }
        }
    }

    #[test]
    fn test_unexpected_stop_raises_maintenance_page() {
        let table = TransitionTable::new().unwrap();
        let t = table
            .lookup(LifecycleState::Started, ReportedStatus::Stopped)
            .unwrap();
        assert_eq!(t.next, LifecycleState::StoppedUnexpected);
        assert_eq!(t.events, vec![EventKey::StateUnexpectedStopped]);
        assert!(t.maint_start);
        assert!(!t.maint_stop);
    }

    #[test]
    fn test_recovery_from_degraded() {
        let table = TransitionTable::new().unwrap();
        let t = table
            .lookup(LifecycleState::Degraded, ReportedStatus::Running)
            .unwrap();
        assert_eq!(t.next, LifecycleState::Started);
        assert_eq!(t.events, vec![EventKey::StateStartedAfterDegraded]);
        assert!(t.maint_stop);
    }

    #[test]
    fn test_first_observation_emits_init_events() {
        let table = TransitionTable::new().unwrap();
        for boot in [LifecycleState::Disconnected, LifecycleState::Pending] {
            let t = table.lookup(boot, ReportedStatus::Stopped).unwrap();
            assert_eq!(t.next, LifecycleState::Stopped);
            assert_eq!(t.events, vec![EventKey::InitStateStopped]);
        }
    }

    #[test]
    fn test_operation_states_hold_position() {
        let table = TransitionTable::new().unwrap();
        for status in ReportedStatus::reportable() {
            let t = table
                .lookup(LifecycleState::StartedBackup, *status)
                .unwrap();
            assert_eq!(t.next, LifecycleState::StartedBackup);
            assert!(t.events.is_empty());
            assert!(!t.maint_start && !t.maint_stop);
        }
    }

    #[test]
    fn test_starting_tolerates_interim_readings() {
        let table = TransitionTable::new().unwrap();
        for status in [ReportedStatus::Stopped, ReportedStatus::Degraded] {
            let t = table.lookup(LifecycleState::Starting, status).unwrap();
            assert_eq!(t.next, LifecycleState::Starting);
            assert!(t.events.is_empty());
        }
    }
}
