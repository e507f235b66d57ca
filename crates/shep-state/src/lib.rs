//! Lifecycle state for the managed application server.
//!
//! One state per domain, persisted in the store, advanced by the status
//! monitor through the transition table and written directly by user-action
//! code around its own operations.

pub mod machine;
pub mod transitions;

pub use machine::StateMachine;
pub use transitions::{Transition, TransitionTable};

use serde::{Deserialize, Serialize};

/// Controller-side lifecycle state of the managed application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// No primary agent connected.
    Disconnected,
    /// Primary connected, no status observed yet.
    Pending,
    Starting,
    Started,
    Stopping,
    Stopped,
    /// Observed stopped without a controller-initiated stop.
    StoppedUnexpected,
    Degraded,
    StartingRestore,
    StoppingRestore,
    StoppedRestore,
    StartedBackup,
    StoppedBackup,
    StartedBackupRestore,
    StoppedBackupRestore,
    Upgrading,
    Restarting,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Pending => "PENDING",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::StoppedUnexpected => "STOPPED_UNEXPECTED",
            Self::Degraded => "DEGRADED",
            Self::StartingRestore => "STARTING_RESTORE",
            Self::StoppingRestore => "STOPPING_RESTORE",
            Self::StoppedRestore => "STOPPED_RESTORE",
            Self::StartedBackup => "STARTED_BACKUP",
            Self::StoppedBackup => "STOPPED_BACKUP",
            Self::StartedBackupRestore => "STARTED_BACKUP_RESTORE",
            Self::StoppedBackupRestore => "STOPPED_BACKUP_RESTORE",
            Self::Upgrading => "UPGRADING",
            Self::Restarting => "RESTARTING",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "DISCONNECTED" => Self::Disconnected,
            "PENDING" => Self::Pending,
            "STARTING" => Self::Starting,
            "STARTED" => Self::Started,
            "STOPPING" => Self::Stopping,
            "STOPPED" => Self::Stopped,
            "STOPPED_UNEXPECTED" => Self::StoppedUnexpected,
            "DEGRADED" => Self::Degraded,
            "STARTING_RESTORE" => Self::StartingRestore,
            "STOPPING_RESTORE" => Self::StoppingRestore,
            "STOPPED_RESTORE" => Self::StoppedRestore,
            "STARTED_BACKUP" => Self::StartedBackup,
            "STOPPED_BACKUP" => Self::StoppedBackup,
            "STARTED_BACKUP_RESTORE" => Self::StartedBackupRestore,
            "STOPPED_BACKUP_RESTORE" => Self::StoppedBackupRestore,
            "UPGRADING" => Self::Upgrading,
            "RESTARTING" => Self::Restarting,
            _ => return None,
        })
    }

    /// All states the transition table must cover.
    pub fn all() -> &'static [LifecycleState] {
        &[
            Self::Disconnected,
            Self::Pending,
            Self::Starting,
            Self::Started,
            Self::Stopping,
            Self::Stopped,
            Self::StoppedUnexpected,
            Self::Degraded,
            Self::StartingRestore,
            Self::StoppingRestore,
            Self::StoppedRestore,
            Self::StartedBackup,
            Self::StoppedBackup,
            Self::StartedBackupRestore,
            Self::StoppedBackupRestore,
            Self::Upgrading,
            Self::Restarting,
        ]
    }

    /// True while the application's backing store can serve queries. False
    /// for the disconnected, pending, stopping, stopped, starting,
    /// restarting and upgrading families.
    pub fn is_query_safe(&self) -> bool {
        matches!(
            self,
            Self::Started | Self::Degraded | Self::StartedBackup | Self::StartedBackupRestore
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status reported by the managed application itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportedStatus {
    Running,
    Stopped,
    Degraded,
    Unknown,
}

impl ReportedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Degraded => "DEGRADED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "RUNNING" => Self::Running,
            "STOPPED" => Self::Stopped,
            "DEGRADED" => Self::Degraded,
            _ => Self::Unknown,
        }
    }

    /// The statuses a responding primary can report. `Unknown` means no
    /// primary and is handled before any table lookup.
    pub fn reportable() -> &'static [ReportedStatus] {
        &[Self::Running, Self::Stopped, Self::Degraded]
    }
}

impl std::fmt::Display for ReportedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in LifecycleState::all() {
            assert_eq!(LifecycleState::from_str(state.as_str()), Some(*state));
        }
        assert_eq!(LifecycleState::from_str("BOGUS"), None);
    }

    #[test]
    fn test_query_safety() {
        assert!(LifecycleState::Started.is_query_safe());
        assert!(LifecycleState::Degraded.is_query_safe());
        assert!(LifecycleState::StartedBackup.is_query_safe());
        assert!(!LifecycleState::Stopped.is_query_safe());
        assert!(!LifecycleState::StoppedBackup.is_query_safe());
        assert!(!LifecycleState::Starting.is_query_safe());
        assert!(!LifecycleState::Upgrading.is_query_safe());
        assert!(!LifecycleState::Disconnected.is_query_safe());
    }

    #[test]
    fn test_reported_status_parse() {
        assert_eq!(ReportedStatus::parse("RUNNING"), ReportedStatus::Running);
        assert_eq!(ReportedStatus::parse("garbled"), ReportedStatus::Unknown);
    }
}
