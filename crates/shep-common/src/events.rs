use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// Named event keys emitted by the controller.
///
/// Downstream consumers (alert mailers, UI feeds) subscribe to the bus and
/// decide rendering and delivery; the core only publishes key + payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKey {
    ControllerStarted,
    ControllerRestarted,

    // First observation after connect, before any state was known.
    InitStateStarted,
    InitStateStopped,
    InitStateDegraded,

    StateStarted,
    StateStopped,
    StateDegraded,
    StateStartedAfterDegraded,
    StateUnexpectedStopped,
    StateUnexpectedStoppedAfterDegraded,
    StateUnexpectedStarted,

    BackupStarted,
    BackupFinished,
    BackupFinishedCopyFailed,
    BackupFailed,
    BackupStartedScheduled,
    BackupFinishedScheduled,
    BackupFinishedScheduledCopyFailed,
    BackupFailedScheduled,

    RestoreStarted,
    RestoreFinished,
    RestoreFailed,

    ZiplogsStarted,
    ZiplogsFinished,
    ZiplogsFailed,

    MaintOnline,
    MaintOffline,
    MaintStartFailed,
    MaintStopFailed,

    AgentDisconnect,
    AgentCommFailure,
    FirewallOpenFailed,
}

impl EventKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControllerStarted => "CONTROLLER-STARTED",
            Self::ControllerRestarted => "CONTROLLER-RESTARTED",
            Self::InitStateStarted => "INIT-STATE-STARTED",
            Self::InitStateStopped => "INIT-STATE-STOPPED",
            Self::InitStateDegraded => "INIT-STATE-DEGRADED",
            Self::StateStarted => "STATE-STARTED",
            Self::StateStopped => "STATE-STOPPED",
            Self::StateDegraded => "STATE-DEGRADED",
            Self::StateStartedAfterDegraded => "STATE-STARTED-AFTER-DEGRADED",
            Self::StateUnexpectedStopped => "STATE-UNEXPECTED-STOPPED",
            Self::StateUnexpectedStoppedAfterDegraded => {
                "STATE-UNEXPECTED-STOPPED-AFTER-DEGRADED"
            }
            Self::StateUnexpectedStarted => "STATE-UNEXPECTED-STARTED",
            Self::BackupStarted => "BACKUP-STARTED",
            Self::BackupFinished => "BACKUP-FINISHED",
            Self::BackupFinishedCopyFailed => "BACKUP-FINISHED-COPY-FAILED",
            Self::BackupFailed => "BACKUP-FAILED",
            Self::BackupStartedScheduled => "BACKUP-STARTED-SCHEDULED",
            Self::BackupFinishedScheduled => "BACKUP-FINISHED-SCHEDULED",
            Self::BackupFinishedScheduledCopyFailed => {
                "BACKUP-FINISHED-SCHEDULED-COPY-FAILED"
            }
            Self::BackupFailedScheduled => "BACKUP-FAILED-SCHEDULED",
            Self::RestoreStarted => "RESTORE-STARTED",
            Self::RestoreFinished => "RESTORE-FINISHED",
            Self::RestoreFailed => "RESTORE-FAILED",
            Self::ZiplogsStarted => "ZIPLOGS-STARTED",
            Self::ZiplogsFinished => "ZIPLOGS-FINISHED",
            Self::ZiplogsFailed => "ZIPLOGS-FAILED",
            Self::MaintOnline => "MAINT-ONLINE",
            Self::MaintOffline => "MAINT-OFFLINE",
            Self::MaintStartFailed => "MAINT-START-FAILED",
            Self::MaintStopFailed => "MAINT-STOP-FAILED",
            Self::AgentDisconnect => "AGENT-DISCONNECT",
            Self::AgentCommFailure => "AGENT-COMM-FAILURE",
            Self::FirewallOpenFailed => "FIREWALL-OPEN-FAILED",
        }
    }
}

/// A published event: key plus a structured payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub key: EventKey,
    pub data: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Event bus for controller → sink communication.
///
/// Fire-and-forget: publishing succeeds even with no subscribers.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(256).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish a named event with a structured data payload.
    pub fn publish(&self, key: EventKey, data: serde_json::Value) {
        info!(event = key.as_str(), "event");
        let _ = self.tx.send(Event {
            key,
            data,
            at: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(EventKey::ControllerStarted, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EventKey::BackupFinished, serde_json::json!({"size": "1 GB"}));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.key, EventKey::BackupFinished);
        assert_eq!(ev.data["size"], "1 GB");
    }

    #[test]
    fn test_key_names() {
        assert_eq!(EventKey::StateDegraded.as_str(), "STATE-DEGRADED");
        assert_eq!(
            EventKey::BackupFinishedScheduledCopyFailed.as_str(),
            "BACKUP-FINISHED-SCHEDULED-COPY-FAILED"
        );
    }
}
