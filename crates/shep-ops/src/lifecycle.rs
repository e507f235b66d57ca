//! User-initiated start, stop, and restart of the managed application.
//!
//! These own the state machine for the duration of the command: the state is
//! parked in the matching in-flight state before the command is issued and
//! resolved from the command result afterwards. The status monitor corrects
//! any drift on its next cycle.

use std::time::Instant;

use tracing::warn;

use shep_common::error::OpError;
use shep_common::report::{OpReport, seconds_str};
use shep_registry::RunOpts;
use shep_state::LifecycleState;

use crate::Orchestrator;
use crate::backup::Initiator;

impl Orchestrator {
    pub async fn start(&self) -> Result<OpReport, OpError> {
        let primary = self.primary()?;
        let _guard = primary.try_user_action()?;

        match self.state.get_state().await {
            LifecycleState::Stopped
            | LifecycleState::StoppedUnexpected
            | LifecycleState::StoppedRestore => {}
            other => {
                return Err(OpError::InvalidStateForOperation(format!(
                    "cannot start while {other}"
                )));
            }
        }

        self.state.update(LifecycleState::Starting).await?;
        let started = Instant::now();
        let run = self
            .channel
            .run(
                &primary,
                "srvadmin start",
                RunOpts::with_timeout(self.command_timeout()),
            )
            .await;

        match run {
            Ok(result) if result.is_ok() => {
                if let Err(e) = self.maint.ensure_stopped().await {
                    warn!(error = %e, "Could not stop maintenance page after start");
                }
                self.state.update(LifecycleState::Started).await?;
                Ok(OpReport::ok().with_info(format!(
                    "Start elapsed time: {}",
                    seconds_str(started.elapsed().as_secs())
                )))
            }
            Ok(result) => {
                self.state.update(LifecycleState::Stopped).await?;
                Ok(OpReport::failed(result.error.unwrap_or_else(|| {
                    "start command failed".to_string()
                })))
            }
            Err(e) => {
                self.state.update(LifecycleState::Stopped).await?;
                Ok(OpReport::from(e))
            }
        }
    }

    pub async fn stop(&self, backup_first: bool) -> Result<OpReport, OpError> {
        let primary = self.primary()?;
        let _guard = primary.try_user_action()?;

        match self.state.get_state().await {
            LifecycleState::Started | LifecycleState::Degraded => {}
            other => {
                return Err(OpError::InvalidStateForOperation(format!(
                    "cannot stop while {other}"
                )));
            }
        }

        if backup_first {
            let backup = self.backup_locked(&primary, Initiator::User, None).await?;
            if !backup.is_ok() {
                // The stop is abandoned; the backup failure is the result.
                return Ok(backup.with_info("Stop abandoned after failed backup."));
            }
        }

        self.state.update(LifecycleState::Stopping).await?;
        let started = Instant::now();
        let run = self
            .channel
            .run(
                &primary,
                "srvadmin stop",
                RunOpts::with_timeout(self.command_timeout()),
            )
            .await;

        match run {
            Ok(result) if result.is_ok() => {
                self.state.update(LifecycleState::Stopped).await?;
                if let Err(e) = self.maint.ensure_started().await {
                    warn!(error = %e, "Could not start maintenance page after stop");
                }
                Ok(OpReport::ok().with_info(format!(
                    "Stop elapsed time: {}",
                    seconds_str(started.elapsed().as_secs())
                )))
            }
            Ok(result) => {
                self.state.update(LifecycleState::Started).await?;
                Ok(OpReport::failed(result.error.unwrap_or_else(|| {
                    "stop command failed".to_string()
                })))
            }
            Err(e) => {
                self.state.update(LifecycleState::Started).await?;
                Ok(OpReport::from(e))
            }
        }
    }

    /// Stop then start under one user-action window, holding `RESTARTING`
    /// throughout so the status monitor sits out the bounce.
    pub async fn restart(&self, backup_first: bool) -> Result<OpReport, OpError> {
        let primary = self.primary()?;
        let _guard = primary.try_user_action()?;

        match self.state.get_state().await {
            LifecycleState::Started | LifecycleState::Degraded => {}
            other => {
                return Err(OpError::InvalidStateForOperation(format!(
                    "cannot restart while {other}"
                )));
            }
        }

        if backup_first {
            let backup = self.backup_locked(&primary, Initiator::User, None).await?;
            if !backup.is_ok() {
                return Ok(backup.with_info("Restart abandoned after failed backup."));
            }
        }

        self.state.update(LifecycleState::Restarting).await?;
        let started = Instant::now();

        let stop = self
            .channel
            .run(
                &primary,
                "srvadmin stop",
                RunOpts::with_timeout(self.command_timeout()),
            )
            .await;
        let stop_error = match &stop {
            Ok(result) if result.is_ok() => None,
            Ok(result) => Some(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "stop command failed".to_string()),
            ),
            Err(e) => Some(e.to_string()),
        };
        if let Some(detail) = stop_error {
            self.state.update(LifecycleState::Started).await?;
            return Ok(OpReport::failed(format!("Restart stop phase: {detail}")));
        }
        if let Err(e) = self.maint.ensure_started().await {
            warn!(error = %e, "Could not start maintenance page during restart");
        }

        let start = self
            .channel
            .run(
                &primary,
                "srvadmin start",
                RunOpts::with_timeout(self.command_timeout()),
            )
            .await;
        match start {
            Ok(result) if result.is_ok() => {
                if let Err(e) = self.maint.ensure_stopped().await {
                    warn!(error = %e, "Could not stop maintenance page after restart");
                }
                self.state.update(LifecycleState::Started).await?;
                Ok(OpReport::ok().with_info(format!(
                    "Restart elapsed time: {}",
                    seconds_str(started.elapsed().as_secs())
                )))
            }
            Ok(result) => {
                self.state.update(LifecycleState::Stopped).await?;
                Ok(OpReport::failed(format!(
                    "Restart start phase: {}",
                    result
                        .error
                        .unwrap_or_else(|| "start command failed".to_string())
                )))
            }
            Err(e) => {
                self.state.update(LifecycleState::Stopped).await?;
                Ok(OpReport::failed(format!("Restart start phase: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::harness;

    #[tokio::test]
    async fn test_stop_while_stopped_sends_no_command() {
        let h = harness().await;
        h.orch
            .state
            .update(LifecycleState::Stopped)
            .await
            .unwrap();

        let err = h.orch.stop(false).await.unwrap_err();
        assert!(matches!(err, OpError::InvalidStateForOperation(_)));
        assert!(h.script.commands().is_empty());
        assert_eq!(h.orch.state.get_state().await, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_issues_command_and_lands_stopped() {
        let h = harness().await;
        h.orch
            .state
            .update(LifecycleState::Started)
            .await
            .unwrap();

        let report = h.orch.stop(false).await.unwrap();
        assert!(report.is_ok());
        assert_eq!(h.script.commands(), vec!["srvadmin stop"]);
        assert_eq!(h.orch.state.get_state().await, LifecycleState::Stopped);
        assert!(h.orch.maint.is_started());
    }

    #[tokio::test]
    async fn test_stop_with_backup_runs_backup_first() {
        let h = harness().await;
        h.orch
            .state
            .update(LifecycleState::Started)
            .await
            .unwrap();

        let report = h.orch.stop(true).await.unwrap();
        assert!(report.is_ok(), "{report:?}");
        let commands = h.script.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].starts_with("srvadmin backup"));
        assert_eq!(commands[1], "srvadmin stop");
    }

    #[tokio::test]
    async fn test_start_from_stopped() {
        let h = harness().await;
        h.orch
            .state
            .update(LifecycleState::Stopped)
            .await
            .unwrap();

        let report = h.orch.start().await.unwrap();
        assert!(report.is_ok());
        assert_eq!(h.script.commands(), vec!["srvadmin start"]);
        assert_eq!(h.orch.state.get_state().await, LifecycleState::Started);
    }

    #[tokio::test]
    async fn test_start_while_started_refused() {
        let h = harness().await;
        h.orch
            .state
            .update(LifecycleState::Started)
            .await
            .unwrap();

        let err = h.orch.start().await.unwrap_err();
        assert!(matches!(err, OpError::InvalidStateForOperation(_)));
        assert!(h.script.commands().is_empty());
    }

    #[tokio::test]
    async fn test_restart_runs_stop_then_start() {
        let h = harness().await;
        h.orch
            .state
            .update(LifecycleState::Started)
            .await
            .unwrap();

        let report = h.orch.restart(false).await.unwrap();
        assert!(report.is_ok());
        assert_eq!(h.script.commands(), vec!["srvadmin stop", "srvadmin start"]);
        assert_eq!(h.orch.state.get_state().await, LifecycleState::Started);
        assert!(!h.orch.maint.is_started());
    }
}
