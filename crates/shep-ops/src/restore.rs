//! Restore orchestration.
//!
//! Order matters here: the backup file is staged onto the primary before
//! anything is stopped, so a missing or unreachable file aborts the whole
//! operation with the application untouched. The restore command brings the
//! application up itself on success; after a failed restore the application
//! is started explicitly so the fleet is not left down.

use serde_json::json;
use tracing::{info, warn};

use shep_common::error::OpError;
use shep_common::events::EventKey;
use shep_common::report::OpReport;
use shep_registry::RunOpts;
use shep_state::LifecycleState;

use crate::Orchestrator;
use crate::placefile;

#[derive(Debug, Clone, Default)]
pub struct RestoreOpts {
    /// Password for the restored repository user, when the backup needs one.
    pub password: Option<String>,
    /// Restore data only, leaving the current configuration in place.
    pub data_only: bool,
}

impl Orchestrator {
    pub async fn restore(&self, backup_name: &str, opts: RestoreOpts) -> Result<OpReport, OpError> {
        let primary = self.primary()?;
        let _guard = primary.try_user_action()?;

        let orig_state = self.state.get_state().await;
        match orig_state {
            LifecycleState::Started
            | LifecycleState::Degraded
            | LifecycleState::Stopped
            | LifecycleState::StoppedUnexpected => {}
            other => {
                return Err(OpError::InvalidStateForOperation(format!(
                    "cannot restore while {other}"
                )));
            }
        }

        let entry = self
            .store
            .file_by_name(backup_name)
            .map_err(|e| OpError::StorageError(e.to_string()))?
            .ok_or_else(|| OpError::StorageError(format!("no such backup: {backup_name}")))?;

        // Stage the file onto the primary before touching the application.
        // A failure here leaves everything exactly as it was.
        let got = match placefile::fetch_to_primary(
            &self.channel,
            &self.registry,
            &self.events,
            self.cloud.as_ref(),
            &primary,
            &entry,
            &self.cfg.staging_dir,
            self.command_timeout(),
        )
        .await
        {
            Ok(got) => got,
            Err(e) => {
                self.events
                    .publish(EventKey::RestoreFailed, json!({ "error": e.to_string() }));
                return Ok(OpReport::failed(format!(
                    "could not stage {backup_name} on the primary: {e}"
                )));
            }
        };

        self.events
            .publish(EventKey::RestoreStarted, json!({ "name": backup_name }));

        let mut info_lines: Vec<String> = Vec::new();

        if matches!(
            orig_state,
            LifecycleState::Started | LifecycleState::Degraded
        ) {
            self.state.update(LifecycleState::StoppingRestore).await?;
            info!("Stopping the application for restore");
            let stop = self
                .channel
                .run(
                    &primary,
                    "srvadmin stop",
                    RunOpts::with_timeout(self.command_timeout()),
                )
                .await;
            let stop_error = match stop {
                Ok(result) if result.is_ok() => None,
                Ok(result) => Some(
                    result
                        .error
                        .unwrap_or_else(|| "stop command failed".to_string()),
                ),
                Err(e) => Some(e.to_string()),
            };
            if let Some(detail) = stop_error {
                self.cleanup_staged(&primary, &got).await;
                self.state.update(orig_state).await?;
                self.events
                    .publish(EventKey::RestoreFailed, json!({ "error": detail }));
                return Ok(OpReport::failed(format!("Restore stop phase: {detail}")));
            }
            self.events.publish(EventKey::StateStopped, json!({}));
        } else {
            // The application was already down; a maintenance page may be
            // holding its port. Failure to drop it is not fatal.
            if let Err(e) = self.maint.ensure_stopped().await {
                warn!(error = %e, "Maintenance page stop failed before restore");
                info_lines.push(format!("Maintenance page stop failed: {e}"));
            }
        }

        self.state.update(LifecycleState::StartingRestore).await?;

        let mut cmd = format!("srvadmin restore \"{}\"", got.primary_full_path);
        if let Some(password) = &opts.password {
            cmd.push_str(&format!(" --password \"{password}\""));
        }
        if opts.data_only {
            cmd.push_str(" --data-only");
        }

        let run = self
            .channel
            .run(&primary, &cmd, RunOpts::with_timeout(self.command_timeout()))
            .await;
        let restore_error = match run {
            Ok(result) if result.is_ok() => None,
            Ok(result) => Some(
                result
                    .error
                    .unwrap_or_else(|| "restore command failed".to_string()),
            ),
            Err(e) => Some(e.to_string()),
        };

        // The staged copy is temporary either way.
        self.cleanup_staged(&primary, &got).await;

        match restore_error {
            None => {
                // A successful restore leaves the application running.
                self.state.update(LifecycleState::Started).await?;
                self.events.publish(EventKey::StateStarted, json!({}));
                self.events
                    .publish(EventKey::RestoreFinished, json!({ "name": backup_name }));
                let mut report = OpReport::ok();
                for line in info_lines {
                    report.append_info(line);
                }
                Ok(report)
            }
            Some(detail) => {
                info!("Starting the application after failed restore");
                let start = self
                    .channel
                    .run(
                        &primary,
                        "srvadmin start",
                        RunOpts::with_timeout(self.command_timeout()),
                    )
                    .await;
                let started = matches!(&start, Ok(result) if result.is_ok());
                if started {
                    self.state.update(LifecycleState::Started).await?;
                    self.events.publish(EventKey::StateStarted, json!({}));
                } else {
                    let start_detail = match start {
                        Ok(result) => result
                            .error
                            .unwrap_or_else(|| "start command failed".to_string()),
                        Err(e) => e.to_string(),
                    };
                    info_lines.push(format!(
                        "Start after failed restore also failed: {start_detail}"
                    ));
                    self.state.update(LifecycleState::Stopped).await?;
                }
                self.events
                    .publish(EventKey::RestoreFailed, json!({ "error": detail }));
                let mut report = OpReport::failed(detail);
                for line in info_lines {
                    report.append_info(line);
                }
                Ok(report)
            }
        }
    }

    async fn cleanup_staged(
        &self,
        primary: &std::sync::Arc<shep_registry::AgentConnection>,
        got: &placefile::Fetched,
    ) {
        if !got.copied {
            return;
        }
        if let Err(e) = self
            .channel
            .file_delete(primary, &got.primary_full_path)
            .await
        {
            warn!(path = %got.primary_full_path, error = %e, "Staged file delete failed");
        }
    }
}
