//! Backup orchestration.
//!
//! A backup runs against the primary under the user-action lock, parks the
//! state machine in a backup in-flight state, and places the produced file
//! per the disk check decision. A failed placement copy does not fail the
//! backup; the file stays on the primary and the report says so.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use shep_common::error::OpError;
use shep_common::events::EventKey;
use shep_common::report::{OpReport, seconds_str, size_str};
use shep_registry::{AgentConnection, RunOpts};
use shep_state::LifecycleState;
use shep_store::{FILE_KIND_BACKUP, STORAGE_TYPE_CLOUD};

use crate::Orchestrator;
use crate::diskcheck::{self, PinnedTarget, PlacementTarget, join};
use crate::placefile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    User,
    Scheduled,
}

impl Initiator {
    pub fn is_auto(&self) -> bool {
        matches!(self, Initiator::Scheduled)
    }

    fn started_key(&self) -> EventKey {
        match self {
            Initiator::User => EventKey::BackupStarted,
            Initiator::Scheduled => EventKey::BackupStartedScheduled,
        }
    }

    fn finished_key(&self, copy_failed: bool) -> EventKey {
        match (self, copy_failed) {
            (Initiator::User, false) => EventKey::BackupFinished,
            (Initiator::User, true) => EventKey::BackupFinishedCopyFailed,
            (Initiator::Scheduled, false) => EventKey::BackupFinishedScheduled,
            (Initiator::Scheduled, true) => EventKey::BackupFinishedScheduledCopyFailed,
        }
    }

    fn failed_key(&self) -> EventKey {
        match self {
            Initiator::User => EventKey::BackupFailed,
            Initiator::Scheduled => EventKey::BackupFailedScheduled,
        }
    }
}

impl Orchestrator {
    /// Run a backup now. Precondition failures (busy, bad state, no room)
    /// return `Err` with no side effects; execution failures return a
    /// `FAILED` report.
    pub async fn backup(&self, initiator: Initiator) -> Result<OpReport, OpError> {
        self.backup_to(initiator, None).await
    }

    /// Backup with a caller-pinned placement destination.
    pub async fn backup_to(
        &self,
        initiator: Initiator,
        pin: Option<PinnedTarget>,
    ) -> Result<OpReport, OpError> {
        let primary = self.primary()?;
        let _guard = primary.try_user_action()?;
        self.backup_locked(&primary, initiator, pin.as_ref()).await
    }

    /// Backup body, called with `primary`'s user-action lock already held;
    /// the same connection is used for every command so a reconnect cannot
    /// reroute the tail of the operation. Shared with stop-with-backup.
    pub(crate) async fn backup_locked(
        &self,
        primary: &Arc<AgentConnection>,
        initiator: Initiator,
        pin: Option<&PinnedTarget>,
    ) -> Result<OpReport, OpError> {
        let prior = self.state.get_state().await;
        let op_state = match prior {
            LifecycleState::Started | LifecycleState::Degraded => LifecycleState::StartedBackup,
            LifecycleState::Stopped | LifecycleState::StoppedUnexpected => {
                LifecycleState::StoppedBackup
            }
            other => {
                return Err(OpError::InvalidStateForOperation(format!(
                    "cannot back up while {other}"
                )));
            }
        };

        let min_needed = (primary.data_size_bytes as f64 * self.cfg.min_disk_ratio) as u64;
        let dcheck = diskcheck::check(
            &self.registry,
            self.cloud.as_ref(),
            primary,
            &self.cfg.backup_dir,
            min_needed,
            pin,
        )?;

        self.state.update(op_state).await?;
        self.events.publish(initiator.started_key(), json!({}));

        let name = format!("{}.bak", Utc::now().format("%Y%m%d_%H%M%S"));
        let full_path = join(&dcheck.primary_dir, &name);
        let started = Instant::now();
        let run = self
            .channel
            .run(
                primary,
                &format!("srvadmin backup \"{full_path}\""),
                RunOpts::with_timeout(self.command_timeout()),
            )
            .await;

        let mut report = match run {
            Ok(result) if result.is_ok() => {
                self.finish_backup(primary, initiator, &full_path, started, pin)
                    .await
            }
            Ok(result) => {
                let error = result
                    .error
                    .unwrap_or_else(|| "backup command failed".to_string());
                self.events
                    .publish(initiator.failed_key(), json!({ "error": error }));
                OpReport::failed(error).with_info(format!(
                    "Backup command elapsed time before failure: {}",
                    seconds_str(started.elapsed().as_secs())
                ))
            }
            Err(e) => {
                self.events
                    .publish(initiator.failed_key(), json!({ "error": e.to_string() }));
                OpReport::from(e)
            }
        };

        // The state goes back whatever the outcome; the next status cycle
        // corrects it if the truth changed underneath the operation.
        if let Err(e) = self.state.update(prior).await {
            warn!(error = %e, "Failed to restore state after backup");
            report.append_info("Warning: state restore failed after backup.");
        }

        if report.is_ok() {
            self.rotate_backups(initiator).await;
        }
        Ok(report)
    }

    async fn finish_backup(
        &self,
        primary: &Arc<AgentConnection>,
        initiator: Initiator,
        full_path: &str,
        started: Instant,
        pin: Option<&PinnedTarget>,
    ) -> OpReport {
        let size = match self.channel.file_size(primary, full_path).await {
            Ok(size) => size,
            Err(e) => {
                warn!(path = full_path, error = %e, "Could not stat backup file");
                0
            }
        };
        let command_elapsed = started.elapsed();

        let min_needed = (primary.data_size_bytes as f64 * self.cfg.min_disk_ratio) as u64;
        let dcheck = match diskcheck::check(
            &self.registry,
            self.cloud.as_ref(),
            primary,
            &self.cfg.backup_dir,
            min_needed,
            pin,
        ) {
            Ok(d) => d,
            Err(_) => {
                // Placement re-check failed; keep the file where it is.
                crate::diskcheck::DiskCheck {
                    primary_dir: placefile::dirname(full_path),
                    target: PlacementTarget::Primary,
                    min_needed,
                }
            }
        };

        let placed = match placefile::place(
            &self.channel,
            &self.store,
            &self.events,
            self.cloud.as_ref(),
            primary,
            &dcheck,
            full_path,
            FILE_KIND_BACKUP,
            initiator.is_auto(),
            self.command_timeout(),
        )
        .await
        {
            Ok(placed) => placed,
            Err(e) => {
                self.events
                    .publish(initiator.failed_key(), json!({ "error": e.to_string() }));
                return OpReport::from(e);
            }
        };

        let mut report = OpReport::ok();
        report.size = Some(size_str(size));
        report.copy_failed = placed.copy_failed;
        report.append_info(format!("Backup size: {}", size_str(size)));
        if placed.copied {
            let total = command_elapsed + placed.copy_elapsed;
            let pct = |part: u64| {
                if total.as_secs() == 0 {
                    0
                } else {
                    part * 100 / total.as_secs()
                }
            };
            report.append_info(format!(
                "Backup elapsed time: {} ({}%), copy elapsed time: {} ({}%), \
                 total elapsed time: {}",
                seconds_str(command_elapsed.as_secs()),
                pct(command_elapsed.as_secs()),
                seconds_str(placed.copy_elapsed.as_secs()),
                pct(placed.copy_elapsed.as_secs()),
                seconds_str(total.as_secs()),
            ));
        } else {
            report.append_info(format!(
                "Backup elapsed time: {}",
                seconds_str(command_elapsed.as_secs())
            ));
        }
        report.append_info(placed.info.clone());

        let entry = &placed.entry;
        if entry.storage_type == STORAGE_TYPE_CLOUD {
            report.destination_type = Some(entry.storage_type.clone());
            report.destination_name = Some(entry.storage_name.clone());
            report.destination_location = Some(entry.storage_location.clone());
        } else {
            let holder = entry
                .storage_name
                .parse()
                .ok()
                .and_then(|uuid| self.registry.agent(uuid))
                .map(|a| a.displayname.clone())
                .unwrap_or_else(|| entry.storage_name.clone());
            report.destination_type = Some(entry.storage_type.clone());
            report.destination_name = Some(holder);
            report.destination_location = Some(entry.storage_location.clone());
        }

        self.events.publish(
            initiator.finished_key(placed.copy_failed),
            json!({
                "name": entry.name,
                "size": size_str(size),
                "destination": report.destination_name.clone(),
            }),
        );
        report
    }

    async fn rotate_backups(&self, initiator: Initiator) {
        let retain = if initiator.is_auto() {
            self.cfg.backup_auto_retain
        } else {
            self.cfg.backup_user_retain
        };
        if let Err(e) = self
            .rotate_files(FILE_KIND_BACKUP, initiator.is_auto(), retain)
            .await
        {
            warn!(error = %e, "Backup rotation failed");
        }
    }
}
