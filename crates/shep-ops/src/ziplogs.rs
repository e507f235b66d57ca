//! Log archive orchestration.
//!
//! Structurally a lighter backup: disk check, `srvadmin ziplogs`, placement,
//! rotation. Unlike backup it runs in any state that has a primary and does
//! not move the state machine.

use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use shep_common::error::OpError;
use shep_common::events::EventKey;
use shep_common::report::{OpReport, seconds_str, size_str};
use shep_registry::RunOpts;
use shep_store::FILE_KIND_ZIPLOG;

use crate::Orchestrator;
use crate::backup::Initiator;
use crate::diskcheck::{self, PinnedTarget, join};
use crate::placefile;

impl Orchestrator {
    pub async fn ziplogs(&self, initiator: Initiator) -> Result<OpReport, OpError> {
        self.ziplogs_to(initiator, None).await
    }

    /// Ziplogs with a caller-pinned placement destination.
    pub async fn ziplogs_to(
        &self,
        initiator: Initiator,
        pin: Option<PinnedTarget>,
    ) -> Result<OpReport, OpError> {
        let primary = self.primary()?;
        let _guard = primary.try_user_action()?;

        let min_needed = (primary.data_size_bytes as f64 * self.cfg.min_disk_ratio) as u64;
        let dcheck = diskcheck::check(
            &self.registry,
            self.cloud.as_ref(),
            &primary,
            &self.cfg.ziplog_dir,
            min_needed,
            pin.as_ref(),
        )?;

        self.events.publish(EventKey::ZiplogsStarted, json!({}));

        let name = format!("logs_{}.zip", Utc::now().format("%Y%m%d_%H%M%S"));
        let full_path = join(&dcheck.primary_dir, &name);
        let started = Instant::now();
        let run = self
            .channel
            .run(
                &primary,
                &format!("srvadmin ziplogs \"{full_path}\""),
                RunOpts::with_timeout(self.command_timeout()),
            )
            .await;

        let report = match run {
            Ok(result) if result.is_ok() => {
                let size = match self.channel.file_size(&primary, &full_path).await {
                    Ok(size) => size,
                    Err(e) => {
                        warn!(path = %full_path, error = %e, "Could not stat log archive");
                        0
                    }
                };
                let command_elapsed = started.elapsed();

                match placefile::place(
                    &self.channel,
                    &self.store,
                    &self.events,
                    self.cloud.as_ref(),
                    &primary,
                    &dcheck,
                    &full_path,
                    FILE_KIND_ZIPLOG,
                    initiator.is_auto(),
                    self.command_timeout(),
                )
                .await
                {
                    Ok(placed) => {
                        let mut report = OpReport::ok();
                        report.size = Some(size_str(size));
                        report.copy_failed = placed.copy_failed;
                        report.append_info(format!("Log archive size: {}", size_str(size)));
                        report.append_info(format!(
                            "Ziplogs elapsed time: {}",
                            seconds_str(command_elapsed.as_secs())
                        ));
                        report.append_info(placed.info.clone());
                        self.events.publish(
                            EventKey::ZiplogsFinished,
                            json!({ "name": placed.entry.name, "size": size_str(size) }),
                        );
                        report
                    }
                    Err(e) => {
                        self.events
                            .publish(EventKey::ZiplogsFailed, json!({ "error": e.to_string() }));
                        OpReport::from(e)
                    }
                }
            }
            Ok(result) => {
                let error = result
                    .error
                    .unwrap_or_else(|| "ziplogs command failed".to_string());
                self.events
                    .publish(EventKey::ZiplogsFailed, json!({ "error": error }));
                OpReport::failed(error)
            }
            Err(e) => {
                self.events
                    .publish(EventKey::ZiplogsFailed, json!({ "error": e.to_string() }));
                OpReport::from(e)
            }
        };

        if report.is_ok() {
            let retain = if initiator.is_auto() {
                self.cfg.ziplog_auto_retain
            } else {
                self.cfg.ziplog_user_retain
            };
            if let Err(e) = self
                .rotate_files(FILE_KIND_ZIPLOG, initiator.is_auto(), retain)
                .await
            {
                warn!(error = %e, "Ziplog rotation failed");
            }
        }
        Ok(report)
    }
}
