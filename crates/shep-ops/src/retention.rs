//! File rotation.
//!
//! Automatic and user-requested files rotate independently: each (kind,
//! auto) bucket keeps the newest `retain` entries and deletes the rest,
//! oldest first. A catalog entry is only removed once the underlying file
//! is actually gone, so a failed delete is retried on the next rotation.

use tracing::{info, warn};

use shep_common::error::OpError;
use shep_store::{FileEntry, STORAGE_TYPE_CLOUD, STORAGE_TYPE_VOLUME};

use crate::Orchestrator;

impl Orchestrator {
    /// Rotate one (kind, auto) bucket down to `retain` entries. Returns the
    /// number of files actually deleted.
    pub async fn rotate_files(
        &self,
        kind: &str,
        auto: bool,
        retain: usize,
    ) -> Result<usize, OpError> {
        let files = self
            .store
            .files_by_kind(kind, auto)
            .map_err(|e| OpError::StorageError(e.to_string()))?;
        if files.len() <= retain {
            return Ok(0);
        }

        let excess = files.len() - retain;
        let mut removed = 0;
        for entry in files.into_iter().take(excess) {
            match self.delete_stored_file(&entry).await {
                Ok(()) => {
                    self.store
                        .remove_file(entry.fileid)
                        .map_err(|e| OpError::StorageError(e.to_string()))?;
                    info!(kind, name = %entry.name, "Rotated out");
                    removed += 1;
                }
                Err(e) => {
                    warn!(kind, name = %entry.name, error = %e, "Rotation delete failed");
                }
            }
        }
        Ok(removed)
    }

    async fn delete_stored_file(&self, entry: &FileEntry) -> Result<(), OpError> {
        match entry.storage_type.as_str() {
            STORAGE_TYPE_VOLUME => {
                let agent = entry
                    .storage_name
                    .parse()
                    .ok()
                    .and_then(|uuid| self.registry.agent(uuid))
                    .ok_or_else(|| {
                        OpError::AgentDisconnected(format!(
                            "agent holding {} is not connected",
                            entry.name
                        ))
                    })?;
                self.channel.file_delete(&agent, &entry.name).await
            }
            STORAGE_TYPE_CLOUD => {
                let cloud = self.cloud.as_ref().ok_or_else(|| {
                    OpError::StorageError("no cloud storage configured".to_string())
                })?;
                cloud.delete(&entry.name).await
            }
            other => Err(OpError::StorageError(format!(
                "unknown storage type {other} for {}",
                entry.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::harness;
    use chrono::{Duration as ChronoDuration, Utc};
    use shep_store::FILE_KIND_BACKUP;

    fn entry(h: &crate::testutil::Harness, name: &str, age_mins: i64) -> FileEntry {
        FileEntry {
            fileid: 0,
            name: name.to_string(),
            kind: FILE_KIND_BACKUP.to_string(),
            storage_type: STORAGE_TYPE_VOLUME.to_string(),
            storage_name: h.primary.uuid.to_string(),
            storage_location: "/data/server-backups".to_string(),
            auto: true,
            created_at: Utc::now() - ChronoDuration::minutes(age_mins),
        }
    }

    #[tokio::test]
    async fn test_rotation_deletes_oldest_beyond_retain() {
        let h = harness().await;
        for (name, age) in [("old.bak", 30), ("mid.bak", 20), ("new.bak", 10)] {
            h.orch.store.add_file(&entry(&h, name, age)).unwrap();
        }

        let removed = h
            .orch
            .rotate_files(FILE_KIND_BACKUP, true, 2)
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let left = h.orch.store.files_by_kind(FILE_KIND_BACKUP, true).unwrap();
        let names: Vec<_> = left.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["mid.bak", "new.bak"]);
    }

    #[tokio::test]
    async fn test_rotation_noop_under_retain() {
        let h = harness().await;
        h.orch.store.add_file(&entry(&h, "only.bak", 5)).unwrap();
        let removed = h
            .orch
            .rotate_files(FILE_KIND_BACKUP, true, 5)
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(
            h.orch.store.files_by_kind(FILE_KIND_BACKUP, true).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_catalog_entry() {
        let h = harness().await;
        // Holder agent is not connected, so the delete cannot run.
        let mut e = entry(&h, "stranded.bak", 60);
        e.storage_name = uuid::Uuid::new_v4().to_string();
        h.orch.store.add_file(&e).unwrap();
        h.orch.store.add_file(&entry(&h, "new.bak", 1)).unwrap();

        let removed = h
            .orch
            .rotate_files(FILE_KIND_BACKUP, true, 1)
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(
            h.orch.store.files_by_kind(FILE_KIND_BACKUP, true).unwrap().len(),
            2
        );
    }
}
