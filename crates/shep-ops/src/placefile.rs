//! File placement after production, and retrieval before consumption.
//!
//! `place` moves a freshly produced file (backup, ziplog archive) to its
//! decided destination and records it in the catalog. A failed copy is not
//! a failed operation: the file stays on the primary, the catalog records
//! where it actually is, and the report says the copy failed.
//!
//! `fetch_to_primary` is the inverse: given a catalog entry, make the file
//! exist on the primary (staging it from another agent or cloud storage if
//! needed) and say whether a temporary copy was made.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::warn;

use shep_common::error::OpError;
use shep_common::events::EventBus;
use shep_common::report::seconds_str;
use shep_registry::{AgentConnection, AgentRegistry, CommandChannel};
use shep_store::{FileEntry, STORAGE_TYPE_CLOUD, STORAGE_TYPE_VOLUME, Store};

use crate::cloud::CloudStore;
use crate::copy::copy_file;
use crate::diskcheck::{DiskCheck, PlacementTarget, join};

pub struct Placed {
    pub entry: FileEntry,
    pub copy_failed: bool,
    pub copied: bool,
    pub copy_elapsed: Duration,
    pub info: String,
}

#[allow(clippy::too_many_arguments)]
pub async fn place(
    channel: &CommandChannel,
    store: &Store,
    events: &EventBus,
    cloud: Option<&Arc<dyn CloudStore>>,
    primary: &Arc<AgentConnection>,
    dcheck: &DiskCheck,
    full_path: &str,
    kind: &str,
    auto: bool,
    copy_timeout: Duration,
) -> Result<Placed, OpError> {
    let name = basename(full_path);
    let primary_entry = |info: String, copy_failed: bool| Placed {
        entry: FileEntry {
            fileid: 0,
            name: full_path.to_string(),
            kind: kind.to_string(),
            storage_type: STORAGE_TYPE_VOLUME.to_string(),
            storage_name: primary.uuid.to_string(),
            storage_location: dirname(full_path),
            auto,
            created_at: Utc::now(),
        },
        copy_failed,
        copied: false,
        copy_elapsed: Duration::ZERO,
        info,
    };

    let mut placed = match &dcheck.target {
        PlacementTarget::Primary => primary_entry(String::new(), false),

        PlacementTarget::Volume { agent, dir } => {
            let started = Instant::now();
            match copy_file(channel, events, primary, full_path, agent, dir, copy_timeout).await {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    // The primary's copy is now redundant.
                    if let Err(e) = channel.file_delete(primary, full_path).await {
                        warn!(path = full_path, error = %e, "Failed to delete primary copy");
                    }
                    Placed {
                        entry: FileEntry {
                            fileid: 0,
                            name: join(dir, &name),
                            kind: kind.to_string(),
                            storage_type: STORAGE_TYPE_VOLUME.to_string(),
                            storage_name: agent.uuid.to_string(),
                            storage_location: dir.clone(),
                            auto,
                            created_at: Utc::now(),
                        },
                        copy_failed: false,
                        copied: true,
                        copy_elapsed: elapsed,
                        info: format!(
                            "Copied to {} in {}.",
                            agent.displayname,
                            seconds_str(elapsed.as_secs())
                        ),
                    }
                }
                Err(e) => primary_entry(
                    format!(
                        "Copy to {} failed: {e}. File remains on the primary.",
                        agent.displayname
                    ),
                    true,
                ),
            }
        }

        PlacementTarget::Cloud => {
            let Some(cloud) = cloud else {
                return Err(OpError::StorageError(
                    "cloud placement selected without cloud storage".to_string(),
                ));
            };
            let key = format!("{kind}/{name}");
            let started = Instant::now();
            match cloud.put(primary, full_path, &key).await {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    if let Err(e) = channel.file_delete(primary, full_path).await {
                        warn!(path = full_path, error = %e, "Failed to delete primary copy");
                    }
                    Placed {
                        entry: FileEntry {
                            fileid: 0,
                            name: key,
                            kind: kind.to_string(),
                            storage_type: STORAGE_TYPE_CLOUD.to_string(),
                            storage_name: cloud.kind().to_string(),
                            storage_location: cloud.bucket().to_string(),
                            auto,
                            created_at: Utc::now(),
                        },
                        copy_failed: false,
                        copied: true,
                        copy_elapsed: elapsed,
                        info: format!(
                            "Uploaded to {} bucket {} in {}.",
                            cloud.kind(),
                            cloud.bucket(),
                            seconds_str(elapsed.as_secs())
                        ),
                    }
                }
                Err(e) => primary_entry(
                    format!("Cloud upload failed: {e}. File remains on the primary."),
                    true,
                ),
            }
        }
    };

    let fileid = store
        .add_file(&placed.entry)
        .map_err(|e| OpError::StorageError(e.to_string()))?;
    placed.entry.fileid = fileid;
    Ok(placed)
}

pub struct Fetched {
    /// Path on the primary the consumer should use.
    pub primary_full_path: String,
    /// True when a temporary staging copy was made that the caller must
    /// delete afterwards.
    pub copied: bool,
}

pub async fn fetch_to_primary(
    channel: &CommandChannel,
    registry: &AgentRegistry,
    events: &EventBus,
    cloud: Option<&Arc<dyn CloudStore>>,
    primary: &Arc<AgentConnection>,
    entry: &FileEntry,
    staging_subdir: &str,
    copy_timeout: Duration,
) -> Result<Fetched, OpError> {
    if entry.storage_type == STORAGE_TYPE_VOLUME {
        if entry.storage_name == primary.uuid.to_string() {
            return Ok(Fetched {
                primary_full_path: entry.name.clone(),
                copied: false,
            });
        }

        let source = entry
            .storage_name
            .parse()
            .ok()
            .and_then(|uuid| registry.agent(uuid))
            .ok_or_else(|| {
                OpError::AgentDisconnected(format!(
                    "agent holding {} is not connected",
                    entry.name
                ))
            })?;

        let staging_dir = join(&primary.data_dir, staging_subdir);
        copy_file(
            channel,
            events,
            &source,
            &entry.name,
            primary,
            &staging_dir,
            copy_timeout,
        )
        .await?;
        return Ok(Fetched {
            primary_full_path: join(&staging_dir, &basename(&entry.name)),
            copied: true,
        });
    }

    // Cloud entry.
    let Some(cloud) = cloud else {
        return Err(OpError::StorageError(format!(
            "{} lives in cloud storage but no cloud storage is configured",
            entry.name
        )));
    };
    let staging_dir = join(&primary.data_dir, staging_subdir);
    channel.mkdirs(primary, &staging_dir).await?;
    let dest = join(&staging_dir, &basename(&entry.name));
    cloud.fetch(primary, &entry.name, &dest).await?;
    Ok(Fetched {
        primary_full_path: dest,
        copied: true,
    })
}

pub fn basename(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

pub fn dirname(path: &str) -> String {
    match path.rfind(['/', '\\']) {
        Some(idx) if idx > 0 => path[..idx].to_string(),
        _ => "/".to_string(),
    }
}
