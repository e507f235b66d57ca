//! Pre-operation disk placement decision.
//!
//! Before a backup or ziplogs command runs, decide where the produced file
//! will live: the primary itself, another agent's volume, or cloud storage.
//! The primary must always have room to produce the file in the first
//! place; the question is only whether it can also afford to keep it.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use shep_common::error::OpError;
use shep_registry::{AgentConnection, AgentRegistry, AgentRole};

use crate::cloud::CloudStore;

#[derive(Clone)]
pub enum PlacementTarget {
    /// Keep the file where the command wrote it.
    Primary,
    /// Copy to another agent's volume and delete the primary copy.
    Volume {
        agent: Arc<AgentConnection>,
        dir: String,
    },
    /// Upload to cloud storage and delete the primary copy.
    Cloud,
}

impl fmt::Debug for PlacementTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("Primary"),
            Self::Volume { agent, dir } => f
                .debug_struct("Volume")
                .field("agent", &agent.displayname)
                .field("dir", dir)
                .finish(),
            Self::Cloud => f.write_str("Cloud"),
        }
    }
}

/// Caller-chosen destination that overrides the free-space policy. The
/// primary's own free-space refusal still applies.
#[derive(Debug, Clone)]
pub enum PinnedTarget {
    Primary,
    /// Another agent, resolved by host name.
    Agent(String),
    Cloud,
}

#[derive(Debug)]
pub struct DiskCheck {
    /// Directory on the primary the command writes into.
    pub primary_dir: String,
    pub target: PlacementTarget,
    pub min_needed: u64,
}

/// Placement policy:
/// - the primary's roomiest volume must hold `min_needed` free, or the
///   operation is refused outright;
/// - a pinned target wins over everything below, subject only to that
///   refusal and to the pinned destination having room itself;
/// - with twice `min_needed` free the file stays on the primary;
/// - otherwise prefer another agent with room, then cloud storage, and as a
///   last resort keep it on the primary anyway and say so.
pub fn check(
    registry: &AgentRegistry,
    cloud: Option<&Arc<dyn CloudStore>>,
    primary: &Arc<AgentConnection>,
    subdir: &str,
    min_needed: u64,
    pin: Option<&PinnedTarget>,
) -> Result<DiskCheck, OpError> {
    let (primary_dir, primary_free) = match primary.max_free_volume() {
        Some((path, free)) => {
            if free < min_needed {
                return Err(OpError::InsufficientDiskSpace(format!(
                    "{}: {free} bytes free on {path}, need {min_needed}",
                    primary.displayname
                )));
            }
            (join(path, subdir), Some(free))
        }
        None => {
            // No volume report; trust the data dir and skip the check.
            warn!(agent = %primary.displayname, "No volume report, skipping disk check");
            (join(&primary.data_dir, subdir), None)
        }
    };

    if let Some(pin) = pin {
        let target = pinned_target(registry, cloud, primary, subdir, min_needed, pin)?;
        debug!(?pin, "Placement pinned by caller");
        return Ok(DiskCheck {
            primary_dir,
            target,
            min_needed,
        });
    }

    let Some(primary_free) = primary_free else {
        return Ok(DiskCheck {
            primary_dir,
            target: PlacementTarget::Primary,
            min_needed,
        });
    };

    if primary_free >= min_needed * 2 {
        debug!(agent = %primary.displayname, "File will stay on the primary");
        return Ok(DiskCheck {
            primary_dir,
            target: PlacementTarget::Primary,
            min_needed,
        });
    }

    // Tight on the primary: find somewhere else to keep the file.
    let mut others = registry.by_role(AgentRole::Worker);
    others.extend(registry.by_role(AgentRole::Archive));
    for agent in others {
        if let Some((vol, free)) = agent.max_free_volume() {
            if free >= min_needed {
                let dir = join(vol, subdir);
                debug!(target = %agent.displayname, dir, "File will copy to another agent");
                return Ok(DiskCheck {
                    primary_dir,
                    target: PlacementTarget::Volume { agent, dir },
                    min_needed,
                });
            }
        }
    }

    if cloud.is_some() {
        debug!("File will copy to cloud storage");
        return Ok(DiskCheck {
            primary_dir,
            target: PlacementTarget::Cloud,
            min_needed,
        });
    }

    warn!(
        agent = %primary.displayname,
        free = primary_free,
        "Low disk space and nowhere to offload, keeping file on the primary"
    );
    Ok(DiskCheck {
        primary_dir,
        target: PlacementTarget::Primary,
        min_needed,
    })
}

fn pinned_target(
    registry: &AgentRegistry,
    cloud: Option<&Arc<dyn CloudStore>>,
    primary: &Arc<AgentConnection>,
    subdir: &str,
    min_needed: u64,
    pin: &PinnedTarget,
) -> Result<PlacementTarget, OpError> {
    match pin {
        PinnedTarget::Primary => Ok(PlacementTarget::Primary),
        PinnedTarget::Agent(name) => {
            let agent = registry.by_host(name).ok_or_else(|| {
                OpError::AgentDisconnected(format!("pinned agent {name} is not connected"))
            })?;
            if agent.uuid == primary.uuid {
                return Ok(PlacementTarget::Primary);
            }
            let dir = {
                let (vol, free) = agent.max_free_volume().ok_or_else(|| {
                    OpError::InsufficientDiskSpace(format!(
                        "{}: pinned target reports no volumes",
                        agent.displayname
                    ))
                })?;
                if free < min_needed {
                    return Err(OpError::InsufficientDiskSpace(format!(
                        "{}: {free} bytes free on pinned target, need {min_needed}",
                        agent.displayname
                    )));
                }
                join(vol, subdir)
            };
            Ok(PlacementTarget::Volume { agent, dir })
        }
        PinnedTarget::Cloud => {
            if cloud.is_none() {
                return Err(OpError::StorageError(
                    "cloud placement pinned without cloud storage".to_string(),
                ));
            }
            Ok(PlacementTarget::Cloud)
        }
    }
}

pub fn join(dir: &str, sub: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{sub}")
    } else {
        format!("{dir}/{sub}")
    }
}
