//! Operation orchestration: backup, restore, ziplogs, lifecycle control,
//! file retention, and the maintenance page.
//!
//! Every entry point follows the same discipline: take the primary's
//! user-action lock (non-blocking, `Busy` if contended), check the state
//! precondition, park the state machine in the operation's in-flight state,
//! run commands through the command channel, and put the state back before
//! releasing the lock so the next status cycle never races a half-done
//! operation.

pub mod backup;
pub mod cloud;
pub mod copy;
pub mod diskcheck;
pub mod lifecycle;
pub mod maint;
pub mod placefile;
pub mod restore;
pub mod retention;
pub mod ziplogs;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::info;

use shep_common::config::ControllerConfig;
use shep_common::error::OpError;
use shep_common::events::EventBus;
use shep_registry::{AgentConnection, AgentRegistry, CommandChannel};
use shep_state::{LifecycleState, StateMachine};
use shep_store::Store;

pub use backup::Initiator;
pub use cloud::CloudStore;
pub use diskcheck::PinnedTarget;
pub use maint::MaintControl;
pub use restore::RestoreOpts;

pub struct Orchestrator {
    pub registry: Arc<AgentRegistry>,
    pub channel: Arc<CommandChannel>,
    pub store: Arc<Store>,
    pub state: Arc<StateMachine>,
    pub events: Arc<EventBus>,
    pub maint: Arc<MaintControl>,
    pub cloud: Option<Arc<dyn CloudStore>>,
    /// Shared with the status monitor; write side suspends polling.
    pub upgrade_lock: Arc<RwLock<()>>,
    pub cfg: ControllerConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        channel: Arc<CommandChannel>,
        store: Arc<Store>,
        state: Arc<StateMachine>,
        events: Arc<EventBus>,
        maint: Arc<MaintControl>,
        cloud: Option<Arc<dyn CloudStore>>,
        upgrade_lock: Arc<RwLock<()>>,
        cfg: ControllerConfig,
    ) -> Self {
        Self {
            registry,
            channel,
            store,
            state,
            events,
            maint,
            cloud,
            upgrade_lock,
            cfg,
        }
    }

    pub(crate) fn primary(&self) -> Result<Arc<AgentConnection>, OpError> {
        self.registry
            .primary()
            .ok_or_else(|| OpError::AgentDisconnected("no primary agent connected".to_string()))
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.command_timeout_secs)
    }

    /// Open an upgrade window: status polling pauses until the guard drops
    /// and `end_upgrade` is called.
    pub async fn begin_upgrade(&self) -> Result<OwnedRwLockWriteGuard<()>> {
        let guard = Arc::clone(&self.upgrade_lock).write_owned().await;
        self.state.update(LifecycleState::Upgrading).await?;
        info!("Upgrade window opened");
        Ok(guard)
    }

    pub async fn end_upgrade(&self, guard: OwnedRwLockWriteGuard<()>) -> Result<()> {
        // Pending until the next status cycle reports the truth.
        self.state.update(LifecycleState::Pending).await?;
        drop(guard);
        info!("Upgrade window closed");
        Ok(())
    }
}
