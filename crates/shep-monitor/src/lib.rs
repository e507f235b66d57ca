//! Status monitor: polls the primary agent for application status, commits
//! the parsed rows, and advances the lifecycle state machine.

pub mod degraded;
pub mod parser;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use shep_common::events::EventBus;
use shep_ops::maint::MaintControl;
use shep_registry::{AgentRegistry, CommandChannel, RunOpts};
use shep_state::{LifecycleState, ReportedStatus, StateMachine, TransitionTable};
use shep_store::Store;

use crate::degraded::DegradedGate;

/// The status command, run with verbose per-process output.
pub const STATUS_CLI: &str = "srvadmin status -v";

pub struct StatusMonitor {
    registry: Arc<AgentRegistry>,
    channel: Arc<CommandChannel>,
    store: Arc<Store>,
    state: Arc<StateMachine>,
    table: TransitionTable,
    events: Arc<EventBus>,
    maint: Arc<MaintControl>,
    /// Write side is held by upgrade windows; polling skips while it is.
    upgrade_lock: Arc<RwLock<()>>,
    interval: Duration,
    status_timeout: Duration,
    gate: DegradedGate,
}

impl StatusMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        channel: Arc<CommandChannel>,
        store: Arc<Store>,
        state: Arc<StateMachine>,
        table: TransitionTable,
        events: Arc<EventBus>,
        maint: Arc<MaintControl>,
        upgrade_lock: Arc<RwLock<()>>,
        interval: Duration,
        status_timeout: Duration,
        degraded_dwell: Duration,
    ) -> Self {
        Self {
            registry,
            channel,
            store,
            state,
            table,
            events,
            maint,
            upgrade_lock,
            interval,
            status_timeout,
            gate: DegradedGate::new(degraded_dwell),
        }
    }

    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Status monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                // A primary handshake triggers an immediate poll.
                _ = self.registry.primary_connected.notified() => {}
            }
            if let Err(e) = self.cycle().await {
                warn!(error = %e, "Status cycle failed");
            }
        }
    }

    /// One poll cycle. Skipping is the normal answer to contention: an
    /// upgrade window or a user action in flight owns the state until done.
    pub async fn cycle(&mut self) -> Result<()> {
        let Ok(_upgrade) = self.upgrade_lock.try_read() else {
            debug!("Upgrade in progress, skipping status cycle");
            return Ok(());
        };

        let Some(primary) = self.registry.primary() else {
            self.store.clear_status()?;
            self.gate.filter(&[], false, Instant::now());
            if self.state.get_state().await != LifecycleState::Disconnected {
                self.state.update(LifecycleState::Disconnected).await?;
            }
            return Ok(());
        };

        // Probe the user-action lock before spending a status command.
        match primary.try_user_action() {
            Ok(guard) => drop(guard),
            Err(_) => {
                debug!("User action in flight, skipping status cycle");
                return Ok(());
            }
        }

        let result = match self
            .channel
            .run(&primary, STATUS_CLI, RunOpts::with_timeout(self.status_timeout))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Status command failed");
                return Ok(());
            }
        };
        if !result.is_ok() {
            warn!(
                exit_status = result.exit_status,
                error = result.error.as_deref().unwrap_or(""),
                "Status command reported failure"
            );
            return Ok(());
        }

        let parsed = parser::parse_status_output(&result.stdout, &primary.displayname, |host| {
            self.registry.by_host(host).map(|a| a.displayname.clone())
        });
        let Some(aggregate) = parsed.aggregate else {
            warn!("Status output carried no aggregate status line");
            return Ok(());
        };
        let status = ReportedStatus::parse(&aggregate);
        if status == ReportedStatus::Unknown {
            warn!(aggregate, "Unrecognized aggregate status, abandoning cycle");
            return Ok(());
        }

        // Re-check after the command: a user action that started while the
        // status command ran owns the state now, and this cycle's reading
        // may predate whatever it did.
        let _guard = match primary.try_user_action() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("User action started during status command, discarding cycle");
                return Ok(());
            }
        };

        self.store.replace_status(&parsed.rows)?;

        let prior = self.state.get_state().await;
        let Some(transition) = self.table.lookup(prior, status) else {
            error!(state = %prior, status = %status, "No transition entry, abandoning cycle");
            return Ok(());
        };

        let events = self.gate.filter(
            &transition.events,
            status == ReportedStatus::Degraded,
            Instant::now(),
        );
        self.state.update(transition.next).await?;
        for key in events {
            self.events.publish(
                key,
                json!({ "state": transition.next.as_str(), "status": aggregate }),
            );
        }

        if transition.maint_stop {
            if let Err(e) = self.maint.ensure_stopped().await {
                warn!(error = %e, "Failed to take maintenance page down");
            }
        } else if transition.maint_start {
            if let Err(e) = self.maint.ensure_started().await {
                warn!(error = %e, "Failed to put maintenance page up");
            }
        }

        Ok(())
    }
}
