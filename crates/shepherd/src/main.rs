mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use shep_common::config::ControllerConfig;
use shep_common::events::{EventBus, EventKey};
use shep_monitor::StatusMonitor;
use shep_ops::{MaintControl, Orchestrator};
use shep_registry::{AgentRegistry, CommandChannel, Listener};
use shep_sched::Scheduler;
use shep_state::{StateMachine, TransitionTable};
use shep_store::Store;
use supervisor::{ServicePriority, spawn_supervised};

const VERSION_KEY: &str = "controller-version";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shepherd=debug".parse().unwrap()),
        )
        .init();

    info!("Shepherd starting...");

    let cfg = ControllerConfig::load(None);
    info!(domain = %cfg.domain, listen = %cfg.listen_addr, "Config loaded");

    std::fs::create_dir_all(&cfg.data_dir)?;
    let store = Arc::new(Store::open(&cfg.db_path)?);
    info!(db = %cfg.db_path.display(), "Store opened");

    // Commands left open by a previous run can never be resumed; mark them
    // finished so the xid table does not grow stale entries.
    let orphans = store.open_xids()?;
    for xid in &orphans {
        store.xid_set_state(*xid, shep_registry::XID_FINISHED)?;
    }
    if !orphans.is_empty() {
        warn!(count = orphans.len(), "Closed orphaned command records");
    }

    let events = Arc::new(EventBus::new());
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&store), Arc::clone(&events)));
    let channel = Arc::new(CommandChannel::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        Duration::from_secs(cfg.poll_interval_secs),
        Duration::from_secs(cfg.command_timeout_secs),
    ));
    let state = Arc::new(StateMachine::new(Arc::clone(&store), &cfg.domain)?);

    // Completeness check runs before anything network-facing starts.
    TransitionTable::new()?;

    let upgrade_lock = Arc::new(RwLock::new(()));
    let maint = Arc::new(MaintControl::new(
        Arc::clone(&channel),
        Arc::clone(&events),
        cfg.maint_listen_port,
    ));
    let orch = Arc::new(Orchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&channel),
        Arc::clone(&store),
        Arc::clone(&state),
        Arc::clone(&events),
        Arc::clone(&maint),
        None,
        Arc::clone(&upgrade_lock),
        cfg.clone(),
    ));

    announce_startup(&store, &events)?;

    // Agent handshake listener (Critical)
    {
        let registry = Arc::clone(&registry);
        let listen_addr = cfg.listen_addr.clone();
        spawn_supervised("agent-listener", ServicePriority::Critical, move || {
            let listener = Listener::new(Arc::clone(&registry), &listen_addr);
            async move { listener.run().await }
        });
    }

    // Status monitor (Critical)
    {
        let registry = Arc::clone(&registry);
        let channel = Arc::clone(&channel);
        let store = Arc::clone(&store);
        let state = Arc::clone(&state);
        let events = Arc::clone(&events);
        let maint = Arc::clone(&maint);
        let upgrade_lock = Arc::clone(&upgrade_lock);
        let cfg_c = cfg.clone();
        spawn_supervised("status-monitor", ServicePriority::Critical, move || {
            let registry = Arc::clone(&registry);
            let channel = Arc::clone(&channel);
            let store = Arc::clone(&store);
            let state = Arc::clone(&state);
            let events = Arc::clone(&events);
            let maint = Arc::clone(&maint);
            let upgrade_lock = Arc::clone(&upgrade_lock);
            let cfg = cfg_c.clone();
            async move {
                let table = TransitionTable::new()?;
                let monitor = StatusMonitor::new(
                    registry,
                    channel,
                    store,
                    state,
                    table,
                    events,
                    maint,
                    upgrade_lock,
                    Duration::from_secs(cfg.status_interval_secs),
                    Duration::from_secs(cfg.status_timeout_secs),
                    Duration::from_secs(cfg.degraded_dwell_secs),
                );
                monitor.run().await;
                Ok(())
            }
        });
    }

    // Cron scheduler (Background)
    {
        let orch = Arc::clone(&orch);
        spawn_supervised("scheduler", ServicePriority::Background, move || {
            let scheduler = Scheduler::new(Arc::clone(&orch));
            async move {
                scheduler.run().await;
                Ok(())
            }
        });
    }

    info!("Shepherd started");
    info!("  Agent listener: {}", cfg.listen_addr);
    info!("  Status interval: {}s", cfg.status_interval_secs);
    info!(
        "  Scheduled backup: {}",
        if cfg.backup_cron.is_empty() {
            "disabled"
        } else {
            &cfg.backup_cron
        }
    );

    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    if let Some(signal) = signals.next().await {
        info!(signal, "Shutting down...");
    }
    Ok(())
}

/// Emit the startup event, distinguishing a first start from a restart and
/// noting a version change.
fn announce_startup(store: &Store, events: &EventBus) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    match store.sys_get(VERSION_KEY)? {
        None => {
            events.publish(EventKey::ControllerStarted, json!({ "version": version }));
        }
        Some(prev) if prev != version => {
            events.publish(
                EventKey::ControllerRestarted,
                json!({ "version": version, "previous_version": prev }),
            );
        }
        Some(_) => {
            events.publish(EventKey::ControllerRestarted, json!({ "version": version }));
        }
    }
    store.sys_set(VERSION_KEY, version)?;
    Ok(())
}
