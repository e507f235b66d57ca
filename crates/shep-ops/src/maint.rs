//! Maintenance page control.
//!
//! While the managed application is down, gateway agents serve a static
//! maintenance page on its port. Desired state is tracked in memory and the
//! operations are idempotent, so the status monitor can request the same
//! side effect every cycle without flooding the agents.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use tracing::{info, warn};

use shep_common::error::OpError;
use shep_common::events::{EventBus, EventKey};
use shep_proto::MaintRequest;
use shep_registry::{AgentRole, CommandChannel};

pub struct MaintControl {
    channel: Arc<CommandChannel>,
    events: Arc<EventBus>,
    listen_port: u16,
    started: AtomicBool,
}

impl MaintControl {
    pub fn new(channel: Arc<CommandChannel>, events: Arc<EventBus>, listen_port: u16) -> Self {
        Self {
            channel,
            events,
            listen_port,
            started: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub async fn ensure_started(&self) -> Result<(), OpError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.send_all("start").await {
            Ok(()) => {
                self.events.publish(EventKey::MaintOnline, json!({}));
                Ok(())
            }
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                self.events
                    .publish(EventKey::MaintStartFailed, json!({ "error": e.to_string() }));
                Err(e)
            }
        }
    }

    pub async fn ensure_stopped(&self) -> Result<(), OpError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match self.send_all("stop").await {
            Ok(()) => {
                self.events.publish(EventKey::MaintOffline, json!({}));
                Ok(())
            }
            Err(e) => {
                // Leave the flag up so the next cycle retries the stop.
                self.started.store(true, Ordering::SeqCst);
                self.events
                    .publish(EventKey::MaintStopFailed, json!({ "error": e.to_string() }));
                Err(e)
            }
        }
    }

    fn body(&self, action: &str) -> MaintRequest {
        MaintRequest {
            action: action.to_string(),
            listen_port: (action == "start").then_some(self.listen_port),
            ssl_listen_port: None,
            ssl_cert_file: None,
            ssl_cert_key_file: None,
            ssl_cert_chain_file: None,
        }
    }

    /// Send to every gateway agent (primary and workers). One failure fails
    /// the operation, but the rest are still attempted.
    async fn send_all(&self, action: &str) -> Result<(), OpError> {
        let registry = self.channel.registry();
        let mut gateways = registry.by_role(AgentRole::Primary);
        gateways.extend(registry.by_role(AgentRole::Worker));
        if gateways.is_empty() {
            return Err(OpError::AgentDisconnected("no gateway agents".to_string()));
        }

        let request = self.body(action);
        let mut first_error = None;
        for agent in &gateways {
            match self.channel.maint(agent, &request).await {
                Ok(()) => {
                    info!(agent = %agent.displayname, action, "Maintenance page");
                }
                Err(e) => {
                    warn!(agent = %agent.displayname, action, error = %e, "Maint request failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
