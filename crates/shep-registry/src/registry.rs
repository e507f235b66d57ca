//! In-memory map of connected agents, keyed by agent uuid.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::json;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use shep_common::error::OpError;
use shep_common::events::{EventBus, EventKey};
use shep_store::Store;

use crate::connection::{AgentConnection, AgentRole};

pub struct AgentRegistry {
    agents: RwLock<HashMap<Uuid, Arc<AgentConnection>>>,
    events: Arc<EventBus>,
    store: Arc<Store>,
    next_conn_id: AtomicU64,
    /// Signaled whenever a primary finishes its handshake, so the status
    /// monitor can poll immediately instead of waiting out its interval.
    pub primary_connected: Notify,
}

impl AgentRegistry {
    pub fn new(store: Arc<Store>, events: Arc<EventBus>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            events,
            store,
            next_conn_id: AtomicU64::new(1),
            primary_connected: Notify::new(),
        }
    }

    pub fn alloc_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a freshly handshaken agent. An agent uuid may be registered
    /// only once; a reconnect must remove the old record first.
    pub fn add(&self, agent: Arc<AgentConnection>) -> Result<(), OpError> {
        {
            let mut agents = self.agents.write().unwrap();
            if agents.contains_key(&agent.uuid) {
                return Err(OpError::DuplicateAgent(agent.displayname.clone()));
            }
            agents.insert(agent.uuid, Arc::clone(&agent));
        }
        info!(
            agent = %agent.displayname,
            role = agent.role.as_str(),
            conn_id = agent.conn_id,
            "Agent registered"
        );
        if agent.is_primary() {
            self.primary_connected.notify_waiters();
        }
        Ok(())
    }

    /// Remove an agent. Idempotent: a second remove for the same uuid is a
    /// no-op, so command failure paths and the socket EOF path can both call
    /// it without coordination.
    pub fn remove(&self, uuid: Uuid, reason: &str) {
        let removed = self.agents.write().unwrap().remove(&uuid);
        let Some(agent) = removed else {
            return;
        };
        warn!(agent = %agent.displayname, reason, "Agent removed");
        self.events.publish(
            EventKey::AgentDisconnect,
            json!({ "agent": agent.displayname, "reason": reason }),
        );
        // Without a primary there is nobody to report status; stale rows
        // must not outlive the connection that produced them.
        if agent.is_primary() && self.primary().is_none() {
            if let Err(e) = self.store.clear_status() {
                warn!(error = %e, "Failed to clear status rows");
            }
        }
    }

    /// Remove after a command transport or protocol failure. Same removal,
    /// with the comm-failure event emitted ahead of the disconnect event.
    pub fn remove_failed(&self, uuid: Uuid, reason: &str) {
        if let Some(agent) = self.agent(uuid) {
            self.events.publish(
                EventKey::AgentCommFailure,
                json!({ "agent": agent.displayname, "reason": reason }),
            );
        }
        self.remove(uuid, reason);
    }

    pub fn agent(&self, uuid: Uuid) -> Option<Arc<AgentConnection>> {
        self.agents.read().unwrap().get(&uuid).cloned()
    }

    /// True while this exact connection (uuid + conn_id) is registered.
    /// Distinguishes "still here" from "reconnected while we were polling".
    pub fn is_connected(&self, uuid: Uuid, conn_id: u64) -> bool {
        self.agents
            .read()
            .unwrap()
            .get(&uuid)
            .map(|a| a.conn_id == conn_id)
            .unwrap_or(false)
    }

    pub fn primary(&self) -> Option<Arc<AgentConnection>> {
        self.by_role(AgentRole::Primary).into_iter().next()
    }

    pub fn by_role(&self, role: AgentRole) -> Vec<Arc<AgentConnection>> {
        let mut agents: Vec<_> = self
            .agents
            .read()
            .unwrap()
            .values()
            .filter(|a| a.role == role)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.displayname.cmp(&b.displayname));
        agents
    }

    pub fn by_host(&self, host: &str) -> Option<Arc<AgentConnection>> {
        self.agents
            .read()
            .unwrap()
            .values()
            .find(|a| a.host.eq_ignore_ascii_case(host))
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<AgentConnection>> {
        let mut agents: Vec<_> = self.agents.read().unwrap().values().cloned().collect();
        agents.sort_by(|a, b| a.displayname.cmp(&b.displayname));
        agents
    }

    pub fn count(&self) -> usize {
        self.agents.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shep_proto::AgentHello;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(
            Arc::new(Store::in_memory().unwrap()),
            Arc::new(EventBus::new()),
        )
    }

    fn agent(reg: &AgentRegistry, name: &str, primary: bool) -> Arc<AgentConnection> {
        let hello = AgentHello {
            uuid: Uuid::new_v4(),
            hostname: name.to_string(),
            listen_port: 8443,
            install_dir: primary.then(|| "/opt/srv".to_string()),
            worker: false,
            data_dir: "/data".into(),
            data_size_bytes: 0,
            volumes: vec![],
            transfer_user: None,
            transfer_password: None,
        };
        Arc::new(AgentConnection::from_hello(hello, reg.alloc_conn_id()).unwrap())
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_uuid() {
        let reg = registry();
        let a = agent(&reg, "primary-1", true);
        reg.add(Arc::clone(&a)).unwrap();

        let dup = Arc::new(
            AgentConnection::from_hello(
                AgentHello {
                    uuid: a.uuid,
                    hostname: "primary-1".into(),
                    listen_port: 8443,
                    install_dir: Some("/opt/srv".into()),
                    worker: false,
                    data_dir: "/data".into(),
                    data_size_bytes: 0,
                    volumes: vec![],
                    transfer_user: None,
                    transfer_password: None,
                },
                reg.alloc_conn_id(),
            )
            .unwrap(),
        );
        assert!(matches!(reg.add(dup), Err(OpError::DuplicateAgent(_))));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_emits() {
        let reg = registry();
        let mut rx = reg.events.subscribe();
        let a = agent(&reg, "primary-1", true);
        reg.add(Arc::clone(&a)).unwrap();

        reg.remove(a.uuid, "socket closed");
        reg.remove(a.uuid, "socket closed");
        assert_eq!(reg.count(), 0);

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.key, EventKey::AgentDisconnect);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_failed_emits_comm_failure_then_disconnect() {
        let reg = registry();
        let mut rx = reg.events.subscribe();
        let a = agent(&reg, "primary-1", true);
        reg.add(Arc::clone(&a)).unwrap();

        reg.remove_failed(a.uuid, "connection reset");
        assert_eq!(rx.try_recv().unwrap().key, EventKey::AgentCommFailure);
        assert_eq!(rx.try_recv().unwrap().key, EventKey::AgentDisconnect);
        assert_eq!(reg.count(), 0);

        // Idempotent, and no events for an agent already gone.
        reg.remove_failed(a.uuid, "connection reset");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_conn_id_distinguishes_reconnect() {
        let reg = registry();
        let a = agent(&reg, "primary-1", true);
        reg.add(Arc::clone(&a)).unwrap();
        assert!(reg.is_connected(a.uuid, a.conn_id));

        reg.remove(a.uuid, "reconnect");
        let b = agent(&reg, "primary-1", true);
        assert!(!reg.is_connected(a.uuid, a.conn_id));
        reg.add(Arc::clone(&b)).unwrap();
        assert!(!reg.is_connected(a.uuid, a.conn_id));
        assert!(reg.is_connected(b.uuid, b.conn_id));
    }

    #[tokio::test]
    async fn test_role_lookup_sorted_by_name() {
        let reg = registry();
        for name in ["bravo", "alpha"] {
            reg.add(agent(&reg, name, false)).unwrap();
        }
        reg.add(agent(&reg, "primary-1", true)).unwrap();

        assert!(reg.primary().is_some());
        let archives = reg.by_role(AgentRole::Archive);
        assert_eq!(archives.len(), 2);
        assert_eq!(archives[0].displayname, "alpha");
        assert!(reg.by_host("ALPHA").is_some());
    }
}
