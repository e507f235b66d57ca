//! One connected agent: identity, role, locks, and the HTTP client used to
//! reach its control interface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use shep_common::error::OpError;
use shep_proto::{AgentHello, VolumeInfo};

/// Per-request timeout for control calls. Long commands run behind the
/// start/poll/cleanup protocol, so no single request should take this long.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// Runs the managed application (has an install dir).
    Primary,
    /// Cluster worker node of the managed application.
    Worker,
    /// Storage-only agent, holds backups but no application.
    Archive,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Worker => "worker",
            Self::Archive => "archive",
        }
    }
}

pub struct AgentConnection {
    pub uuid: Uuid,
    pub displayname: String,
    pub host: String,
    pub listen_port: u16,
    pub role: AgentRole,
    pub data_dir: String,
    pub install_dir: Option<String>,
    pub data_size_bytes: u64,
    pub volumes: Vec<VolumeInfo>,
    pub transfer_user: Option<String>,
    pub transfer_password: Option<String>,
    /// Monotonic id distinguishing this connection from a reconnect of the
    /// same agent uuid.
    pub conn_id: u64,
    pub connected_at: DateTime<Utc>,

    client: reqwest::Client,
    /// Serializes wire commands to this agent.
    command_lock: Mutex<()>,
    /// Serializes user-level operations (backup, restore, start, stop).
    user_action_lock: Mutex<()>,
    /// Set while a reconnecting agent is re-handshaking; pollers back off.
    initializing: AtomicBool,
}

impl AgentConnection {
    pub fn from_hello(hello: AgentHello, conn_id: u64) -> Result<Self, OpError> {
        let role = if hello.install_dir.is_some() {
            AgentRole::Primary
        } else if hello.worker {
            AgentRole::Worker
        } else {
            AgentRole::Archive
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OpError::AgentTransportError(e.to_string()))?;
        Ok(Self {
            uuid: hello.uuid,
            displayname: hello.hostname.clone(),
            host: hello.hostname,
            listen_port: hello.listen_port,
            role,
            data_dir: hello.data_dir,
            install_dir: hello.install_dir,
            data_size_bytes: hello.data_size_bytes,
            volumes: hello.volumes,
            transfer_user: hello.transfer_user,
            transfer_password: hello.transfer_password,
            conn_id,
            connected_at: Utc::now(),
            client,
            command_lock: Mutex::new(()),
            user_action_lock: Mutex::new(()),
            initializing: AtomicBool::new(false),
        })
    }

    pub fn is_primary(&self) -> bool {
        self.role == AgentRole::Primary
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.listen_port)
    }

    pub async fn lock_command(&self) -> MutexGuard<'_, ()> {
        self.command_lock.lock().await
    }

    /// Blocking acquire of the user-action lock.
    pub async fn user_action(&self) -> MutexGuard<'_, ()> {
        self.user_action_lock.lock().await
    }

    /// Non-blocking acquire; `Busy` when another user action is in flight.
    pub fn try_user_action(&self) -> Result<MutexGuard<'_, ()>, OpError> {
        self.user_action_lock
            .try_lock()
            .map_err(|_| OpError::Busy(self.displayname.clone()))
    }

    pub fn set_initializing(&self, on: bool) {
        self.initializing.store(on, Ordering::SeqCst);
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::SeqCst)
    }

    // ── Raw HTTP to the agent's control interface ───────────────

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, OpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url(), path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_err(path, e))?;
        let resp = resp
            .error_for_status()
            .map_err(|e| self.transport_err(path, e))?;
        resp.json::<T>()
            .await
            .map_err(|e| OpError::AgentProtocolError(format!("{}: {path}: {e}", self.displayname)))
    }

    pub async fn get<T>(&self, path_and_query: &str) -> Result<T, OpError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url(), path_and_query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_err(path_and_query, e))?;
        let resp = resp
            .error_for_status()
            .map_err(|e| self.transport_err(path_and_query, e))?;
        resp.json::<T>().await.map_err(|e| {
            OpError::AgentProtocolError(format!("{}: {path_and_query}: {e}", self.displayname))
        })
    }

    pub async fn delete(&self, path_and_query: &str) -> Result<(), OpError> {
        let url = format!("{}{}", self.base_url(), path_and_query);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| self.transport_err(path_and_query, e))?;
        resp.error_for_status()
            .map_err(|e| self.transport_err(path_and_query, e))?;
        Ok(())
    }

    fn transport_err(&self, path: &str, e: reqwest::Error) -> OpError {
        OpError::AgentTransportError(format!("{}: {path}: {e}", self.displayname))
    }

    /// Max free bytes across the agent's volumes, with the volume path.
    pub fn max_free_volume(&self) -> Option<(&str, u64)> {
        self.volumes
            .iter()
            .max_by_key(|v| v.available_bytes)
            .map(|v| (v.path.as_str(), v.available_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(install_dir: Option<&str>, worker: bool) -> AgentHello {
        AgentHello {
            uuid: Uuid::new_v4(),
            hostname: "host-1".into(),
            listen_port: 8443,
            install_dir: install_dir.map(str::to_string),
            worker,
            data_dir: "/data".into(),
            data_size_bytes: 0,
            volumes: vec![],
            transfer_user: None,
            transfer_password: None,
        }
    }

    #[test]
    fn test_role_classification() {
        let primary = AgentConnection::from_hello(hello(Some("/opt/srv"), false), 1).unwrap();
        assert_eq!(primary.role, AgentRole::Primary);

        let worker = AgentConnection::from_hello(hello(None, true), 2).unwrap();
        assert_eq!(worker.role, AgentRole::Worker);

        let archive = AgentConnection::from_hello(hello(None, false), 3).unwrap();
        assert_eq!(archive.role, AgentRole::Archive);
    }

    #[tokio::test]
    async fn test_user_action_lock_is_exclusive() {
        let agent = AgentConnection::from_hello(hello(Some("/opt/srv"), false), 1).unwrap();
        let guard = agent.try_user_action().unwrap();
        match agent.try_user_action() {
            Err(OpError::Busy(name)) => assert_eq!(name, "host-1"),
            other => panic!("expected Busy, got {other:?}"),
        }
        drop(guard);
        assert!(agent.try_user_action().is_ok());
    }

    #[test]
    fn test_max_free_volume() {
        let mut h = hello(Some("/opt/srv"), false);
        h.volumes = vec![
            VolumeInfo {
                path: "/small".into(),
                available_bytes: 10,
                total_bytes: 100,
            },
            VolumeInfo {
                path: "/big".into(),
                available_bytes: 90,
                total_bytes: 100,
            },
        ];
        let agent = AgentConnection::from_hello(h, 1).unwrap();
        assert_eq!(agent.max_free_volume(), Some(("/big", 90)));
    }
}
