//! Immediate control calls to an agent's HTTP interface.
//!
//! These skip the three-phase protocol: the agent answers inline. They still
//! take the command lock so they serialize with starts and cleanups, and a
//! transport failure removes the agent just like a failed command would.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use shep_common::error::OpError;
use shep_proto::{ArchiveRequest, ControlResponse, FileStat, FirewallRequest, MaintRequest};

use crate::command::CommandChannel;
use crate::connection::AgentConnection;

/// An error field in a control response is an operation failure, not a
/// connection failure; the agent stays registered.
fn check_control(agent: &AgentConnection, what: &str, resp: ControlResponse) -> Result<(), OpError> {
    if let Some(error) = resp.error {
        return Err(OpError::Other(anyhow::anyhow!(
            "{}: {what}: {error}",
            agent.displayname
        )));
    }
    Ok(())
}

impl CommandChannel {
    async fn immediate<B: serde::Serialize + ?Sized>(
        &self,
        agent: &Arc<AgentConnection>,
        path: &str,
        body: &B,
    ) -> Result<ControlResponse, OpError> {
        let _guard = agent.lock_command().await;
        match agent.post::<_, ControlResponse>(path, body).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                if e.removed_agent() {
                    self.registry().remove_failed(agent.uuid, &e.to_string());
                }
                Err(e)
            }
        }
    }

    pub async fn ping(&self, agent: &Arc<AgentConnection>) -> Result<(), OpError> {
        let resp = self.immediate(agent, "/ping", &json!({})).await?;
        check_control(agent, "ping", resp)
    }

    /// Start or stop the maintenance page web server on an agent.
    pub async fn maint(
        &self,
        agent: &Arc<AgentConnection>,
        request: &MaintRequest,
    ) -> Result<(), OpError> {
        debug!(agent = %agent.displayname, action = %request.action, "Maint request");
        let resp = self.immediate(agent, "/maint", request).await?;
        check_control(agent, "maint", resp)
    }

    /// Start or stop the archive file server on an agent.
    pub async fn archive(
        &self,
        agent: &Arc<AgentConnection>,
        request: &ArchiveRequest,
    ) -> Result<(), OpError> {
        let resp = self.immediate(agent, "/archive", request).await?;
        check_control(agent, "archive", resp)
    }

    /// Open listen ports on the agent host's firewall.
    pub async fn firewall_enable(
        &self,
        agent: &Arc<AgentConnection>,
        ports: &[u16],
    ) -> Result<(), OpError> {
        let request = FirewallRequest {
            action: "enable".to_string(),
            ports: ports.to_vec(),
        };
        let resp = self.immediate(agent, "/firewall", &request).await?;
        check_control(agent, "firewall", resp)
    }

    /// Stat a file on the agent without transferring it.
    pub async fn file_size(
        &self,
        agent: &Arc<AgentConnection>,
        path: &str,
    ) -> Result<u64, OpError> {
        let _guard = agent.lock_command().await;
        let stat: FileStat = agent
            .get(&format!("/file?path={}&stat=1", urlencode(path)))
            .await
            .map_err(|e| {
                if e.removed_agent() {
                    self.registry().remove_failed(agent.uuid, &e.to_string());
                }
                e
            })?;
        Ok(stat.size)
    }

    pub async fn file_delete(
        &self,
        agent: &Arc<AgentConnection>,
        path: &str,
    ) -> Result<(), OpError> {
        let _guard = agent.lock_command().await;
        agent
            .delete(&format!("/file?path={}", urlencode(path)))
            .await
            .map_err(|e| {
                if e.removed_agent() {
                    self.registry().remove_failed(agent.uuid, &e.to_string());
                }
                e
            })
    }

    /// Create a directory chain on the agent.
    pub async fn mkdirs(&self, agent: &Arc<AgentConnection>, path: &str) -> Result<(), OpError> {
        let resp = self
            .immediate(agent, "/file/mkdirs", &json!({ "path": path }))
            .await?;
        check_control(agent, "mkdirs", resp)
    }
}

/// Percent-encode the characters that matter in a path query value.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentRegistry;
    use axum::Router;
    use axum::routing::post;
    use serde_json::Value;
    use shep_common::events::EventBus;
    use shep_proto::AgentHello;
    use shep_store::Store;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_urlencode_paths() {
        assert_eq!(urlencode("/data/backups/a.bak"), "/data/backups/a.bak");
        assert_eq!(urlencode("/data/my backup"), "/data/my%20backup");
    }

    async fn harness(app: Router) -> (CommandChannel, Arc<AgentConnection>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let store = Arc::new(Store::in_memory().unwrap());
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&store),
            Arc::new(EventBus::new()),
        ));
        let agent = Arc::new(
            AgentConnection::from_hello(
                AgentHello {
                    uuid: Uuid::new_v4(),
                    hostname: "127.0.0.1".into(),
                    listen_port: port,
                    install_dir: Some("/opt/srv".into()),
                    worker: false,
                    data_dir: "/data".into(),
                    data_size_bytes: 0,
                    volumes: vec![],
                    transfer_user: None,
                    transfer_password: None,
                },
                registry.alloc_conn_id(),
            )
            .unwrap(),
        );
        registry.add(Arc::clone(&agent)).unwrap();
        let channel = CommandChannel::new(
            registry,
            store,
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        (channel, agent)
    }

    #[tokio::test]
    async fn test_maint_reports_agent_error() {
        let app = Router::new().route(
            "/maint",
            post(|axum::Json(body): axum::Json<Value>| async move {
                assert_eq!(body["listen-port"], 80);
                axum::Json(json!({ "error": "port in use" }))
            }),
        );
        let (channel, agent) = harness(app).await;

        let request = MaintRequest {
            action: "start".into(),
            listen_port: Some(80),
            ssl_listen_port: None,
            ssl_cert_file: None,
            ssl_cert_key_file: None,
            ssl_cert_chain_file: None,
        };
        let err = channel.maint(&agent, &request).await.unwrap_err();
        assert!(err.to_string().contains("port in use"));
        // The agent stays registered: this was an operation failure, not a
        // connection failure.
        assert!(channel.registry().agent(agent.uuid).is_some());
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let app = Router::new().route(
            "/ping",
            post(|| async { axum::Json(json!({ "stdout": "pong" })) }),
        );
        let (channel, agent) = harness(app).await;
        channel.ping(&agent).await.unwrap();
    }

    #[tokio::test]
    async fn test_archive_start_request_shape() {
        let app = Router::new().route(
            "/archive",
            post(|axum::Json(body): axum::Json<Value>| async move {
                assert_eq!(body["action"], "start");
                assert_eq!(body["port"], 8081);
                axum::Json(json!({ "stdout": "ok" }))
            }),
        );
        let (channel, agent) = harness(app).await;
        let request = ArchiveRequest {
            action: "start".into(),
            port: Some(8081),
        };
        channel.archive(&agent, &request).await.unwrap();
    }

    #[tokio::test]
    async fn test_firewall_enable_ok() {
        let app = Router::new().route(
            "/firewall",
            post(|axum::Json(body): axum::Json<Value>| async move {
                assert_eq!(body["action"], "enable");
                assert_eq!(body["ports"][0], 8443);
                axum::Json(json!({ "stdout": "ok" }))
            }),
        );
        let (channel, agent) = harness(app).await;
        channel.firewall_enable(&agent, &[8443]).await.unwrap();
    }
}
