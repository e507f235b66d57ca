//! Wire protocol between the controller and its agents.
//!
//! Agents expose a small HTTP interface: `POST /cli` and `GET /cli?xid=N`
//! for the three-phase command protocol, `POST /maint` / `POST /archive` /
//! `POST /ping` / `POST /firewall` for immediate control, and
//! `GET|PUT|DELETE /file?path=...` for remote file access. All bodies are
//! JSON; key names on the wire are fixed (`run-status`, `exit-status`, ...).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Command protocol (/cli) ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliAction {
    Start,
    Cleanup,
    Kill,
}

/// Body of `POST /cli`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliRequest {
    pub action: CliAction,
    pub xid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub immediate: Option<bool>,
}

impl CliRequest {
    pub fn start(xid: u64, cli: impl Into<String>) -> Self {
        Self {
            action: CliAction::Start,
            xid,
            cli: Some(cli.into()),
            env: None,
            immediate: None,
        }
    }

    pub fn cleanup(xid: u64) -> Self {
        Self {
            action: CliAction::Cleanup,
            xid,
            cli: None,
            env: None,
            immediate: None,
        }
    }

    pub fn kill(xid: u64) -> Self {
        Self {
            action: CliAction::Kill,
            xid,
            cli: None,
            env: None,
            immediate: None,
        }
    }
}

/// Body of both the `POST /cli` response and the `GET /cli?xid=N` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliResponse {
    pub xid: Option<u64>,
    #[serde(rename = "run-status")]
    pub run_status: String,
    #[serde(rename = "exit-status")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Classified `run-status` value. Anything but `running`/`finished` is a
/// protocol failure for the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Finished,
    Unexpected(String),
}

impl RunStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "finished" => Self::Finished,
            other => Self::Unexpected(other.to_string()),
        }
    }
}

// ── Immediate control endpoints ─────────────────────────────────

/// Body of `POST /maint`: start/stop the maintenance page web server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintRequest {
    pub action: String,
    #[serde(rename = "listen-port")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    #[serde(rename = "ssl-listen-port")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_listen_port: Option<u16>,
    #[serde(rename = "ssl-cert-file")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert_file: Option<String>,
    #[serde(rename = "ssl-cert-key-file")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert_key_file: Option<String>,
    #[serde(rename = "ssl-cert-chain-file")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert_chain_file: Option<String>,
}

/// Body of `POST /archive`: start/stop the archive file server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Body of `POST /firewall`: open listen ports on the agent host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRequest {
    pub action: String,
    pub ports: Vec<u16>,
}

/// Generic response from the immediate control endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of `GET /file?path=...&stat=1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
}

// ── Handshake ───────────────────────────────────────────────────

/// First message an agent sends on its inbound controller connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHello {
    pub uuid: Uuid,
    pub hostname: String,
    /// Port the agent's own HTTP interface listens on.
    pub listen_port: u16,
    /// Install directory of the managed server, if this host runs it.
    /// Its presence marks the primary.
    #[serde(default)]
    pub install_dir: Option<String>,
    /// True when this host is a worker node of the managed server cluster.
    #[serde(default)]
    pub worker: bool,
    /// Agent data directory (backups, staging land under it).
    pub data_dir: String,
    /// Size of the managed server's data, used for disk prechecks.
    #[serde(default)]
    pub data_size_bytes: u64,
    /// Mounted volumes with free-space figures.
    #[serde(default)]
    pub volumes: Vec<VolumeInfo>,
    /// Shared secret for the pull-style file transfer endpoints.
    #[serde(default)]
    pub transfer_user: Option<String>,
    #[serde(default)]
    pub transfer_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub path: String,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

/// Controller reply to a handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub controller_version: String,
}

impl HandshakeReply {
    pub fn ok() -> Self {
        Self {
            status: "OK".to_string(),
            error: None,
            controller_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            status: "FAILED".to_string(),
            error: Some(error.into()),
            controller_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_request_wire_keys() {
        let req = CliRequest::start(42, "srvadmin backup \"/data/bak\"");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "start");
        assert_eq!(json["xid"], 42);
        assert!(json.get("env").is_none());
        assert!(json.get("immediate").is_none());
    }

    #[test]
    fn test_cli_response_renamed_keys() {
        let raw = r#"{"xid": 7, "run-status": "finished", "exit-status": 0, "stdout": "done"}"#;
        let resp: CliResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.xid, Some(7));
        assert_eq!(RunStatus::parse(&resp.run_status), RunStatus::Finished);
        assert_eq!(resp.exit_status, Some(0));
    }

    #[test]
    fn test_run_status_unexpected() {
        match RunStatus::parse("exploded") {
            RunStatus::Unexpected(s) => assert_eq!(s, "exploded"),
            other => panic!("expected Unexpected, got {other:?}"),
        }
    }

    #[test]
    fn test_maint_request_keys() {
        let req = MaintRequest {
            action: "start".into(),
            listen_port: Some(80),
            ssl_listen_port: None,
            ssl_cert_file: None,
            ssl_cert_key_file: None,
            ssl_cert_chain_file: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["listen-port"], 80);
        assert!(json.get("ssl-listen-port").is_none());
    }

    #[test]
    fn test_hello_defaults() {
        let raw = r#"{"uuid": "6dd95014-b7c9-4fd9-b891-7ae25dbf3c49",
                      "hostname": "primary-1", "listen_port": 8443,
                      "data_dir": "/data"}"#;
        let hello: AgentHello = serde_json::from_str(raw).unwrap();
        assert!(hello.install_dir.is_none());
        assert!(!hello.worker);
        assert!(hello.volumes.is_empty());
    }
}
