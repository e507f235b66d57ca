//! Handshake listener for inbound agent connections.
//!
//! An agent connects over TCP, sends one JSON line (`AgentHello`), and keeps
//! the socket open as a liveness channel. The controller replies with a
//! JSON line and then just waits for EOF; commands travel over the agent's
//! own HTTP interface, not this socket.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use shep_proto::{AgentHello, HandshakeReply};

use crate::connection::AgentConnection;
use crate::registry::AgentRegistry;

/// Refuse hellos past this size.
const MAX_HELLO_BYTES: u64 = 64 * 1024;

pub struct Listener {
    registry: Arc<AgentRegistry>,
    listen_addr: String,
}

impl Listener {
    pub fn new(registry: Arc<AgentRegistry>, listen_addr: &str) -> Self {
        Self {
            registry,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .with_context(|| format!("Failed to bind agent listener on {}", self.listen_addr))?;
        info!(addr = %self.listen_addr, "Agent listener started");

        loop {
            let (socket, peer) = listener.accept().await?;
            debug!(%peer, "Inbound agent connection");
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                if let Err(e) = handle_agent(registry, socket).await {
                    warn!(%peer, error = %e, "Agent connection ended with error");
                }
            });
        }
    }
}

async fn handle_agent(registry: Arc<AgentRegistry>, socket: TcpStream) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_HELLO_BYTES);

    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        anyhow::bail!("Connection closed before handshake");
    }

    let hello: AgentHello = match serde_json::from_str(&line) {
        Ok(hello) => hello,
        Err(e) => {
            let reply = HandshakeReply::rejected(format!("Malformed hello: {e}"));
            send_reply(&mut write_half, &reply).await?;
            anyhow::bail!("Malformed hello: {e}");
        }
    };

    // A reconnecting agent supersedes its previous record; in-flight polls
    // against the old conn_id will see the agent as gone.
    if registry.agent(hello.uuid).is_some() {
        registry.remove(hello.uuid, "superseded by reconnect");
    }

    let agent = Arc::new(AgentConnection::from_hello(hello, registry.alloc_conn_id())?);
    agent.set_initializing(true);
    let uuid = agent.uuid;

    if let Err(e) = registry.add(Arc::clone(&agent)) {
        let reply = HandshakeReply::rejected(e.to_string());
        send_reply(&mut write_half, &reply).await?;
        anyhow::bail!("Handshake rejected: {e}");
    }

    let result = async {
        send_reply(&mut write_half, &HandshakeReply::ok()).await?;
        agent.set_initializing(false);
        if agent.is_primary() {
            registry.primary_connected.notify_waiters();
        }

        // Hold the socket open; EOF or error means the agent is gone.
        let mut discard = String::new();
        loop {
            discard.clear();
            reader.set_limit(MAX_HELLO_BYTES);
            if reader.read_line(&mut discard).await? == 0 {
                return Ok::<_, anyhow::Error>(());
            }
        }
    }
    .await;

    registry.remove(uuid, "socket closed");
    result
}

async fn send_reply(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    reply: &HandshakeReply,
) -> Result<()> {
    let mut payload = serde_json::to_vec(reply)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shep_common::events::EventBus;
    use shep_store::Store;
    use tokio::io::AsyncReadExt;
    use uuid::Uuid;

    fn hello_line(uuid: Uuid) -> Vec<u8> {
        let mut line = serde_json::to_vec(&serde_json::json!({
            "uuid": uuid,
            "hostname": "primary-1",
            "listen_port": 8443,
            "install_dir": "/opt/srv",
            "data_dir": "/data",
        }))
        .unwrap();
        line.push(b'\n');
        line
    }

    async fn start_listener() -> (Arc<AgentRegistry>, String) {
        let registry = Arc::new(AgentRegistry::new(
            Arc::new(Store::in_memory().unwrap()),
            Arc::new(EventBus::new()),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let reg = Arc::clone(&registry);
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let reg = Arc::clone(&reg);
                tokio::spawn(async move {
                    let _ = handle_agent(reg, socket).await;
                });
            }
        });
        (registry, addr)
    }

    #[tokio::test]
    async fn test_handshake_registers_and_eof_removes() {
        let (registry, addr) = start_listener().await;
        let uuid = Uuid::new_v4();

        let mut sock = TcpStream::connect(&addr).await.unwrap();
        sock.write_all(&hello_line(uuid)).await.unwrap();

        let mut reader = BufReader::new(&mut sock);
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        let reply: HandshakeReply = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply.status, "OK");
        assert!(registry.agent(uuid).is_some());
        assert!(!registry.agent(uuid).unwrap().is_initializing());

        drop(sock);
        for _ in 0..50 {
            if registry.agent(uuid).is_none() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("agent not removed after EOF");
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_previous_connection() {
        let (registry, addr) = start_listener().await;
        let uuid = Uuid::new_v4();

        let mut first = TcpStream::connect(&addr).await.unwrap();
        first.write_all(&hello_line(uuid)).await.unwrap();
        let mut buf = vec![0u8; 256];
        let _ = first.read(&mut buf).await.unwrap();
        let first_conn_id = registry.agent(uuid).unwrap().conn_id;

        let mut second = TcpStream::connect(&addr).await.unwrap();
        second.write_all(&hello_line(uuid)).await.unwrap();
        let _ = second.read(&mut buf).await.unwrap();

        let current = registry.agent(uuid).unwrap();
        assert_ne!(current.conn_id, first_conn_id);
        assert!(!registry.is_connected(uuid, first_conn_id));
    }

    #[tokio::test]
    async fn test_malformed_hello_is_rejected() {
        let (registry, addr) = start_listener().await;

        let mut sock = TcpStream::connect(&addr).await.unwrap();
        sock.write_all(b"not json\n").await.unwrap();

        let mut reader = BufReader::new(&mut sock);
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        let reply: HandshakeReply = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply.status, "FAILED");
        assert_eq!(registry.count(), 0);
    }
}
