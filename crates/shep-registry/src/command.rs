//! Three-phase command protocol: start, poll, cleanup.
//!
//! Every command gets a durable xid before any network traffic, so a
//! controller restart can find commands it never finished. The agent's
//! command lock is held for the start and cleanup requests only; polling
//! runs unlocked so immediate commands can interleave with a long-running
//! backup on the same agent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use shep_common::error::OpError;
use shep_proto::{CliRequest, CliResponse, RunStatus};
use shep_store::Store;

use crate::connection::AgentConnection;
use crate::registry::AgentRegistry;

pub const XID_STARTED: &str = "started";
pub const XID_RUNNING: &str = "running";
pub const XID_FINISHED: &str = "finished";

/// Outcome of a completed command. A nonzero exit is a command failure but
/// not a channel failure; callers inspect `error`.
#[derive(Debug, Clone)]
pub struct CliResult {
    pub xid: u64,
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    /// Failure summary: agent-reported error, or stderr on nonzero exit.
    pub error: Option<String>,
    /// Cleanup-phase failure. Never overwrites the command outcome.
    pub cleanup_error: Option<String>,
}

impl CliResult {
    pub fn is_ok(&self) -> bool {
        self.exit_status == 0 && self.error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    pub env: Option<HashMap<String, String>>,
    /// Agent runs the command inline and answers `finished` on the start
    /// request itself.
    pub immediate: bool,
    /// Overall deadline from start to final poll.
    pub timeout: Option<Duration>,
}

impl RunOpts {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

pub struct CommandChannel {
    registry: Arc<AgentRegistry>,
    store: Arc<Store>,
    poll_interval: Duration,
    default_timeout: Duration,
}

impl CommandChannel {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<Store>,
        poll_interval: Duration,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            poll_interval,
            default_timeout,
        }
    }

    /// Run one command on one agent through the full protocol.
    pub async fn run(
        &self,
        agent: &Arc<AgentConnection>,
        cli: &str,
        opts: RunOpts,
    ) -> Result<CliResult, OpError> {
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        let xid = self
            .store
            .alloc_xid(cli)
            .map_err(|e| OpError::StorageError(e.to_string()))?;
        debug!(agent = %agent.displayname, xid, cli, "Command start");

        let mut request = CliRequest::start(xid, cli);
        request.env = opts.env;
        request.immediate = opts.immediate.then_some(true);

        let response = {
            let _guard = agent.lock_command().await;
            match agent.post::<_, CliResponse>("/cli", &request).await {
                Ok(response) => response,
                Err(e) => return Err(self.fail_agent(agent, e)),
            }
        };
        self.check_xid(agent, xid, &response)?;

        let response = match RunStatus::parse(&response.run_status) {
            // Done already: the start response carries the result and no
            // poll is ever issued.
            RunStatus::Finished => response,
            RunStatus::Running => {
                self.store
                    .xid_set_state(xid, XID_RUNNING)
                    .map_err(|e| OpError::StorageError(e.to_string()))?;
                match self.poll(agent, xid, deadline, timeout).await {
                    Ok(response) => response,
                    Err(e) => {
                        // A timed-out command is still running on the agent
                        // and holding its run slot; kill it rather than leave
                        // it to finish unobserved.
                        if matches!(e, OpError::CommandTimeout(_)) {
                            let _ = self.kill(agent, xid).await;
                        }
                        let _ = self.store.xid_set_state(xid, XID_FINISHED);
                        return Err(e);
                    }
                }
            }
            RunStatus::Unexpected(other) => {
                return Err(self.fail_agent(
                    agent,
                    OpError::AgentProtocolError(format!(
                        "{}: unexpected run-status {other:?} on start",
                        agent.displayname
                    )),
                ));
            }
        };

        let cleanup_error = match self.cleanup(agent, xid).await {
            Ok(()) => None,
            Err(e) => {
                warn!(agent = %agent.displayname, xid, error = %e, "Cleanup failed");
                Some(e.to_string())
            }
        };
        self.store
            .xid_set_state(xid, XID_FINISHED)
            .map_err(|e| OpError::StorageError(e.to_string()))?;

        let exit_status = response.exit_status.unwrap_or(-1);
        let stdout = response.stdout.unwrap_or_default();
        let stderr = response.stderr.unwrap_or_default();
        let error = response.error.or_else(|| {
            (exit_status != 0).then(|| {
                if stderr.trim().is_empty() {
                    format!("command exited with status {exit_status}")
                } else {
                    stderr.trim().to_string()
                }
            })
        });

        Ok(CliResult {
            xid,
            exit_status,
            stdout,
            stderr,
            error,
            cleanup_error,
        })
    }

    async fn poll(
        &self,
        agent: &Arc<AgentConnection>,
        xid: u64,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<CliResponse, OpError> {
        loop {
            if Instant::now() >= deadline {
                return Err(OpError::CommandTimeout(timeout.as_secs()));
            }
            tokio::time::sleep(self.poll_interval).await;

            // The registry, not the socket, is the source of truth: a
            // reconnect produces a new conn_id and orphans this poll.
            if !self.registry.is_connected(agent.uuid, agent.conn_id) {
                return Err(OpError::AgentDisconnected(agent.displayname.clone()));
            }
            if agent.is_initializing() {
                continue;
            }

            let response = match agent.get::<CliResponse>(&format!("/cli?xid={xid}")).await {
                Ok(response) => response,
                Err(e) => return Err(self.fail_agent(agent, e)),
            };
            self.check_xid(agent, xid, &response)?;

            match RunStatus::parse(&response.run_status) {
                RunStatus::Running => continue,
                RunStatus::Finished => return Ok(response),
                RunStatus::Unexpected(other) => {
                    return Err(self.fail_agent(
                        agent,
                        OpError::AgentProtocolError(format!(
                            "{}: unexpected run-status {other:?} on poll",
                            agent.displayname
                        )),
                    ));
                }
            }
        }
    }

    async fn cleanup(&self, agent: &Arc<AgentConnection>, xid: u64) -> Result<(), OpError> {
        let _guard = agent.lock_command().await;
        match agent
            .post::<_, CliResponse>("/cli", &CliRequest::cleanup(xid))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail_agent(agent, e)),
        }
    }

    /// Abort a running command. Marks the xid finished; whatever the agent
    /// reports for the dying process is not waited on.
    pub async fn kill(&self, agent: &Arc<AgentConnection>, xid: u64) -> Result<(), OpError> {
        let _guard = agent.lock_command().await;
        let result = agent
            .post::<_, CliResponse>("/cli", &CliRequest::kill(xid))
            .await;
        self.store
            .xid_set_state(xid, XID_FINISHED)
            .map_err(|e| OpError::StorageError(e.to_string()))?;
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail_agent(agent, e)),
        }
    }

    fn check_xid(
        &self,
        agent: &Arc<AgentConnection>,
        xid: u64,
        response: &CliResponse,
    ) -> Result<(), OpError> {
        if response.xid == Some(xid) {
            return Ok(());
        }
        Err(self.fail_agent(
            agent,
            OpError::AgentProtocolError(format!(
                "{}: response xid {:?} does not match request xid {xid}",
                agent.displayname, response.xid
            )),
        ))
    }

    /// Protocol and transport failures poison the connection: remove the
    /// agent so nothing else trusts it, then hand the error back.
    fn fail_agent(&self, agent: &Arc<AgentConnection>, e: OpError) -> OpError {
        if e.removed_agent() {
            self.registry.remove_failed(agent.uuid, &e.to_string());
        }
        e
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}
