//! Cross-agent file copy.
//!
//! Pull-style: the target agent fetches the file over HTTPS from the source
//! agent's file endpoint, authenticated with the source's transfer
//! credentials. The controller never proxies file bytes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error};

use shep_common::error::OpError;
use shep_common::events::{EventBus, EventKey};
use shep_common::report::OpReport;
use shep_registry::{AgentConnection, CommandChannel, RunOpts};

use crate::Orchestrator;

impl Orchestrator {
    /// Copy a file between two agents, resolved by hostname or display name.
    pub async fn copy(
        &self,
        src_host: &str,
        dst_host: &str,
        source_path: &str,
        target_dir: &str,
    ) -> Result<OpReport, OpError> {
        let source = self
            .registry
            .by_host(src_host)
            .ok_or_else(|| OpError::AgentDisconnected(format!("no agent at {src_host}")))?;
        let target = self
            .registry
            .by_host(dst_host)
            .ok_or_else(|| OpError::AgentDisconnected(format!("no agent at {dst_host}")))?;
        let _guard = target.try_user_action()?;

        copy_file(
            &self.channel,
            &self.events,
            &source,
            source_path,
            &target,
            target_dir,
            self.command_timeout(),
        )
        .await?;
        Ok(OpReport::ok().with_info(format!(
            "Copied {source_path} from {} to {}:{target_dir}.",
            source.displayname, target.displayname
        )))
    }
}

pub async fn copy_file(
    channel: &CommandChannel,
    events: &EventBus,
    source: &Arc<AgentConnection>,
    source_path: &str,
    target: &Arc<AgentConnection>,
    target_dir: &str,
    timeout: Duration,
) -> Result<(), OpError> {
    if source_path.is_empty() {
        return Err(OpError::StorageError("empty source path".to_string()));
    }

    // The target pulls from the source's listen port; make sure the source
    // host lets it through.
    if let Err(e) = channel.firewall_enable(source, &[source.listen_port]).await {
        error!(
            source = %source.displayname,
            port = source.listen_port,
            error = %e,
            "Failed to open firewall port on copy source"
        );
        events.publish(
            EventKey::FirewallOpenFailed,
            json!({ "agent": source.displayname, "port": source.listen_port }),
        );
        return Err(e);
    }

    channel.mkdirs(target, target_dir).await.map_err(|e| {
        OpError::StorageError(format!(
            "could not create {target_dir} on {}: {e}",
            target.displayname
        ))
    })?;

    let path = if source_path.starts_with('/') {
        source_path.to_string()
    } else {
        format!("/{source_path}")
    };
    let cli = format!(
        "fetch GET \"https://{}:{}/file?path={}\" \"{}\"",
        source.host, source.listen_port, path, target_dir
    );

    let mut env = HashMap::new();
    if let (Some(user), Some(password)) = (&source.transfer_user, &source.transfer_password) {
        env.insert("BASIC_USERNAME".to_string(), user.clone());
        env.insert("BASIC_PASSWORD".to_string(), password.clone());
    }

    debug!(
        source = %source.displayname,
        target = %target.displayname,
        path = %source_path,
        "Copying file between agents"
    );
    let result = channel
        .run(
            target,
            &cli,
            RunOpts {
                env: (!env.is_empty()).then_some(env),
                immediate: false,
                timeout: Some(timeout),
            },
        )
        .await?;

    if let Some(error) = result.error {
        return Err(OpError::StorageError(format!(
            "copy from {} to {} failed: {error}",
            source.displayname, target.displayname
        )));
    }
    Ok(())
}
