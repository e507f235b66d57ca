//! Cloud storage seam for backup placement.
//!
//! Transfers run agent-side (the agent holds the credentials and the
//! bandwidth); the controller only instructs. Implementations live outside
//! the core; `None` simply takes cloud placement out of the candidate list.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use shep_common::error::OpError;
use shep_registry::AgentConnection;

pub trait CloudStore: Send + Sync {
    /// Cloud kind, e.g. `s3`.
    fn kind(&self) -> &str;

    fn bucket(&self) -> &str;

    /// Upload a file from an agent's local path to `key`.
    fn put<'a>(
        &'a self,
        agent: &'a Arc<AgentConnection>,
        path: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<(), OpError>>;

    /// Download `key` to a local path on an agent.
    fn fetch<'a>(
        &'a self,
        agent: &'a Arc<AgentConnection>,
        key: &'a str,
        dest_path: &'a str,
    ) -> BoxFuture<'a, Result<(), OpError>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), OpError>>;
}
