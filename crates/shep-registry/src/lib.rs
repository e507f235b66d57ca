//! Agent fleet: connection records, the registry, the handshake listener,
//! and the command channel that drives the three-phase command protocol.

pub mod command;
pub mod connection;
pub mod listener;
pub mod registry;
pub mod remote;

pub use command::{CliResult, CommandChannel, RunOpts, XID_FINISHED, XID_RUNNING, XID_STARTED};
pub use connection::{AgentConnection, AgentRole};
pub use listener::Listener;
pub use registry::AgentRegistry;
