use thiserror::Error;

/// Error taxonomy for controller operations.
///
/// Protocol and transport errors are unrecoverable for the connection that
/// produced them: the agent is removed from the registry before the error is
/// returned. Precondition errors (`InsufficientDiskSpace`,
/// `InvalidStateForOperation`, `Busy`) are raised before any network call and
/// have no side effects.
#[derive(Error, Debug)]
pub enum OpError {
    #[error("agent disconnected: {0}")]
    AgentDisconnected(String),

    #[error("agent protocol error: {0}")]
    AgentProtocolError(String),

    #[error("agent transport error: {0}")]
    AgentTransportError(String),

    #[error("command timed out after {0} seconds")]
    CommandTimeout(u64),

    #[error("insufficient disk space: {0}")]
    InsufficientDiskSpace(String),

    #[error("invalid state for operation: {0}")]
    InvalidStateForOperation(String),

    #[error("busy with another request: {0}")]
    Busy(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("duplicate agent: {0}")]
    DuplicateAgent(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl OpError {
    /// True for failures that already removed the agent from the registry.
    pub fn removed_agent(&self) -> bool {
        matches!(
            self,
            OpError::AgentProtocolError(_) | OpError::AgentTransportError(_)
        )
    }
}
