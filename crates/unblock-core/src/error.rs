//! Error taxonomy for the gate controller.

/// Coarse classification of a [`GateError`], for callers that branch on the
/// kind of failure rather than its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The agent command or the remote API failed.
    Collaborator,
    /// The configuration cannot describe a valid gate.
    InvalidConfiguration,
    /// A single job could not be released.
    Release,
    /// A racer ended without producing a race event.
    Race,
}

/// Gate controller errors.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("agent command `{command}` failed with exit code {exit_code:?}: {stderr}")]
    AgentCommand {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("agent command `{command}` timed out after {timeout_secs}s")]
    AgentTimeout { command: String, timeout_secs: u64 },

    #[error("remote API {operation} returned status {status}: {body}")]
    RemoteStatus {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("remote API {operation} failed: {message}")]
    RemoteTransport { operation: String, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("job {job_id} has no unblock target")]
    InvalidTarget { job_id: String },

    #[error("racer `{racer}` ended without an event: {reason}")]
    RacerAborted { racer: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GateError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::AgentCommand { .. }
            | GateError::AgentTimeout { .. }
            | GateError::RemoteStatus { .. }
            | GateError::RemoteTransport { .. }
            | GateError::Serialization(_) => ErrorKind::Collaborator,
            GateError::InvalidConfig(_) => ErrorKind::InvalidConfiguration,
            GateError::InvalidTarget { .. } => ErrorKind::Release,
            GateError::RacerAborted { .. } => ErrorKind::Race,
        }
    }

    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        GateError::InvalidConfig(msg.into())
    }
}

/// Result type for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
