//! Error types for the Buildkite bindings

use thiserror::Error;
use unblock_core::GateError;

/// Errors raised by the `buildkite-agent` and REST bindings
#[derive(Error, Debug)]
pub enum BuildkiteError {
    /// The agent binary could not be started
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The agent exited non-zero
    #[error("`{command}` exited with code {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The agent did not finish in time
    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// The REST API answered with a non-success status
    #[error("{operation} returned status {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    /// The REST call did not complete
    #[error("{operation} failed: {message}")]
    Transport { operation: String, message: String },

    /// The agent started but its output could not be collected
    #[error("failed to read output of `{command}`: {source}")]
    Output {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for BuildkiteError {
    fn from(err: reqwest::Error) -> Self {
        BuildkiteError::Http(err.to_string())
    }
}

impl From<BuildkiteError> for GateError {
    fn from(err: BuildkiteError) -> Self {
        match err {
            BuildkiteError::Spawn { command, source } => GateError::AgentCommand {
                command,
                exit_code: None,
                stderr: source.to_string(),
            },
            BuildkiteError::CommandFailed {
                command,
                exit_code,
                stderr,
            } => GateError::AgentCommand {
                command,
                exit_code,
                stderr,
            },
            BuildkiteError::Timeout {
                command,
                timeout_secs,
            } => GateError::AgentTimeout {
                command,
                timeout_secs,
            },
            BuildkiteError::Status {
                operation,
                status,
                body,
            } => GateError::RemoteStatus {
                operation,
                status,
                body,
            },
            BuildkiteError::Transport { operation, message } => {
                GateError::RemoteTransport { operation, message }
            }
            BuildkiteError::Output { command, source } => GateError::AgentCommand {
                command,
                exit_code: None,
                stderr: source.to_string(),
            },
            BuildkiteError::Json(e) => GateError::Serialization(e),
            BuildkiteError::Http(message) => GateError::RemoteTransport {
                operation: "http client".to_string(),
                message,
            },
        }
    }
}

/// Result type for the Buildkite bindings
pub type Result<T> = std::result::Result<T, BuildkiteError>;
