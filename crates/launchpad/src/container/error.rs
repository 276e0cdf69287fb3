//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime ran but reported a failure.
    #[error("container {command} failed: {message}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        message: String,
    },

    /// Another container already uses the requested name.
    #[error("container name already in use: {0}")]
    NameConflict(String),

    /// The runtime did not answer within the configured bound.
    #[error("container {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// The runtime binary is missing, not executable, or cannot reach its daemon.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ContainerError {
    /// Diagnostic text reported by the runtime, if any.
    pub fn diagnostic(&self) -> String {
        match self {
            ContainerError::CommandFailed { message, .. } => message.trim().to_string(),
            other => other.to_string(),
        }
    }
}
