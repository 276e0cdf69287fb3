//! Session orchestration errors.

use serde::Serialize;
use thiserror::Error;

use super::models::SessionStatus;
use crate::container::ContainerError;
use crate::workspace::WorkspaceError;

/// Longest diagnostic kept from the container runtime.
pub const MAX_DIAGNOSTIC_LEN: usize = 300;

/// Why a launch was turned away. Expected in steady state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    #[error("you already have an active session ({status})")]
    ActiveSession { status: SessionStatus },

    #[error("global capacity reached, {in_use} of {ceiling} sessions are in use")]
    Capacity { in_use: i64, ceiling: i64 },

    #[error("no available ports")]
    NoAvailablePorts,
}

impl Rejection {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Rejection::ActiveSession { .. } => "active_session",
            Rejection::Capacity { .. } => "capacity_reached",
            Rejection::NoAvailablePorts => "no_available_ports",
        }
    }

    /// Whether trying again later may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Rejection::ActiveSession { .. })
    }
}

/// Errors surfaced by the session orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Rejected(Rejection),

    #[error("workspace unavailable ({reason}): {message}")]
    WorkspaceUnavailable {
        reason: &'static str,
        message: String,
    },

    #[error("container launch failed: {0}")]
    RuntimeLaunchFailed(String),

    #[error("container stop failed: {0}")]
    RuntimeStopFailed(String),

    #[error("container runtime timed out: {0}")]
    RuntimeTimeout(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("session store inconsistency: {0}")]
    StoreInconsistency(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {id} is {status}, cannot {action}")]
    InvalidState {
        id: String,
        status: SessionStatus,
        action: &'static str,
    },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Stable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            OrchestratorError::Rejected(rejection) => rejection.reason_code(),
            OrchestratorError::WorkspaceUnavailable { .. } => "workspace_unavailable",
            OrchestratorError::RuntimeLaunchFailed(_) => "runtime_launch_failed",
            OrchestratorError::RuntimeStopFailed(_) => "runtime_stop_failed",
            OrchestratorError::RuntimeTimeout(_) => "runtime_timeout",
            OrchestratorError::RuntimeUnavailable(_) => "runtime_unavailable",
            OrchestratorError::StoreInconsistency(_) => "store_inconsistency",
            OrchestratorError::SessionNotFound(_) => "session_not_found",
            OrchestratorError::InvalidState { .. } => "invalid_state",
            OrchestratorError::Forbidden(_) => "forbidden",
            OrchestratorError::InvalidRequest(_) => "invalid_request",
            OrchestratorError::Store(_) => "store_error",
        }
    }

    /// Map a failed launch, with its diagnostic already sanitized.
    pub(crate) fn from_launch(err: &ContainerError, diagnostic: String) -> Self {
        match err {
            ContainerError::Timeout { .. } => OrchestratorError::RuntimeTimeout(diagnostic),
            ContainerError::RuntimeUnavailable(_) => {
                OrchestratorError::RuntimeUnavailable(diagnostic)
            }
            _ => OrchestratorError::RuntimeLaunchFailed(diagnostic),
        }
    }

    /// Map a failed stop, with its diagnostic already sanitized.
    pub(crate) fn from_stop(err: &ContainerError, diagnostic: String) -> Self {
        match err {
            ContainerError::Timeout { .. } => OrchestratorError::RuntimeTimeout(diagnostic),
            ContainerError::RuntimeUnavailable(_) => {
                OrchestratorError::RuntimeUnavailable(diagnostic)
            }
            _ => OrchestratorError::RuntimeStopFailed(diagnostic),
        }
    }
}

impl From<WorkspaceError> for OrchestratorError {
    fn from(err: WorkspaceError) -> Self {
        OrchestratorError::WorkspaceUnavailable {
            reason: err.reason_code(),
            message: err.to_string(),
        }
    }
}

/// Redact sensitive values from a runtime diagnostic and cap its length.
pub fn sanitize_diagnostic(raw: &str, redactions: &[&str]) -> String {
    let mut text = raw.trim().to_string();
    for value in redactions.iter().filter(|v| !v.is_empty()) {
        text = text.replace(value, "[redacted]");
    }

    if text.chars().count() > MAX_DIAGNOSTIC_LEN {
        let mut truncated: String = text.chars().take(MAX_DIAGNOSTIC_LEN).collect();
        truncated.push_str("...");
        return truncated;
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_redacts_secret_and_path() {
        let raw = "docker: error mounting /srv/data/alice with PASSWORD=abc123XYZ";
        let clean = sanitize_diagnostic(raw, &["abc123XYZ", "/srv/data/alice"]);
        assert!(!clean.contains("abc123XYZ"));
        assert!(!clean.contains("/srv/data/alice"));
        assert!(clean.contains("[redacted]"));
    }

    #[test]
    fn diagnostic_is_truncated() {
        let raw = "x".repeat(1000);
        let clean = sanitize_diagnostic(&raw, &[]);
        assert_eq!(clean.chars().count(), MAX_DIAGNOSTIC_LEN + 3);
    }

    #[test]
    fn rejection_messages_are_user_facing() {
        let capacity = Rejection::Capacity {
            in_use: 2,
            ceiling: 2,
        };
        assert_eq!(
            capacity.to_string(),
            "global capacity reached, 2 of 2 sessions are in use"
        );
        assert!(capacity.is_retryable());
        assert!(
            !Rejection::ActiveSession {
                status: SessionStatus::Running
            }
            .is_retryable()
        );
        assert_eq!(Rejection::NoAvailablePorts.to_string(), "no available ports");
    }

    #[test]
    fn launch_errors_map_by_kind() {
        let timeout = ContainerError::Timeout {
            command: "run".into(),
            seconds: 60,
        };
        assert_eq!(
            OrchestratorError::from_launch(&timeout, String::new()).reason_code(),
            "runtime_timeout"
        );
        let conflict = ContainerError::NameConflict("x".into());
        assert_eq!(
            OrchestratorError::from_launch(&conflict, String::new()).reason_code(),
            "runtime_launch_failed"
        );
    }
}
