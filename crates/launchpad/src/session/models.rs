//! Session data models.

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Kind of interactive environment a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionFamily {
    Rstudio,
    Jupyter,
}

impl SessionFamily {
    pub const ALL: [SessionFamily; 2] = [SessionFamily::Rstudio, SessionFamily::Jupyter];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionFamily::Rstudio => "rstudio",
            SessionFamily::Jupyter => "jupyter",
        }
    }
}

impl std::fmt::Display for SessionFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rstudio" => Ok(SessionFamily::Rstudio),
            "jupyter" | "jupyterlab" => Ok(SessionFamily::Jupyter),
            _ => Err(format!("unknown session family: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionFamily {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Row reserved, container launch underway.
    Requested,
    /// Container is running.
    Running,
    /// Launch failed.
    Error,
    /// Stop underway, port still held.
    Stopping,
    /// Stopped by the owner or an administrator.
    Stopped,
    /// Stopped by the expiry sweep.
    StoppedExpired,
    /// The runtime failed to stop the container.
    ErrorStopping,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Requested => "requested",
            SessionStatus::Running => "running",
            SessionStatus::Error => "error",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::StoppedExpired => "stopped_expired",
            SessionStatus::ErrorStopping => "error_stopping",
        }
    }

    /// Active sessions count against capacity and the one-session rule.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Requested | SessionStatus::Running | SessionStatus::Stopping
        )
    }

    /// The host port stays reserved until the container is confirmed gone.
    pub fn holds_port(&self) -> bool {
        self.is_active() || *self == SessionStatus::ErrorStopping
    }

    /// Terminal rows may be deleted by an administrator.
    pub fn is_terminal(&self) -> bool {
        !self.holds_port()
    }
}

/// SQL list of active statuses, for `status IN (...)` clauses.
pub(crate) const ACTIVE_STATUSES_SQL: &str = "('requested', 'running', 'stopping')";

/// SQL list of statuses whose port is still reserved.
pub(crate) const PORT_HOLDING_STATUSES_SQL: &str =
    "('requested', 'running', 'stopping', 'error_stopping')";

/// SQL list of terminal statuses.
pub(crate) const TERMINAL_STATUSES_SQL: &str = "('error', 'stopped', 'stopped_expired')";

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requested" => Ok(SessionStatus::Requested),
            "running" => Ok(SessionStatus::Running),
            "error" => Ok(SessionStatus::Error),
            "stopping" => Ok(SessionStatus::Stopping),
            "stopped" => Ok(SessionStatus::Stopped),
            "stopped_expired" => Ok(SessionStatus::StoppedExpired),
            "error_stopping" => Ok(SessionStatus::ErrorStopping),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

// Implement conversion from String for SQLx
impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Access secret handed to the session owner.
///
/// Never printed by `Debug` and never serialized implicitly.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecret(String);

const SECRET_LEN: usize = 16;

impl SessionSecret {
    /// Generate a fresh random secret.
    pub fn generate() -> Self {
        let value: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_LEN)
            .map(char::from)
            .collect();
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionSecret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret([redacted])")
    }
}

/// A session row.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    #[sqlx(try_from = "String")]
    pub family: SessionFamily,
    pub port: i64,
    pub container_name: String,
    /// Short runtime id, set once the container is running.
    pub container_id: Option<String>,
    #[sqlx(try_from = "String")]
    #[serde(skip_serializing)]
    pub secret: SessionSecret,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub memory_limit: String,
    pub cpu_limit: String,
    pub storage_limit: Option<String>,
    pub lifetime_days: i64,
    pub created_at: String,
    /// Only meaningful while running.
    pub expires_at: Option<String>,
    pub stopped_at: Option<String>,
    pub error_message: Option<String>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Access URL for the session's published port.
    pub fn access_url(&self, public_host: &str) -> String {
        format!("http://{}:{}", public_host, self.port)
    }
}

/// Resources and lifetime a new session is admitted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEnvelope {
    pub memory_limit: String,
    pub cpu_limit: String,
    pub storage_limit: Option<String>,
    pub lifetime_days: i64,
}

/// Row inserted by a successful admission.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub user_id: String,
    pub family: SessionFamily,
    pub port: u16,
    pub container_name: String,
    pub secret: SessionSecret,
    pub envelope: ResourceEnvelope,
    pub created_at: String,
}

impl NewSession {
    /// The row as stored right after reservation.
    pub fn into_requested(self) -> Session {
        Session {
            id: self.id,
            user_id: self.user_id,
            family: self.family,
            port: i64::from(self.port),
            container_name: self.container_name,
            container_id: None,
            secret: self.secret,
            status: SessionStatus::Requested,
            memory_limit: self.envelope.memory_limit,
            cpu_limit: self.envelope.cpu_limit,
            storage_limit: self.envelope.storage_limit,
            lifetime_days: self.envelope.lifetime_days,
            created_at: self.created_at,
            expires_at: None,
            stopped_at: None,
            error_message: None,
        }
    }
}

/// Session as shown to its owner, including how to reach it.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerSessionView {
    #[serde(flatten)]
    pub session: Session,
    /// Set while the session is active.
    pub access_url: Option<String>,
    /// Set while the session is active.
    pub secret: Option<String>,
    /// Environment variable the secret is passed in, e.g. `PASSWORD`.
    pub secret_kind: String,
}

impl OwnerSessionView {
    pub fn new(session: Session, public_host: &str, secret_kind: &str) -> Self {
        let (access_url, secret) = if session.is_active() {
            (
                Some(session.access_url(public_host)),
                Some(session.secret.expose().to_string()),
            )
        } else {
            (None, None)
        };
        Self {
            session,
            access_url,
            secret,
            secret_kind: secret_kind.to_string(),
        }
    }
}

/// Request to launch a new session.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub family: SessionFamily,
    /// Lifetime in days; defaults to the family's configured lifetime.
    #[serde(default)]
    pub lifetime_days: Option<i64>,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub attempted: usize,
    pub reclaimed: usize,
    pub failed: usize,
    /// Session ids whose stop failed.
    pub failures: Vec<String>,
}

/// Current usage against the concurrency ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityReport {
    pub active: i64,
    pub running: i64,
    pub ceiling: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SessionStatus::Requested,
            SessionStatus::Running,
            SessionStatus::Error,
            SessionStatus::Stopping,
            SessionStatus::Stopped,
            SessionStatus::StoppedExpired,
            SessionStatus::ErrorStopping,
        ] {
            assert_eq!(status.to_string().parse::<SessionStatus>(), Ok(status));
        }
        assert!("paused".parse::<SessionStatus>().is_err());
        assert_eq!(
            SessionStatus::try_from("error_stopping".to_string()),
            Ok(SessionStatus::ErrorStopping)
        );
    }

    #[test]
    fn failed_stops_hold_their_port_but_no_slot() {
        assert!(SessionStatus::Requested.is_active());
        assert!(SessionStatus::Running.is_active());
        assert!(SessionStatus::Stopping.is_active());
        assert!(!SessionStatus::ErrorStopping.is_active());
        assert!(SessionStatus::ErrorStopping.holds_port());
        assert!(!SessionStatus::ErrorStopping.is_terminal());
        assert!(!SessionStatus::Error.holds_port());
        assert!(SessionStatus::StoppedExpired.is_terminal());
    }

    #[test]
    fn family_parses_aliases() {
        assert_eq!("RStudio".parse(), Ok(SessionFamily::Rstudio));
        assert_eq!("jupyterlab".parse(), Ok(SessionFamily::Jupyter));
        assert!("vscode".parse::<SessionFamily>().is_err());
    }

    #[test]
    fn secret_is_redacted_and_alphanumeric() {
        let secret = SessionSecret::generate();
        assert_eq!(secret.expose().len(), 16);
        assert!(secret.expose().chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!format!("{secret:?}").contains(secret.expose()));
        assert_ne!(secret, SessionSecret::generate());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::StoppedExpired).unwrap(),
            "\"stopped_expired\""
        );
    }
}
