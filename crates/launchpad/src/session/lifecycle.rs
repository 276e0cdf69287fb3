//! Container lifecycle: drive the runtime and settle the outcome in the store.

use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::error::{OrchestratorError, sanitize_diagnostic};
use super::models::Session;
use super::profile::{FamilyProfile, FamilyProfiles};
use super::store::SessionStore;
use crate::container::{
    ContainerError, ContainerResult, ContainerRuntimeApi, LaunchSpec, StopOutcome, short_id,
};
use crate::db::{parse_timestamp, timestamp};
use crate::workspace::{Workspace, WorkspaceProvisioner};

/// Label carrying the session id on every container we start.
pub const SESSION_LABEL: &str = "launchpad.session";
pub const FAMILY_LABEL: &str = "launchpad.family";

/// Result of a stop request that did not fail.
#[derive(Debug, Clone)]
pub enum StopResult {
    /// This call moved the session out of `running`.
    Stopped(Session),
    /// The session was not stoppable; it is returned as currently stored.
    Unchanged(Session),
}

#[derive(Clone)]
pub struct LifecycleManager {
    store: SessionStore,
    runtime: Arc<dyn ContainerRuntimeApi>,
    workspaces: WorkspaceProvisioner,
    profiles: Arc<FamilyProfiles>,
    runtime_timeout: Duration,
    stop_grace_secs: Option<u32>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("workspaces", &self.workspaces)
            .field("runtime_timeout", &self.runtime_timeout)
            .field("stop_grace_secs", &self.stop_grace_secs)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(
        store: SessionStore,
        runtime: Arc<dyn ContainerRuntimeApi>,
        workspaces: WorkspaceProvisioner,
        profiles: Arc<FamilyProfiles>,
        runtime_timeout: Duration,
        stop_grace_secs: Option<u32>,
    ) -> Self {
        Self {
            store,
            runtime,
            workspaces,
            profiles,
            runtime_timeout,
            stop_grace_secs,
        }
    }

    /// Launch the container for a freshly admitted `requested` session.
    ///
    /// Ends with the row in `running` or `error`.
    pub async fn launch(
        &self,
        session: Session,
        user_segment: &str,
    ) -> Result<Session, OrchestratorError> {
        let profile = self.profiles.get(session.family);

        let expires_at = match expiry_for(&session) {
            Ok(expires_at) => expires_at,
            Err(err) => {
                self.record_launch_failure(&session.id, &err.to_string())
                    .await?;
                return Err(err);
            }
        };

        let workspace = match self.workspaces.ensure(user_segment, profile.owner()) {
            Ok(workspace) => workspace,
            Err(err) => {
                let base = self.workspaces.base_dir().display().to_string();
                let diagnostic = sanitize_diagnostic(&err.to_string(), &[base.as_str()]);
                log::warn!(
                    "Workspace for session {} unavailable ({}): {}",
                    session.id,
                    err.reason_code(),
                    diagnostic
                );
                self.record_launch_failure(&session.id, &diagnostic).await?;
                return Err(OrchestratorError::WorkspaceUnavailable {
                    reason: err.reason_code(),
                    message: diagnostic,
                });
            }
        };

        let spec = build_launch_spec(&session, profile, &workspace);

        match self.bounded("run", self.runtime.launch(&spec)).await {
            Ok(container_id) => {
                let container_id = short_id(&container_id);
                match self
                    .store
                    .finalize_running(&session.id, &container_id, &expires_at)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        self.best_effort_stop(&session.container_name).await;
                        return Err(inconsistency(format!(
                            "session {} left requested while its container was starting",
                            session.id
                        )));
                    }
                    Err(err) => {
                        self.best_effort_stop(&session.container_name).await;
                        if let Err(inner) = self
                            .store
                            .finalize_error(&session.id, "failed to record running container")
                            .await
                        {
                            log::error!(
                                "Failed to mark session {} failed: {:#}",
                                session.id,
                                inner
                            );
                        }
                        return Err(inconsistency(format!(
                            "session {} started container {} but could not be recorded running: {:#}",
                            session.id, container_id, err
                        )));
                    }
                }

                log::info!(
                    "Session {} running as container {} ({}) on port {}",
                    session.id,
                    session.container_name,
                    container_id,
                    session.port
                );
                self.reload(&session.id).await
            }
            Err(err) => {
                let diagnostic = redact(&err, &session, &workspace);
                log::warn!("Launch of session {} failed: {}", session.id, diagnostic);
                if let Err(store_err) = self.record_launch_failure(&session.id, &diagnostic).await
                {
                    return Err(match store_err {
                        OrchestratorError::Store(inner) => inconsistency(format!(
                            "session {} launch failed but could not be recorded: {:#}",
                            session.id, inner
                        )),
                        other => other,
                    });
                }

                if matches!(err, ContainerError::Timeout { .. }) {
                    self.best_effort_stop(&session.container_name).await;
                }

                Err(OrchestratorError::from_launch(&err, diagnostic))
            }
        }
    }

    /// Stop a `running` (or `error_stopping`) session.
    ///
    /// `via_expiry` selects `stopped_expired` over `stopped`.
    pub async fn stop(
        &self,
        session: &Session,
        via_expiry: bool,
    ) -> Result<StopResult, OrchestratorError> {
        if !self.store.begin_stop(&session.id).await? {
            let current = self.reload(&session.id).await?;
            return Ok(StopResult::Unchanged(current));
        }

        let outcome = self
            .bounded(
                "stop",
                self.runtime.stop(&session.container_name, self.stop_grace_secs),
            )
            .await;

        match outcome {
            Ok(result) => {
                let stopped_at = timestamp(Utc::now());
                match self
                    .store
                    .finalize_stopped(&session.id, &stopped_at, via_expiry)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(inconsistency(format!(
                            "session {} left stopping before its stop was recorded",
                            session.id
                        )));
                    }
                    Err(err) => {
                        return Err(inconsistency(format!(
                            "session {} container {} stopped but could not be recorded: {:#}",
                            session.id, session.container_name, err
                        )));
                    }
                }
                if result == StopOutcome::Stopped {
                    log::info!("Session {} stopped", session.id);
                } else {
                    log::info!(
                        "Session {} container {} was {}, treating as stopped",
                        session.id,
                        session.container_name,
                        result
                    );
                }
                Ok(StopResult::Stopped(self.reload(&session.id).await?))
            }
            Err(err) => {
                let base = self.workspaces.base_dir().display().to_string();
                let diagnostic = sanitize_diagnostic(
                    &err.diagnostic(),
                    &[session.secret.expose(), base.as_str()],
                );
                log::warn!("Stop of session {} failed: {}", session.id, diagnostic);
                match self
                    .store
                    .finalize_stop_failed(&session.id, &diagnostic)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(inconsistency(format!(
                            "session {} left stopping before its stop failure was recorded",
                            session.id
                        )));
                    }
                    Err(err) => {
                        return Err(inconsistency(format!(
                            "session {} stop failed and could not be recorded: {:#}",
                            session.id, err
                        )));
                    }
                }
                Err(OrchestratorError::from_stop(&err, diagnostic))
            }
        }
    }

    async fn bounded<T>(
        &self,
        command: &str,
        call: impl std::future::Future<Output = ContainerResult<T>>,
    ) -> ContainerResult<T> {
        match tokio::time::timeout(self.runtime_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ContainerError::Timeout {
                command: command.to_string(),
                seconds: self.runtime_timeout.as_secs(),
            }),
        }
    }

    /// Stop a container that may have started after we gave up on it.
    async fn best_effort_stop(&self, container_name: &str) {
        match self.bounded("stop", self.runtime.stop(container_name, Some(0))).await {
            Ok(outcome) => log::info!(
                "Cleanup stop of container {}: {}",
                container_name,
                outcome
            ),
            Err(err) => log::warn!(
                "Cleanup stop of container {} failed: {}",
                container_name,
                err
            ),
        }
    }

    async fn record_launch_failure(
        &self,
        session_id: &str,
        diagnostic: &str,
    ) -> Result<(), OrchestratorError> {
        if !self.store.finalize_error(session_id, diagnostic).await? {
            return Err(inconsistency(format!(
                "session {} left requested before its launch failure was recorded",
                session_id
            )));
        }
        Ok(())
    }

    async fn reload(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| inconsistency(format!("session {} disappeared", session_id)))
    }
}

/// Build the runtime request for a session.
pub fn build_launch_spec(
    session: &Session,
    profile: &FamilyProfile,
    workspace: &Workspace,
) -> LaunchSpec {
    let mut spec = LaunchSpec::new(&session.container_name, &profile.image);
    for (key, value) in &profile.extra_env {
        spec = spec.env(key, value);
    }

    let host_port = u16::try_from(session.port).unwrap_or_default();
    spec.env(&profile.secret_env, session.secret.expose())
        .port(host_port, profile.container_port)
        .volume(
            workspace.host_path.display().to_string(),
            &profile.mount_path,
        )
        .memory(&session.memory_limit)
        .cpus(&session.cpu_limit)
        .storage_limit(session.storage_limit.as_deref())
        .label(SESSION_LABEL, &session.id)
        .label(FAMILY_LABEL, session.family.as_str())
}

/// `created_at + lifetime_days`, in stored form.
fn expiry_for(session: &Session) -> Result<String, OrchestratorError> {
    let created_at = parse_timestamp(&session.created_at)?;
    let expires_at = TimeDelta::try_days(session.lifetime_days)
        .and_then(|lifetime| created_at.checked_add_signed(lifetime))
        .ok_or_else(|| {
            OrchestratorError::InvalidRequest(format!(
                "lifetime of {} days is out of range",
                session.lifetime_days
            ))
        })?;
    Ok(timestamp(expires_at))
}

fn redact(err: &ContainerError, session: &Session, workspace: &Workspace) -> String {
    let host = workspace.host_path.display().to_string();
    let local = workspace.local_path.display().to_string();
    sanitize_diagnostic(
        &err.diagnostic(),
        &[session.secret.expose(), host.as_str(), local.as_str()],
    )
}

fn inconsistency(message: String) -> OrchestratorError {
    log::error!("Session store inconsistency: {}", message);
    OrchestratorError::StoreInconsistency(message)
}
