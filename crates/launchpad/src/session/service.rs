//! Session orchestration service.
//!
//! Entry point for launching, stopping, listing and reaping sessions.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use super::admission::{ActiveScope, AdmissionController, AdmissionDecision, AdmissionRequest};
use super::error::OrchestratorError;
use super::lifecycle::{LifecycleManager, StopResult};
use super::models::{
    CapacityReport, CreateSessionRequest, OwnerSessionView, ReapReport, Session, SessionFamily,
    SessionStatus,
};
use super::profile::FamilyProfiles;
use super::store::SessionStore;
use crate::container::ContainerRuntimeApi;
use crate::db::timestamp;
use crate::user::User;
use crate::workspace::{WorkspaceProvisioner, user_segment};

/// Longest user segment kept in container names.
const MAX_NAME_SEGMENT: usize = 40;

/// Session service configuration.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Ceiling on active sessions across all users.
    pub max_concurrent_sessions: i64,
    pub active_scope: ActiveScope,
    /// Upper bound on a requested lifetime.
    pub max_lifetime_days: i64,
    /// Bound on every container runtime call.
    pub runtime_timeout: Duration,
    /// Seconds the runtime waits before killing a stopping container.
    pub stop_grace_secs: Option<u32>,
    /// Hostname used in access URLs.
    pub public_host: String,
    pub families: FamilyProfiles,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 20,
            active_scope: ActiveScope::Global,
            max_lifetime_days: 14,
            runtime_timeout: Duration::from_secs(60),
            stop_grace_secs: Some(10),
            public_host: "localhost".to_string(),
            families: FamilyProfiles::default(),
        }
    }
}

/// Session orchestrator.
#[derive(Debug, Clone)]
pub struct SessionService {
    store: SessionStore,
    admission: AdmissionController,
    lifecycle: LifecycleManager,
    profiles: Arc<FamilyProfiles>,
    max_lifetime_days: i64,
    public_host: String,
}

impl SessionService {
    pub fn new(
        store: SessionStore,
        runtime: Arc<dyn ContainerRuntimeApi>,
        workspaces: WorkspaceProvisioner,
        config: SessionServiceConfig,
    ) -> Self {
        let profiles = Arc::new(config.families);
        let admission = AdmissionController::new(
            store.clone(),
            config.max_concurrent_sessions,
            config.active_scope,
        );
        let lifecycle = LifecycleManager::new(
            store.clone(),
            runtime,
            workspaces,
            Arc::clone(&profiles),
            config.runtime_timeout,
            config.stop_grace_secs,
        );

        Self {
            store,
            admission,
            lifecycle,
            profiles,
            max_lifetime_days: config.max_lifetime_days,
            public_host: config.public_host,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Admit and launch a new session for `user`.
    ///
    /// The launch runs in its own task so an abandoned caller cannot leave
    /// the row half-finished.
    pub async fn launch(
        &self,
        user: &User,
        request: CreateSessionRequest,
    ) -> Result<OwnerSessionView, OrchestratorError> {
        let profile = self.profiles.get(request.family);
        let lifetime_days = request.lifetime_days.unwrap_or(profile.lifetime_days);
        if lifetime_days < 1 || lifetime_days > self.max_lifetime_days {
            return Err(OrchestratorError::InvalidRequest(format!(
                "lifetime must be between 1 and {} days",
                self.max_lifetime_days
            )));
        }

        let segment = user_segment(&user.email)?;
        let decision = self
            .admission
            .admit(AdmissionRequest {
                user_id: user.id.clone(),
                family: request.family,
                port_range: profile.port_range(),
                container_name: container_name(request.family, &segment),
                envelope: profile.envelope(lifetime_days),
            })
            .await?;

        let session = match decision {
            AdmissionDecision::Admitted(session) => session,
            AdmissionDecision::Rejected(rejection) => {
                return Err(OrchestratorError::Rejected(rejection));
            }
        };

        let lifecycle = self.lifecycle.clone();
        let session_id = session.id.clone();
        let task = tokio::spawn(async move { lifecycle.launch(session, &segment).await });
        let session = match task.await {
            Ok(result) => result?,
            Err(join_err) => {
                error!("Launch task for session {} aborted: {}", session_id, join_err);
                return Err(OrchestratorError::StoreInconsistency(format!(
                    "launch of session {} did not complete",
                    session_id
                )));
            }
        };

        Ok(self.owner_view(session))
    }

    /// Stop a session on behalf of `actor`.
    ///
    /// Already stopped, failed, or stopping sessions are returned unchanged.
    pub async fn stop(&self, actor: &User, session_id: &str) -> Result<Session, OrchestratorError> {
        let session = self.get_authorized(actor, session_id).await?;

        match session.status {
            SessionStatus::Stopped
            | SessionStatus::StoppedExpired
            | SessionStatus::Error
            | SessionStatus::Stopping => {
                debug!(
                    "Stop of session {} is a no-op ({})",
                    session.id, session.status
                );
                return Ok(session);
            }
            SessionStatus::Requested => {
                return Err(OrchestratorError::InvalidState {
                    id: session.id,
                    status: SessionStatus::Requested,
                    action: "stop",
                });
            }
            SessionStatus::ErrorStopping if !actor.is_admin => {
                return Err(OrchestratorError::Forbidden(
                    "only an administrator can retry a failed stop".to_string(),
                ));
            }
            SessionStatus::Running | SessionStatus::ErrorStopping => {}
        }

        info!("User {} stopping session {}", actor.id, session.id);
        match self.lifecycle.stop(&session, false).await? {
            StopResult::Stopped(stopped) => Ok(stopped),
            StopResult::Unchanged(current) => match current.status {
                SessionStatus::Stopped
                | SessionStatus::StoppedExpired
                | SessionStatus::Error
                | SessionStatus::Stopping => Ok(current),
                status => Err(OrchestratorError::InvalidState {
                    id: current.id,
                    status,
                    action: "stop",
                }),
            },
        }
    }

    /// Remove a terminal session row. Administrators only.
    pub async fn delete(&self, actor: &User, session_id: &str) -> Result<(), OrchestratorError> {
        if !actor.is_admin {
            return Err(OrchestratorError::Forbidden(
                "only an administrator can delete sessions".to_string(),
            ));
        }

        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;

        if !session.is_terminal() || !self.store.delete_terminal(session_id).await? {
            return Err(OrchestratorError::InvalidState {
                id: session.id,
                status: session.status,
                action: "delete",
            });
        }

        info!("Admin {} deleted session {}", actor.id, session_id);
        Ok(())
    }

    /// A session visible to `actor`, with owner details when `actor` owns it.
    pub async fn get(
        &self,
        actor: &User,
        session_id: &str,
    ) -> Result<SessionDetails, OrchestratorError> {
        let session = self.get_authorized(actor, session_id).await?;
        if session.user_id == actor.id {
            Ok(SessionDetails::Owner(self.owner_view(session)))
        } else {
            Ok(SessionDetails::Admin(session))
        }
    }

    /// The caller's own sessions, newest first.
    pub async fn list_for_user(
        &self,
        user: &User,
    ) -> Result<Vec<OwnerSessionView>, OrchestratorError> {
        let sessions = self.store.list_for_user(&user.id).await?;
        Ok(sessions
            .into_iter()
            .map(|session| self.owner_view(session))
            .collect())
    }

    /// Every session, without secrets.
    pub async fn list_all(&self) -> Result<Vec<Session>, OrchestratorError> {
        Ok(self.store.list().await?)
    }

    pub async fn capacity(&self) -> Result<CapacityReport, OrchestratorError> {
        Ok(CapacityReport {
            active: self.store.count_active().await?,
            running: self.store.count_running().await?,
            ceiling: self.admission.ceiling(),
        })
    }

    /// Stop every running session whose expiry is at or before `now`.
    ///
    /// Each session is handled on its own; one failure does not stop the sweep.
    pub async fn reap_expired_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, OrchestratorError> {
        let expired = self.store.list_expired(&timestamp(now)).await?;
        let mut report = ReapReport::default();

        for session in expired {
            match self.lifecycle.stop(&session, true).await {
                Ok(StopResult::Stopped(_)) => {
                    report.attempted += 1;
                    report.reclaimed += 1;
                }
                Ok(StopResult::Unchanged(current)) => {
                    debug!(
                        "Expired session {} already {}, skipping",
                        current.id, current.status
                    );
                }
                Err(err) => {
                    warn!("Failed to reap expired session {}: {}", session.id, err);
                    report.attempted += 1;
                    report.failed += 1;
                    report.failures.push(session.id);
                }
            }
        }

        if report.attempted > 0 {
            info!(
                "Expiry sweep: attempted {}, reclaimed {}, failed {}",
                report.attempted, report.reclaimed, report.failed
            );
        } else {
            debug!("Expiry sweep: nothing to reap");
        }

        Ok(report)
    }

    /// Settle rows interrupted by a previous shutdown. Run once at startup.
    pub async fn recover_interrupted(&self) -> Result<(), OrchestratorError> {
        let (launches, stops) = self.store.recover_interrupted().await?;
        if launches > 0 || stops > 0 {
            warn!(
                "Recovered {} interrupted launches and {} interrupted stops",
                launches, stops
            );
        }
        Ok(())
    }

    /// Start a background task that reaps expired sessions periodically.
    pub fn start_reaper_task(self: Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting expiry reaper task (check every {}s)",
            interval_secs
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                if let Err(e) = self.reap_expired_at(Utc::now()).await {
                    warn!("Expiry sweep failed: {}", e);
                }
            }
        })
    }

    fn owner_view(&self, session: Session) -> OwnerSessionView {
        let secret_kind = self.profiles.get(session.family).secret_env.clone();
        OwnerSessionView::new(session, &self.public_host, &secret_kind)
    }

    async fn get_authorized(
        &self,
        actor: &User,
        session_id: &str,
    ) -> Result<Session, OrchestratorError> {
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;

        if !actor.is_admin && session.user_id != actor.id {
            return Err(OrchestratorError::Forbidden(
                "session belongs to another user".to_string(),
            ));
        }

        Ok(session)
    }
}

/// A single session as seen by its owner or by an administrator.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum SessionDetails {
    Owner(OwnerSessionView),
    Admin(Session),
}

/// `<family>-<user segment>-<8 hex>`.
pub fn container_name(family: SessionFamily, segment: &str) -> String {
    let segment: String = segment.chars().take(MAX_NAME_SEGMENT).collect();
    let suffix: [u8; 4] = rand::random();
    format!("{}-{}-{}", family, segment, hex::encode(suffix))
}
