//! Admission control: concurrency ceiling and the one-active-session rule.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{OrchestratorError, Rejection};
use super::models::{NewSession, ResourceEnvelope, Session, SessionFamily, SessionSecret};
use super::ports::{self, PortRange};
use super::store::SessionStore;
use crate::db::timestamp;

/// Which sessions count towards a user's single active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveScope {
    /// One active session per user across all families.
    #[default]
    Global,
    /// One active session per user and family.
    PerFamily,
}

/// Everything needed to reserve a row.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub user_id: String,
    pub family: SessionFamily,
    pub port_range: PortRange,
    pub container_name: String,
    pub envelope: ResourceEnvelope,
}

#[derive(Debug, Clone)]
pub enum AdmissionDecision {
    /// The `requested` row now exists and holds its port.
    Admitted(Session),
    /// Nothing was written.
    Rejected(Rejection),
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    store: SessionStore,
    ceiling: i64,
    scope: ActiveScope,
}

impl AdmissionController {
    pub fn new(store: SessionStore, ceiling: i64, scope: ActiveScope) -> Self {
        Self {
            store,
            ceiling,
            scope,
        }
    }

    pub fn ceiling(&self) -> i64 {
        self.ceiling
    }

    pub fn scope(&self) -> ActiveScope {
        self.scope
    }

    /// Check the rules and reserve a port and row in one unit of work.
    pub async fn admit(
        &self,
        request: AdmissionRequest,
    ) -> Result<AdmissionDecision, OrchestratorError> {
        let mut tx = self.store.begin_admission().await?;

        let scope_family = match self.scope {
            ActiveScope::Global => None,
            ActiveScope::PerFamily => Some(request.family),
        };
        if let Some(existing) = tx.active_for_user(&request.user_id, scope_family).await? {
            log::info!(
                "Admission rejected for user {}: session {} is {}",
                request.user_id,
                existing.id,
                existing.status
            );
            return Ok(AdmissionDecision::Rejected(Rejection::ActiveSession {
                status: existing.status,
            }));
        }

        let in_use = tx.count_active().await?;
        if in_use >= self.ceiling {
            log::info!(
                "Admission rejected for user {}: {} of {} sessions in use",
                request.user_id,
                in_use,
                self.ceiling
            );
            return Ok(AdmissionDecision::Rejected(Rejection::Capacity {
                in_use,
                ceiling: self.ceiling,
            }));
        }

        let held = tx.held_ports().await?;
        let port = match ports::allocate(request.port_range, &held) {
            Ok(port) => port,
            Err(exhausted) => {
                log::info!(
                    "Admission rejected for user {}: {}",
                    request.user_id,
                    exhausted
                );
                return Ok(AdmissionDecision::Rejected(Rejection::NoAvailablePorts));
            }
        };

        let new_session = NewSession {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            family: request.family,
            port,
            container_name: request.container_name,
            secret: SessionSecret::generate(),
            envelope: request.envelope,
            created_at: timestamp(Utc::now()),
        };

        tx.insert_requested(&new_session).await?;
        tx.commit().await?;

        log::info!(
            "Admitted {} session {} for user {} on port {}",
            new_session.family,
            new_session.id,
            new_session.user_id,
            new_session.port
        );
        Ok(AdmissionDecision::Admitted(new_session.into_requested()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::session::models::SessionStatus;

    async fn controller(ceiling: i64, scope: ActiveScope) -> AdmissionController {
        let db = Database::in_memory().await.unwrap();
        for (id, email) in [("u1", "alice@uni.edu"), ("u2", "bob@uni.edu")] {
            sqlx::query("INSERT INTO users (id, email, is_admin, created_at) VALUES (?, ?, 0, ?)")
                .bind(id)
                .bind(email)
                .bind(timestamp(Utc::now()))
                .execute(db.pool())
                .await
                .unwrap();
        }
        AdmissionController::new(SessionStore::new(db.pool().clone()), ceiling, scope)
    }

    fn request(user_id: &str, family: SessionFamily, name: &str) -> AdmissionRequest {
        AdmissionRequest {
            user_id: user_id.to_string(),
            family,
            port_range: PortRange::new(9002, 9010),
            container_name: name.to_string(),
            envelope: ResourceEnvelope {
                memory_limit: "16g".to_string(),
                cpu_limit: "2.0".to_string(),
                storage_limit: None,
                lifetime_days: 7,
            },
        }
    }

    #[tokio::test]
    async fn global_scope_blocks_second_family() {
        let admission = controller(10, ActiveScope::Global).await;
        let first = admission
            .admit(request("u1", SessionFamily::Rstudio, "rstudio-alice-00000001"))
            .await
            .unwrap();
        assert!(matches!(first, AdmissionDecision::Admitted(_)));

        let second = admission
            .admit(request("u1", SessionFamily::Jupyter, "jupyter-alice-00000002"))
            .await
            .unwrap();
        match second {
            AdmissionDecision::Rejected(Rejection::ActiveSession { status }) => {
                assert_eq!(status, SessionStatus::Requested)
            }
            other => panic!("expected active-session rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn per_family_scope_allows_one_of_each() {
        let admission = controller(10, ActiveScope::PerFamily).await;
        for (family, name) in [
            (SessionFamily::Rstudio, "rstudio-alice-00000001"),
            (SessionFamily::Jupyter, "jupyter-alice-00000002"),
        ] {
            let decision = admission.admit(request("u1", family, name)).await.unwrap();
            assert!(matches!(decision, AdmissionDecision::Admitted(_)));
        }

        let third = admission
            .admit(request("u1", SessionFamily::Rstudio, "rstudio-alice-00000003"))
            .await
            .unwrap();
        assert!(matches!(
            third,
            AdmissionDecision::Rejected(Rejection::ActiveSession { .. })
        ));
    }

    #[tokio::test]
    async fn admitted_rows_take_distinct_ports() {
        let admission = controller(10, ActiveScope::Global).await;
        let a = admission
            .admit(request("u1", SessionFamily::Rstudio, "rstudio-alice-00000001"))
            .await
            .unwrap();
        let b = admission
            .admit(request("u2", SessionFamily::Rstudio, "rstudio-bob-00000002"))
            .await
            .unwrap();
        match (a, b) {
            (AdmissionDecision::Admitted(a), AdmissionDecision::Admitted(b)) => {
                assert_eq!(a.port, 9002);
                assert_eq!(b.port, 9003);
            }
            other => panic!("expected two admissions, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_ceiling_rejects_everything() {
        let admission = controller(0, ActiveScope::Global).await;
        let decision = admission
            .admit(request("u1", SessionFamily::Rstudio, "rstudio-alice-00000001"))
            .await
            .unwrap();
        assert!(matches!(
            decision,
            AdmissionDecision::Rejected(Rejection::Capacity {
                in_use: 0,
                ceiling: 0
            })
        ));
    }
}
