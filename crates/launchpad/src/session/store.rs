//! Session database store.
//!
//! Every status change is a conditional UPDATE guarded by the expected
//! source status. A `false` return means the row was not in that status
//! and nothing was written.

use anyhow::{Context, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::models::{
    ACTIVE_STATUSES_SQL, NewSession, PORT_HOLDING_STATUSES_SQL, Session, SessionFamily,
    SessionStatus, TERMINAL_STATUSES_SQL,
};

/// All session columns for SELECT queries.
const SESSION_COLUMNS: &str = r#"
    id, user_id, family, port, container_name, container_id, secret, status,
    memory_limit, cpu_limit, storage_limit, lifetime_days,
    created_at, expires_at, stopped_at, error_message
"#;

/// Store for session rows.
#[derive(Debug, Clone)]
pub struct SessionStore {
    pool: SqlitePool,
    /// Serializes count-then-insert and destructive transitions.
    write_lock: Arc<Mutex<()>>,
}

/// Open admission unit of work.
///
/// Holds the store write lock and a transaction until committed or dropped.
/// Dropping without `commit` rolls back.
pub struct AdmissionTx {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl AdmissionTx {
    /// Most recent active session for a user, optionally limited to one family.
    pub async fn active_for_user(
        &mut self,
        user_id: &str,
        family: Option<SessionFamily>,
    ) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE user_id = ?1 AND status IN {} \
             AND (?2 IS NULL OR family = ?2) ORDER BY created_at DESC LIMIT 1",
            SESSION_COLUMNS, ACTIVE_STATUSES_SQL
        );
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(user_id)
            .bind(family.map(|f| f.as_str()))
            .fetch_optional(&mut *self.tx)
            .await
            .context("checking for active session")?;

        Ok(session)
    }

    /// Number of active sessions across all users.
    pub async fn count_active(&mut self) -> Result<i64> {
        let query = format!(
            "SELECT COUNT(*) FROM sessions WHERE status IN {}",
            ACTIVE_STATUSES_SQL
        );
        let count = sqlx::query_scalar::<_, i64>(&query)
            .fetch_one(&mut *self.tx)
            .await
            .context("counting active sessions")?;

        Ok(count)
    }

    /// Ports held by sessions of every family, including failed stops.
    pub async fn held_ports(&mut self) -> Result<HashSet<u16>> {
        let query = format!(
            "SELECT port FROM sessions WHERE status IN {}",
            PORT_HOLDING_STATUSES_SQL
        );
        let ports = sqlx::query_scalar::<_, i64>(&query)
            .fetch_all(&mut *self.tx)
            .await
            .context("listing held ports")?;

        Ok(ports
            .into_iter()
            .filter_map(|p| u16::try_from(p).ok())
            .collect())
    }

    /// Insert the reserved row in `requested` status.
    pub async fn insert_requested(&mut self, session: &NewSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, user_id, family, port, container_name, secret, status,
                memory_limit, cpu_limit, storage_limit, lifetime_days, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'requested', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(session.family.as_str())
        .bind(i64::from(session.port))
        .bind(&session.container_name)
        .bind(session.secret.expose())
        .bind(&session.envelope.memory_limit)
        .bind(&session.envelope.cpu_limit)
        .bind(&session.envelope.storage_limit)
        .bind(session.envelope.lifetime_days)
        .bind(&session.created_at)
        .execute(&mut *self.tx)
        .await
        .context("reserving session row")?;

        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        let AdmissionTx { tx, _guard } = self;
        tx.commit().await.context("committing admission")?;
        Ok(())
    }
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open the admission unit of work.
    pub async fn begin_admission(&self) -> Result<AdmissionTx> {
        let guard = Arc::clone(&self.write_lock).lock_owned().await;
        let tx = self
            .pool
            .begin()
            .await
            .context("starting admission transaction")?;

        Ok(AdmissionTx { tx, _guard: guard })
    }

    /// `requested` → `running`.
    pub async fn finalize_running(
        &self,
        id: &str,
        container_id: &str,
        expires_at: &str,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'running', container_id = ?, expires_at = ?, error_message = NULL
            WHERE id = ? AND status = 'requested'
            "#,
        )
        .bind(container_id)
        .bind(expires_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session running")?;

        Ok(result.rows_affected() == 1)
    }

    /// `requested` → `error`.
    pub async fn finalize_error(&self, id: &str, message: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'error', error_message = ?
            WHERE id = ? AND status = 'requested'
            "#,
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session failed")?;

        Ok(result.rows_affected() == 1)
    }

    /// `running` or `error_stopping` → `stopping`.
    pub async fn begin_stop(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'stopping'
            WHERE id = ? AND status IN ('running', 'error_stopping')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session stopping")?;

        Ok(result.rows_affected() == 1)
    }

    /// `stopping` → `stopped` or `stopped_expired`.
    pub async fn finalize_stopped(
        &self,
        id: &str,
        stopped_at: &str,
        via_expiry: bool,
    ) -> Result<bool> {
        let status = if via_expiry {
            SessionStatus::StoppedExpired
        } else {
            SessionStatus::Stopped
        };

        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, stopped_at = ?, container_id = NULL, error_message = NULL
            WHERE id = ? AND status = 'stopping'
            "#,
        )
        .bind(status.as_str())
        .bind(stopped_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session stopped")?;

        Ok(result.rows_affected() == 1)
    }

    /// `stopping` → `error_stopping`. The container id is kept for retries.
    pub async fn finalize_stop_failed(&self, id: &str, message: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'error_stopping', error_message = ?
            WHERE id = ? AND status = 'stopping'
            "#,
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session stop failure")?;

        Ok(result.rows_affected() == 1)
    }

    /// Ports published by running sessions.
    pub async fn list_running_ports(&self) -> Result<Vec<u16>> {
        let ports = sqlx::query_scalar::<_, i64>(
            "SELECT port FROM sessions WHERE status = 'running' ORDER BY port",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing running ports")?;

        Ok(ports
            .into_iter()
            .filter_map(|p| u16::try_from(p).ok())
            .collect())
    }

    /// Running sessions whose expiry is at or before `now`.
    pub async fn list_expired(&self, now: &str) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE status = 'running' AND expires_at IS NOT NULL \
             AND expires_at <= ? ORDER BY expires_at",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .context("listing expired sessions")?;

        Ok(sessions)
    }

    pub async fn count_running(&self) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await
                .context("counting running sessions")?;

        Ok(count)
    }

    pub async fn count_active(&self) -> Result<i64> {
        let query = format!(
            "SELECT COUNT(*) FROM sessions WHERE status IN {}",
            ACTIVE_STATUSES_SQL
        );
        let count = sqlx::query_scalar::<_, i64>(&query)
            .fetch_one(&self.pool)
            .await
            .context("counting active sessions")?;

        Ok(count)
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let query = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        Ok(session)
    }

    /// List all sessions, newest first.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions ORDER BY created_at DESC",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions")?;

        Ok(sessions)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE user_id = ? ORDER BY created_at DESC",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions for user")?;

        Ok(sessions)
    }

    /// Delete a session that is no longer active.
    pub async fn delete_terminal(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let query = format!(
            "DELETE FROM sessions WHERE id = ? AND status IN {}",
            TERMINAL_STATUSES_SQL
        );
        let result = sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(result.rows_affected() == 1)
    }

    /// Settle rows left mid-transition by a previous process.
    ///
    /// `requested` becomes `error` and `stopping` becomes `error_stopping`.
    /// Returns the number of rows changed for each.
    pub async fn recover_interrupted(&self) -> Result<(u64, u64)> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .context("starting recovery transaction")?;

        let launches = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'error', error_message = 'launch interrupted by restart'
            WHERE status = 'requested'
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("recovering interrupted launches")?
        .rows_affected();

        let stops = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'error_stopping', error_message = 'stop interrupted by restart'
            WHERE status = 'stopping'
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("recovering interrupted stops")?
        .rows_affected();

        tx.commit().await.context("committing recovery")?;
        Ok((launches, stops))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, timestamp};
    use crate::session::models::{ResourceEnvelope, SessionSecret};
    use chrono::Utc;

    async fn store_with_user() -> SessionStore {
        let db = Database::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO users (id, email, is_admin, created_at) VALUES ('u1', 'alice@uni.edu', 0, ?)",
        )
        .bind(timestamp(Utc::now()))
        .execute(db.pool())
        .await
        .unwrap();
        SessionStore::new(db.pool().clone())
    }

    fn new_session(id: &str, port: u16) -> NewSession {
        NewSession {
            id: id.to_string(),
            user_id: "u1".to_string(),
            family: SessionFamily::Rstudio,
            port,
            container_name: format!("rstudio-alice-{id}"),
            secret: SessionSecret::generate(),
            envelope: ResourceEnvelope {
                memory_limit: "16g".to_string(),
                cpu_limit: "2.0".to_string(),
                storage_limit: None,
                lifetime_days: 7,
            },
            created_at: timestamp(Utc::now()),
        }
    }

    async fn reserve(store: &SessionStore, session: &NewSession) {
        let mut tx = store.begin_admission().await.unwrap();
        tx.insert_requested(session).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn transitions_are_guarded_by_source_status() {
        let store = store_with_user().await;
        reserve(&store, &new_session("s1", 9002)).await;

        assert!(!store.begin_stop("s1").await.unwrap());
        assert!(
            store
                .finalize_running("s1", "0123456789ab", "2030-01-01T00:00:00.000Z")
                .await
                .unwrap()
        );
        assert!(!store.finalize_error("s1", "late").await.unwrap());
        assert!(store.begin_stop("s1").await.unwrap());
        assert!(
            store
                .finalize_stopped("s1", "2026-01-02T00:00:00.000Z", false)
                .await
                .unwrap()
        );

        let session = store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);
        assert!(session.container_id.is_none());
        assert!(session.stopped_at.is_some());
    }

    #[tokio::test]
    async fn dropped_admission_rolls_back() {
        let store = store_with_user().await;
        {
            let mut tx = store.begin_admission().await.unwrap();
            tx.insert_requested(&new_session("s1", 9002)).await.unwrap();
        }
        assert!(store.get("s1").await.unwrap().is_none());
        assert_eq!(store.count_active().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn held_ports_include_requested_rows() {
        let store = store_with_user().await;
        reserve(&store, &new_session("s1", 9002)).await;

        let mut tx = store.begin_admission().await.unwrap();
        let held = tx.held_ports().await.unwrap();
        assert!(held.contains(&9002));
        assert_eq!(tx.count_active().await.unwrap(), 1);
        let active = tx
            .active_for_user("u1", Some(SessionFamily::Jupyter))
            .await
            .unwrap();
        assert!(active.is_none());
        let active = tx.active_for_user("u1", None).await.unwrap();
        assert_eq!(active.map(|s| s.id), Some("s1".to_string()));
        drop(tx);

        assert!(store.list_running_ports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_stop_keeps_port_held_and_undeletable() {
        let store = store_with_user().await;
        reserve(&store, &new_session("s1", 9002)).await;
        store
            .finalize_running("s1", "0123456789ab", "2030-01-01T00:00:00.000Z")
            .await
            .unwrap();
        assert!(store.begin_stop("s1").await.unwrap());
        assert!(store.finalize_stop_failed("s1", "device busy").await.unwrap());

        let mut tx = store.begin_admission().await.unwrap();
        assert!(tx.held_ports().await.unwrap().contains(&9002));
        assert_eq!(tx.count_active().await.unwrap(), 0);
        assert!(tx.insert_requested(&new_session("s2", 9002)).await.is_err());
        drop(tx);

        assert!(!store.delete_terminal("s1").await.unwrap());
    }

    #[tokio::test]
    async fn active_port_is_unique() {
        let store = store_with_user().await;
        reserve(&store, &new_session("s1", 9002)).await;

        let mut tx = store.begin_admission().await.unwrap();
        assert!(tx.insert_requested(&new_session("s2", 9002)).await.is_err());
    }

    #[tokio::test]
    async fn delete_only_removes_terminal_rows() {
        let store = store_with_user().await;
        reserve(&store, &new_session("s1", 9002)).await;
        assert!(!store.delete_terminal("s1").await.unwrap());

        store.finalize_error("s1", "boom").await.unwrap();
        assert!(store.delete_terminal("s1").await.unwrap());
        assert!(store.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recover_interrupted_settles_transients() {
        let store = store_with_user().await;
        reserve(&store, &new_session("s1", 9002)).await;
        reserve(&store, &new_session("s2", 9003)).await;
        store
            .finalize_running("s2", "0123456789ab", "2030-01-01T00:00:00.000Z")
            .await
            .unwrap();
        store.begin_stop("s2").await.unwrap();

        assert_eq!(store.recover_interrupted().await.unwrap(), (1, 1));
        assert_eq!(
            store.get("s1").await.unwrap().unwrap().status,
            SessionStatus::Error
        );
        let s2 = store.get("s2").await.unwrap().unwrap();
        assert_eq!(s2.status, SessionStatus::ErrorStopping);
        assert_eq!(s2.container_id.as_deref(), Some("0123456789ab"));
    }

    #[tokio::test]
    async fn list_expired_compares_timestamps() {
        let store = store_with_user().await;
        reserve(&store, &new_session("s1", 9002)).await;
        store
            .finalize_running("s1", "0123456789ab", "2026-01-10T00:00:00.000Z")
            .await
            .unwrap();

        assert!(
            store
                .list_expired("2026-01-09T23:59:59.999Z")
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            store
                .list_expired("2026-01-10T00:00:00.000Z")
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.list_running_ports().await.unwrap(), vec![9002]);
        assert_eq!(store.count_running().await.unwrap(), 1);
    }
}
