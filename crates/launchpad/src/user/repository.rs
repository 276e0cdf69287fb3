//! User repository for database operations.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::User;
use crate::db::timestamp;

const USER_COLUMNS: &str = "id, email, is_admin, lab_name, created_at, last_login_at";

/// Repository for user database operations.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register or refresh a user from validated identity claims.
    ///
    /// Touches `last_login_at` and refreshes the email and admin flag.
    #[instrument(skip(self), fields(user_id = %id))]
    pub async fn upsert_login(&self, id: &str, email: &str, is_admin: bool) -> Result<User> {
        let now = timestamp(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO users (id, email, is_admin, created_at, last_login_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                is_admin = excluded.is_admin,
                last_login_at = excluded.last_login_at
            "#,
        )
        .bind(id)
        .bind(email)
        .bind(is_admin)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("registering user")?;

        debug!("user login recorded");
        self.get(id)
            .await?
            .with_context(|| format!("user {} missing after upsert", id))
    }

    /// Get a user by ID.
    pub async fn get(&self, id: &str) -> Result<Option<User>> {
        let query = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
        let user = sqlx::query_as::<_, User>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching user")?;

        Ok(user)
    }

    /// List all users ordered by email.
    pub async fn list(&self) -> Result<Vec<User>> {
        let query = format!("SELECT {} FROM users ORDER BY email", USER_COLUMNS);
        let users = sqlx::query_as::<_, User>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing users")?;

        Ok(users)
    }

    /// Set a user's affiliation. Returns the updated user, if it exists.
    #[instrument(skip(self))]
    pub async fn set_affiliation(&self, id: &str, lab_name: &str) -> Result<Option<User>> {
        let result = sqlx::query("UPDATE users SET lab_name = ? WHERE id = ?")
            .bind(lab_name)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating user affiliation")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .context("counting users")?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn repo() -> UserRepository {
        let db = Database::in_memory().await.unwrap();
        UserRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn upsert_creates_then_refreshes() {
        let repo = repo().await;
        let first = repo.upsert_login("u1", "alice@uni.edu", false).await.unwrap();
        assert!(!first.is_admin);
        assert!(first.lab_name.is_none());

        let second = repo.upsert_login("u1", "alice@uni.edu", true).await.unwrap();
        assert!(second.is_admin);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn affiliation_is_kept_across_logins() {
        let repo = repo().await;
        repo.upsert_login("u1", "alice@uni.edu", false).await.unwrap();
        let updated = repo.set_affiliation("u1", "Genomics").await.unwrap().unwrap();
        assert_eq!(updated.lab_name.as_deref(), Some("Genomics"));

        let again = repo.upsert_login("u1", "alice@uni.edu", false).await.unwrap();
        assert_eq!(again.lab_name.as_deref(), Some("Genomics"));
        assert!(repo.set_affiliation("nobody", "Genomics").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_ordered_by_email() {
        let repo = repo().await;
        repo.upsert_login("u2", "zed@uni.edu", false).await.unwrap();
        repo.upsert_login("u1", "amy@uni.edu", false).await.unwrap();
        let emails: Vec<_> = repo
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.email)
            .collect();
        assert_eq!(emails, vec!["amy@uni.edu", "zed@uni.edu"]);
    }
}
