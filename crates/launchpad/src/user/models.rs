//! User data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// User entity from database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub is_admin: bool,
    /// Affiliation; unset until the user picks one.
    pub lab_name: Option<String>,
    pub created_at: String,
    pub last_login_at: Option<String>,
}

/// Request to set the caller's affiliation.
#[derive(Debug, Clone, Deserialize)]
pub struct AffiliationRequest {
    pub lab_name: String,
}
