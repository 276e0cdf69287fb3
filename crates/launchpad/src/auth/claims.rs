//! Identity token claims.

use serde::{Deserialize, Serialize};

/// Claims carried by the upstream identity token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Stable user id.
    pub sub: String,
    pub email: String,
    /// Administrator flag asserted by the issuer.
    #[serde(default)]
    pub admin: bool,
    /// Expiry (seconds since the epoch).
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    pub fn new(sub: impl Into<String>, email: impl Into<String>, admin: bool, exp: i64) -> Self {
        Self {
            sub: sub.into(),
            email: email.into(),
            admin,
            exp,
            iat: None,
        }
    }
}
