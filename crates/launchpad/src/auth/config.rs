//! Authentication configuration.

use serde::{Deserialize, Serialize};

/// Authentication configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret shared with the token issuer.
    ///
    /// `env:VAR_NAME` reads the secret from the environment.
    pub jwt_secret: Option<String>,
    /// Emails that are always treated as administrators.
    pub admin_emails: Vec<String>,
    /// Allowed CORS origins.
    pub allowed_origins: Vec<String>,
}

impl AuthConfig {
    /// Resolve the `env:` form of `jwt_secret`.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>, String> {
        match self.jwt_secret.as_deref() {
            None => Ok(None),
            Some(value) => match value.strip_prefix("env:") {
                Some(var) => std::env::var(var)
                    .map(Some)
                    .map_err(|_| format!("environment variable {} is not set", var)),
                None => Ok(Some(value.to_string())),
            },
        }
    }

    /// Check the configuration is usable for serving requests.
    pub fn validate(&self) -> Result<(), String> {
        match self.resolve_jwt_secret()? {
            None => Err("auth.jwt_secret must be set".to_string()),
            Some(secret) if secret.len() < 32 => {
                Err("auth.jwt_secret must be at least 32 characters".to_string())
            }
            Some(_) => Ok(()),
        }
    }

    pub fn is_admin_email(&self, email: &str) -> bool {
        self.admin_emails
            .iter()
            .any(|admin| admin.eq_ignore_ascii_case(email.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_secret_is_used_as_is() {
        let config = AuthConfig {
            jwt_secret: Some("x".repeat(40)),
            ..Default::default()
        };
        assert_eq!(config.resolve_jwt_secret().unwrap(), Some("x".repeat(40)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_or_short_secret_fails_validation() {
        assert!(AuthConfig::default().validate().is_err());
        let short = AuthConfig {
            jwt_secret: Some("short".to_string()),
            ..Default::default()
        };
        assert!(short.validate().is_err());
    }

    #[test]
    fn unset_env_secret_is_an_error() {
        let config = AuthConfig {
            jwt_secret: Some("env:LAUNCHPAD_TEST_SECRET_THAT_IS_NOT_SET".to_string()),
            ..Default::default()
        };
        assert!(config.resolve_jwt_secret().is_err());
    }

    #[test]
    fn admin_emails_match_case_insensitively() {
        let config = AuthConfig {
            admin_emails: vec!["Admin@Uni.edu".to_string()],
            ..Default::default()
        };
        assert!(config.is_admin_email("admin@uni.edu"));
        assert!(!config.is_admin_email("alice@uni.edu"));
    }
}
