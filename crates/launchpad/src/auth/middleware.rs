//! Identity token checks for the protected API.
//!
//! Tokens are issued upstream after the one-time-password gate. Here they
//! are only verified, and the caller is registered on every request.

use axum::{
    extract::{FromRequestParts, State},
    http::{
        HeaderMap,
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
    },
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use log::{debug, warn};
use std::sync::Arc;

use super::{AuthConfig, AuthError, Claims};
use crate::user::{User, UserRepository};

/// Cookie checked when no Authorization header is sent.
const AUTH_COOKIE: &str = "auth_token";

/// `Bearer <token>`, scheme matched case-insensitively, nothing after the token.
fn parse_bearer(value: &str) -> Result<&str, AuthError> {
    let words: Vec<&str> = value.split_whitespace().collect();
    match words.as_slice() {
        [scheme, token] if scheme.eq_ignore_ascii_case("bearer") => Ok(*token),
        _ => Err(AuthError::InvalidAuthHeader),
    }
}

fn cookie_value<'a>(cookies: &'a str, wanted: &str) -> Option<&'a str> {
    cookies
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim() == wanted)
        .map(|(_, value)| value.trim())
}

/// The raw token, preferring the Authorization header over the cookie.
///
/// A present but malformed header is an error even if the cookie is set.
fn token_from_headers(headers: &HeaderMap) -> Result<&str, AuthError> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        let value = value.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
        return parse_bearer(value);
    }

    headers
        .get(COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookies| cookie_value(cookies, AUTH_COOKIE))
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingAuthHeader)
}

/// Verifies identity tokens and keeps the user registry current.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    decoding_key: Option<DecodingKey>,
    users: UserRepository,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("admin_emails", &self.config.admin_emails)
            .field("has_key", &self.decoding_key.is_some())
            .finish()
    }
}

impl AuthState {
    /// An `env:VAR` secret is resolved here, once. Without a usable secret
    /// every token is refused.
    pub fn new(mut config: AuthConfig, users: UserRepository) -> Self {
        match config.resolve_jwt_secret() {
            Ok(secret) => config.jwt_secret = secret,
            Err(e) => {
                warn!("JWT secret unavailable: {}", e);
                config.jwt_secret = None;
            }
        }

        let decoding_key = config
            .jwt_secret
            .as_deref()
            .map(|secret| DecodingKey::from_secret(secret.as_bytes()));

        Self {
            config: Arc::new(config),
            decoding_key,
            users,
        }
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    /// Check signature and expiry, and require a subject and an email.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let Some(key) = self.decoding_key.as_ref() else {
            return Err(AuthError::Internal("no JWT secret configured".to_string()));
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_nbf = false;

        let claims = match decode::<Claims>(token, key, &validation) {
            Ok(data) => data.claims,
            Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => {
                debug!("Rejected expired identity token");
                return Err(AuthError::TokenExpired);
            }
            Err(e) => {
                warn!("Rejected identity token: {:?}", e.kind());
                return Err(AuthError::InvalidToken(e.to_string()));
            }
        };

        if claims.sub.trim().is_empty() || claims.email.trim().is_empty() {
            return Err(AuthError::InvalidToken(
                "token is missing subject or email".to_string(),
            ));
        }

        Ok(claims)
    }

    /// Register the caller and resolve the effective admin flag.
    pub async fn register(&self, claims: &Claims) -> Result<User, AuthError> {
        let is_admin = claims.admin || self.config.is_admin_email(&claims.email);
        self.users
            .upsert_login(&claims.sub, claims.email.trim(), is_admin)
            .await
            .map_err(|e| AuthError::Internal(format!("{:#}", e)))
    }
}

/// The verified caller, placed in request extensions by `auth_middleware`.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub claims: Claims,
    /// Registry row as of this request.
    pub user: User,
}

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.user.id
    }

    pub fn is_admin(&self) -> bool {
        self.user.is_admin
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

/// Verify the caller's token, register them and attach `CurrentUser`.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let claims = auth.validate_token(token_from_headers(req.headers())?)?;
    let user = auth.register(&claims).await?;
    debug!("Authenticated user {} (admin: {})", user.id, user.is_admin);

    req.extensions_mut().insert(CurrentUser { claims, user });
    Ok(next.run(req).await)
}

/// Extractor that only succeeds for administrators.
#[derive(Debug, Clone)]
pub struct RequireAdmin(pub CurrentUser);

impl<S> FromRequestParts<S> for RequireAdmin
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let caller = CurrentUser::from_request_parts(parts, state).await?;
        if caller.is_admin() {
            Ok(RequireAdmin(caller))
        } else {
            Err(AuthError::InsufficientPermissions(
                "administrator access required".to_string(),
            ))
        }
    }
}
