//! Unified API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::session::{OrchestratorError, Rejection};

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Gateway error: {0}")]
    BadGateway(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    /// A launch turned away by admission control.
    #[error("{0}")]
    Rejected(Rejection),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Rejected(rejection) if rejection.is_retryable() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Rejected(_) => StatusCode::CONFLICT,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::BadGateway(_) => "BAD_GATEWAY",
            Self::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            Self::Rejected(Rejection::ActiveSession { .. }) => "ACTIVE_SESSION",
            Self::Rejected(Rejection::Capacity { .. }) => "CAPACITY_REACHED",
            Self::Rejected(Rejection::NoAvailablePorts) => "NO_AVAILABLE_PORTS",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) | ApiError::BadGateway(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) | ApiError::GatewayTimeout(msg) => {
                warn!(error_code = code, message = %msg, "Service unavailable");
            }
            _ => {
                tracing::debug!(error_code = code, message = %message, "Client error");
            }
        }

        let details = match &self {
            ApiError::Rejected(rejection) => serde_json::to_value(rejection).ok(),
            _ => None,
        };

        let body = ErrorResponse {
            error: message,
            code,
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Plain database failures.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::Rejected(rejection) => ApiError::Rejected(rejection),
            OrchestratorError::SessionNotFound(_) => ApiError::NotFound(message),
            OrchestratorError::Forbidden(_) => ApiError::Forbidden(message),
            OrchestratorError::InvalidState { .. } => ApiError::Conflict(message),
            OrchestratorError::InvalidRequest(_) => ApiError::BadRequest(message),
            OrchestratorError::RuntimeLaunchFailed(_) | OrchestratorError::RuntimeStopFailed(_) => {
                ApiError::BadGateway(message)
            }
            OrchestratorError::RuntimeTimeout(_) => ApiError::GatewayTimeout(message),
            OrchestratorError::RuntimeUnavailable(_) => ApiError::ServiceUnavailable(message),
            OrchestratorError::WorkspaceUnavailable { .. }
            | OrchestratorError::StoreInconsistency(_)
            | OrchestratorError::Store(_) => ApiError::Internal(message),
        }
    }
}

/// Convert auth errors to API errors.
impl From<crate::auth::AuthError> for ApiError {
    fn from(err: crate::auth::AuthError) -> Self {
        use crate::auth::AuthError;
        match err {
            AuthError::MissingAuthHeader | AuthError::InvalidAuthHeader => {
                ApiError::Unauthorized("Missing or invalid authorization".to_string())
            }
            AuthError::InvalidToken(msg) => {
                ApiError::Unauthorized(format!("Invalid token: {}", msg))
            }
            AuthError::TokenExpired => ApiError::Unauthorized("Token expired".to_string()),
            AuthError::InsufficientPermissions(msg) => ApiError::Forbidden(msg),
            AuthError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;

    #[test]
    fn rejections_map_to_conflict_or_unavailable() {
        let active: ApiError = OrchestratorError::Rejected(Rejection::ActiveSession {
            status: SessionStatus::Running,
        })
        .into();
        assert_eq!(active.status_code(), StatusCode::CONFLICT);
        assert_eq!(active.error_code(), "ACTIVE_SESSION");

        let capacity: ApiError = OrchestratorError::Rejected(Rejection::Capacity {
            in_use: 2,
            ceiling: 2,
        })
        .into();
        assert_eq!(capacity.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let ports: ApiError = OrchestratorError::Rejected(Rejection::NoAvailablePorts).into();
        assert_eq!(ports.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ports.error_code(), "NO_AVAILABLE_PORTS");
    }

    #[test]
    fn runtime_failures_map_to_gateway_codes() {
        let failed: ApiError = OrchestratorError::RuntimeLaunchFailed("boom".into()).into();
        assert_eq!(failed.status_code(), StatusCode::BAD_GATEWAY);

        let timeout: ApiError = OrchestratorError::RuntimeTimeout("slow".into()).into();
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);

        let missing: ApiError = OrchestratorError::SessionNotFound("abc".into()).into();
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let inconsistent: ApiError = OrchestratorError::StoreInconsistency("x".into()).into();
        assert_eq!(
            inconsistent.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
