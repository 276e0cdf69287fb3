//! Admin-only handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use tracing::{info, instrument};

use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::auth::RequireAdmin;
use crate::session::{ReapReport, Session};
use crate::user::User;

/// Every session, without secrets.
#[instrument(skip(state, _admin))]
pub async fn admin_list_sessions(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.sessions.list_all().await?))
}

/// Every registered user.
#[instrument(skip(state, _admin))]
pub async fn admin_list_users(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(state.users.list().await?))
}

/// Stop any session, including a retry of a failed stop.
#[instrument(skip(state, admin), fields(admin_id = %admin.id()))]
pub async fn admin_stop_session(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    let session = state.sessions.stop(&admin.user, &session_id).await?;
    info!(status = %session.status, "Admin stop requested");
    Ok(Json(session))
}

/// Delete a terminal session row.
#[instrument(skip(state, admin), fields(admin_id = %admin.id()))]
pub async fn admin_delete_session(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.sessions.delete(&admin.user, &session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run an expiry sweep now.
#[instrument(skip(state, admin), fields(admin_id = %admin.id()))]
pub async fn admin_reap(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
) -> ApiResult<Json<ReapReport>> {
    let report = state.sessions.reap_expired_at(Utc::now()).await?;
    info!(
        attempted = report.attempted,
        reclaimed = report.reclaimed,
        failed = report.failed,
        "Manual expiry sweep"
    );
    Ok(Json(report))
}
