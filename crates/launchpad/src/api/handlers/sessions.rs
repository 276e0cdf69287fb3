//! Session handlers for the authenticated caller.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::{info, instrument};

use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::auth::CurrentUser;
use crate::session::{CreateSessionRequest, OwnerSessionView, Session, SessionDetails};

/// List the caller's sessions.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn list_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<OwnerSessionView>>> {
    let sessions = state.sessions.list_for_user(&user.user).await?;
    Ok(Json(sessions))
}

/// Launch a new session.
#[instrument(skip(state, user, request), fields(user_id = %user.id(), family = %request.family))]
pub async fn create_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<OwnerSessionView>)> {
    let view = state.sessions.launch(&user.user, request).await?;
    info!(session_id = %view.session.id, port = view.session.port, "Session launched");
    Ok((StatusCode::CREATED, Json(view)))
}

/// Get one session. Owners see the access details.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn get_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionDetails>> {
    Ok(Json(state.sessions.get(&user.user, &session_id).await?))
}

/// Stop one of the caller's sessions.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn stop_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    let session = state.sessions.stop(&user.user, &session_id).await?;
    info!(status = %session.status, "Stop requested");
    Ok(Json(session))
}
