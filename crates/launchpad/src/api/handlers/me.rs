//! Caller profile handlers.

use axum::{Json, extract::State};
use serde::Serialize;
use tracing::{info, instrument};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::CurrentUser;
use crate::session::CapacityReport;
use crate::user::{AffiliationRequest, User};

#[derive(Debug, Serialize)]
pub struct MeResponse {
    #[serde(flatten)]
    pub user: User,
    /// Affiliations the caller may choose from.
    pub labs: Vec<String>,
}

/// The authenticated caller.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn get_me(State(state): State<AppState>, user: CurrentUser) -> Json<MeResponse> {
    Json(MeResponse {
        user: user.user,
        labs: state.labs.as_ref().clone(),
    })
}

/// Set the caller's affiliation.
#[instrument(skip(state, user, request), fields(user_id = %user.id()))]
pub async fn set_affiliation(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<AffiliationRequest>,
) -> ApiResult<Json<User>> {
    let lab_name = request.lab_name.trim();
    if lab_name.is_empty() {
        return Err(ApiError::bad_request("lab_name must not be empty"));
    }
    if !state.labs.is_empty() && !state.labs.iter().any(|lab| lab == lab_name) {
        return Err(ApiError::bad_request(format!(
            "unknown lab: {}",
            lab_name
        )));
    }

    let updated = state
        .users
        .set_affiliation(user.id(), lab_name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("user {}", user.id())))?;

    info!(lab = %lab_name, "Affiliation updated");
    Ok(Json(updated))
}

/// Current usage against the concurrency ceiling.
#[instrument(skip(state, _user))]
pub async fn get_capacity(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ApiResult<Json<CapacityReport>> {
    Ok(Json(state.sessions.capacity().await?))
}
