//! Session and onboarding API handlers.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use super::{error, respond, success, ApiResult};
use crate::models::{LaunchRoute, OwnerProfile, Session};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session: Session,
    pub route: LaunchRoute,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSetupRequest {
    pub business_name: String,
    pub pin: String,
}

#[derive(Debug, Deserialize)]
pub struct PinLoginRequest {
    pub pin: String,
}

/// GET /api/session - Current session and where the app would route to.
pub async fn get_session(State(state): State<AppState>) -> ApiResult<SessionInfo> {
    let revision_id = state.store.get_revision_id().await.unwrap_or(0);

    match state.accounts.launch_route().await {
        Ok(route) => success(
            SessionInfo {
                session: state.scope.current(),
                route,
            },
            revision_id,
        ),
        Err(e) => error(e, revision_id),
    }
}

/// GET /api/launch - Startup route derived from the persisted preferences.
pub async fn get_launch_route(State(state): State<AppState>) -> ApiResult<LaunchRoute> {
    respond(&state, state.accounts.launch_route()).await
}

/// POST /api/owner/setup - First-launch owner onboarding.
pub async fn setup_owner(
    State(state): State<AppState>,
    Json(req): Json<OwnerSetupRequest>,
) -> ApiResult<OwnerProfile> {
    respond(&state, state.accounts.setup_owner(&req.business_name, &req.pin)).await
}

/// POST /api/session/owner - Owner PIN login.
pub async fn login_owner(
    State(state): State<AppState>,
    Json(req): Json<PinLoginRequest>,
) -> ApiResult<OwnerProfile> {
    let result = state.accounts.login_owner(&req.pin).await;
    if result.is_ok() {
        state.coordinator.request_sync();
    }
    respond(&state, async { result }).await
}

/// POST /api/session/logout - Clear the session and drop the tenant scope.
pub async fn logout(State(state): State<AppState>) -> ApiResult<Session> {
    let revision_id = state.store.get_revision_id().await.unwrap_or(0);
    state.accounts.logout();
    success(state.scope.current(), revision_id)
}
