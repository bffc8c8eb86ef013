//! Invite API handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use super::{respond, ApiResult};
use crate::invite::JoinSummary;
use crate::models::{InviteCode, InviteValidation};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInviteRequest {
    pub driver_cloud_id: String,
    pub driver_name: String,
}

/// POST /api/invites - Issue a join code for a synced driver.
pub async fn create_invite(
    State(state): State<AppState>,
    Json(req): Json<CreateInviteRequest>,
) -> ApiResult<InviteCode> {
    respond(
        &state,
        state
            .invites
            .generate_code(&req.driver_cloud_id, &req.driver_name),
    )
    .await
}

/// GET /api/invites/{code} - Read-only validation of a code.
pub async fn validate_invite(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<InviteValidation> {
    respond(&state, state.invites.validate(&code)).await
}

/// POST /api/invites/{code}/confirm - Join the tenant and pull its reference data.
pub async fn confirm_invite(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<JoinSummary> {
    let result = state.invites.confirm(&code).await;
    if result.is_ok() {
        state.coordinator.request_sync();
    }
    respond(&state, async { result }).await
}
