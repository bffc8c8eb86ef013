//! Sync control API handlers.

use axum::extract::State;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{respond, session_owner, ApiResult};
use crate::sync::{SyncReport, SyncStatus};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResult {
    pub requeued: u64,
}

/// GET /api/sync/status - Pending and failed counts for the active tenant.
pub async fn get_sync_status(State(state): State<AppState>) -> ApiResult<SyncStatus> {
    respond(&state, async {
        let owner_id = session_owner(&state)?;
        let counts = state
            .store
            .sync_counts(&owner_id, state.coordinator.max_attempts())
            .await?;
        let mut status = state.coordinator.status();
        status.pending = counts.pending;
        status.failed = counts.failed;
        Ok(status)
    })
    .await
}

/// POST /api/sync - Run a pass now and report what it did.
pub async fn force_sync(State(state): State<AppState>) -> ApiResult<SyncReport> {
    respond(&state, async {
        session_owner(&state)?;
        state.coordinator.run_pass(&CancellationToken::new()).await
    })
    .await
}

/// POST /api/sync/retry - Re-queue records that hit the attempt ceiling.
pub async fn retry_failed(State(state): State<AppState>) -> ApiResult<RetryResult> {
    respond(&state, async {
        session_owner(&state)?;
        let requeued = state.coordinator.retry_failed().await?;
        Ok(RetryResult { requeued })
    })
    .await
}
