//! REST API module.
//!
//! Device-local surface over the sync engine. Every handler answers with the
//! same envelope carrying the local store revision.

mod invites;
mod records;
mod session;
mod sync;

pub use invites::*;
pub use records::*;
pub use session::*;
pub use sync::*;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::errors::AppError;
use crate::models::{Driver, Session};
use crate::AppState;

/// Success response envelope.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
    pub revision_id: i64,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T, revision_id: i64) -> Self {
        Self {
            success: true,
            data,
            revision_id,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Response type that can be either success or error.
pub type ApiResult<T> = Result<ApiResponse<T>, crate::errors::AppErrorWithRevision>;

/// Create a successful API response.
pub fn success<T: Serialize>(data: T, revision_id: i64) -> ApiResult<T> {
    Ok(ApiResponse::new(data, revision_id))
}

/// Create an error API response.
pub fn error<T: Serialize>(err: AppError, revision_id: i64) -> ApiResult<T> {
    Err(crate::errors::AppErrorWithRevision {
        error: err,
        revision_id,
    })
}

/// Run `op` and wrap its outcome in the envelope with the revision after it.
pub(crate) async fn respond<T, F>(state: &AppState, op: F) -> ApiResult<T>
where
    T: Serialize,
    F: std::future::Future<Output = Result<T, AppError>>,
{
    let revision_id = state.store.get_revision_id().await.unwrap_or(0);
    match op.await {
        Ok(data) => {
            let new_revision = state.store.get_revision_id().await.unwrap_or(revision_id);
            success(data, new_revision)
        }
        Err(e) => error(e, revision_id),
    }
}

/// Tenant of the active session, whatever the role.
pub(crate) fn session_owner(state: &AppState) -> Result<String, AppError> {
    state
        .scope
        .current()
        .owner_id()
        .map(str::to_string)
        .ok_or_else(|| AppError::Unauthorized("No active session".to_string()))
}

/// Tenant of the active session, which must be the owner's.
pub(crate) fn require_owner(state: &AppState) -> Result<String, AppError> {
    match state.scope.current() {
        Session::Owner { owner_id } => Ok(owner_id),
        _ => Err(AppError::Unauthorized(
            "Owner session required".to_string(),
        )),
    }
}

/// Local id of the signed-in driver, or `None` in an owner session.
pub(crate) async fn session_driver(state: &AppState) -> Result<Option<i64>, AppError> {
    let session = state.scope.current();
    let Some(driver_cloud_id) = session.driver_cloud_id() else {
        return Ok(None);
    };
    let driver = state
        .store
        .find_by_cloud_id::<Driver>(driver_cloud_id)
        .await?
        .filter(|d| Some(d.meta.owner_id.as_str()) == session.owner_id())
        .ok_or_else(|| {
            AppError::NotFound(format!("Driver {} is not on this device", driver_cloud_id))
        })?;
    Ok(Some(driver.meta.local_id))
}
