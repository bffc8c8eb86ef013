//! Tenant record API handlers.
//!
//! Creation always goes through the dedup resolver, so posting the same fact
//! twice answers with the existing row instead of a second one.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{require_owner, respond, session_driver, session_owner, ApiResult};
use crate::errors::AppError;
use crate::models::{
    Advance, AuditEntry, Driver, FuelEntry, RateSlab, RecordView, SyncMeta, SyncRecord, Trip,
};
use crate::sync::Resolution;
use crate::AppState;

/// A created record and what the resolver did with it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRecord<T: Serialize> {
    pub resolution: &'static str,
    #[serde(flatten)]
    pub record: RecordView<T>,
}

/// Body of a driver-scoped create. `driverId` is ignored in a driver session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverScopedRequest<T> {
    #[serde(default)]
    pub driver_id: Option<i64>,
    #[serde(flatten)]
    pub record: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceRateSlabsRequest {
    pub slabs: Vec<RateSlab>,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideTripRequest {
    pub amount: f64,
    pub reason: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceBalance {
    pub driver_id: i64,
    pub balance: f64,
}

async fn view<T: SyncRecord>(
    state: &AppState,
    owner_id: &str,
    local_id: i64,
) -> Result<RecordView<T>, AppError> {
    let record = state.store.get_owned::<T>(owner_id, local_id).await?;
    Ok(RecordView::new(record, state.coordinator.max_attempts()))
}

async fn created<T: SyncRecord>(
    state: &AppState,
    owner_id: &str,
    resolution: Resolution,
) -> Result<CreatedRecord<T>, AppError> {
    if matches!(resolution, Resolution::Inserted(_)) {
        state.coordinator.request_sync();
    }
    Ok(CreatedRecord {
        resolution: resolution.as_str(),
        record: view(state, owner_id, resolution.local_id()).await?,
    })
}

/// Fill in tenant and driver for a driver-scoped record before it is resolved.
async fn prepare_scoped<T: SyncRecord>(
    state: &AppState,
    req: DriverScopedRequest<T>,
) -> Result<(String, T), AppError> {
    let owner_id = session_owner(state)?;
    let driver_id = match session_driver(state).await? {
        Some(own) => own,
        None => req
            .driver_id
            .ok_or_else(|| AppError::Validation("driverId is required".to_string()))?,
    };
    // The driver must belong to this tenant.
    state
        .store
        .get_owned::<Driver>(&owner_id, driver_id)
        .await?;

    let mut record = req.record;
    *record.meta_mut() = SyncMeta::new_local(&owner_id);
    record.set_driver_id(driver_id);
    Ok((owner_id, record))
}

// ==================== REFERENCE DATA ====================

/// POST /api/drivers, /companies, /clients, /pickup-locations - Owner creates reference data.
pub async fn create_reference<T: SyncRecord>(
    State(state): State<AppState>,
    Json(mut record): Json<T>,
) -> ApiResult<CreatedRecord<T>> {
    respond(&state, async {
        let owner_id = require_owner(&state)?;
        *record.meta_mut() = SyncMeta::new_local(&owner_id);
        let resolution = state.resolver.resolve(record).await?;
        created(&state, &owner_id, resolution).await
    })
    .await
}

/// GET list for any record type. Driver sessions see only their own driver-scoped rows.
pub async fn list_records<T: SyncRecord>(
    State(state): State<AppState>,
) -> ApiResult<Vec<RecordView<T>>> {
    respond(&state, async {
        let owner_id = session_owner(&state)?;
        let records = match session_driver(&state).await? {
            Some(driver_id) if T::KIND.is_driver_scoped() => {
                state.store.list_for_driver::<T>(&owner_id, driver_id).await?
            }
            _ => state.store.list::<T>(&owner_id).await?,
        };
        let max_attempts = state.coordinator.max_attempts();
        Ok(records
            .into_iter()
            .map(|r| RecordView::new(r, max_attempts))
            .collect())
    })
    .await
}

// ==================== FINANCIAL RECORDS ====================

/// POST /api/fuel - Record a fuel entry.
pub async fn create_fuel(
    State(state): State<AppState>,
    Json(req): Json<DriverScopedRequest<FuelEntry>>,
) -> ApiResult<CreatedRecord<FuelEntry>> {
    respond(&state, async {
        let (owner_id, fuel) = prepare_scoped(&state, req).await?;
        let resolution = state.resolver.resolve(fuel).await?;
        created(&state, &owner_id, resolution).await
    })
    .await
}

/// POST /api/advances - Record an advance given or recovered.
pub async fn create_advance(
    State(state): State<AppState>,
    Json(req): Json<DriverScopedRequest<Advance>>,
) -> ApiResult<CreatedRecord<Advance>> {
    respond(&state, async {
        let (owner_id, advance) = prepare_scoped(&state, req).await?;
        let resolution = state.store.record_advance(advance).await?;
        created(&state, &owner_id, resolution).await
    })
    .await
}

/// POST /api/trips - Record a trip with its rate snapshot.
pub async fn create_trip(
    State(state): State<AppState>,
    Json(req): Json<DriverScopedRequest<Trip>>,
) -> ApiResult<CreatedRecord<Trip>> {
    respond(&state, async {
        let (owner_id, mut trip) = prepare_scoped(&state, req).await?;
        // Verification and overrides have their own audited endpoints.
        trip.verified = false;
        trip.overridden = false;
        trip.override_amount = None;
        trip.override_reason = None;
        let resolution = state.resolver.resolve(trip).await?;
        created(&state, &owner_id, resolution).await
    })
    .await
}

/// POST /api/trips/{id}/verify - Mark a trip verified.
pub async fn verify_trip(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<RecordView<Trip>> {
    respond(&state, async {
        let owner_id = require_owner(&state)?;
        let trip = state.store.verify_trip(&owner_id, id).await?;
        state.coordinator.request_sync();
        Ok(RecordView::new(trip, state.coordinator.max_attempts()))
    })
    .await
}

/// POST /api/trips/{id}/override - Override a trip amount with an audited reason.
pub async fn override_trip(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<OverrideTripRequest>,
) -> ApiResult<RecordView<Trip>> {
    respond(&state, async {
        let owner_id = require_owner(&state)?;
        let trip = state
            .store
            .override_trip(&owner_id, id, req.amount, &req.reason)
            .await?;
        state.coordinator.request_sync();
        Ok(RecordView::new(trip, state.coordinator.max_attempts()))
    })
    .await
}

/// PUT /api/rate-slabs - Replace the active rate slabs as a set.
pub async fn replace_rate_slabs(
    State(state): State<AppState>,
    Json(req): Json<ReplaceRateSlabsRequest>,
) -> ApiResult<Vec<RecordView<RateSlab>>> {
    respond(&state, async {
        let owner_id = require_owner(&state)?;
        let slabs = state
            .store
            .replace_rate_slabs(&owner_id, req.slabs, &req.reason)
            .await?;
        state.coordinator.request_sync();
        let max_attempts = state.coordinator.max_attempts();
        Ok(slabs
            .into_iter()
            .map(|s| RecordView::new(s, max_attempts))
            .collect())
    })
    .await
}

/// GET /api/drivers/{id}/advance-balance - Outstanding advance balance of a driver.
pub async fn get_advance_balance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<AdvanceBalance> {
    respond(&state, async {
        let owner_id = session_owner(&state)?;
        if let Some(own) = session_driver(&state).await? {
            if own != id {
                return Err(AppError::Unauthorized(
                    "Drivers can only see their own balance".to_string(),
                ));
            }
        }
        state
            .store
            .get_owned::<Driver>(&owner_id, id)
            .await?;
        let balance = state.store.advance_balance(&owner_id, id).await?;
        Ok(AdvanceBalance {
            driver_id: id,
            balance,
        })
    })
    .await
}

/// GET /api/audit - Local audit trail of the tenant.
pub async fn list_audit(State(state): State<AppState>) -> ApiResult<Vec<AuditEntry>> {
    respond(&state, async {
        let owner_id = require_owner(&state)?;
        state.store.list_audit(&owner_id).await
    })
    .await
}
