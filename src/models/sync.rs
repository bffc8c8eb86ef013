//! Sync bookkeeping shared by every replicated entity.
//!
//! Each syncable table carries the same set of meta columns next to its
//! domain columns. The domain part of a record is what travels to the cloud;
//! the meta part never leaves the device.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::errors::AppError;

/// Attempts after which a record stops being retried automatically.
pub const DEFAULT_MAX_SYNC_ATTEMPTS: i64 = 3;

/// Every replicated entity type, in push order.
///
/// Reference data goes first so that financial records pushed in the same
/// pass can already resolve their driver's cloud id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Driver,
    Company,
    Client,
    PickupLocation,
    RateSlab,
    PickupClientDistance,
    Trip,
    FuelEntry,
    Advance,
}

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        EntityKind::Driver,
        EntityKind::Company,
        EntityKind::Client,
        EntityKind::PickupLocation,
        EntityKind::RateSlab,
        EntityKind::PickupClientDistance,
        EntityKind::Trip,
        EntityKind::FuelEntry,
        EntityKind::Advance,
    ];

    /// Local Store table name.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Driver => "drivers",
            EntityKind::Company => "companies",
            EntityKind::Client => "clients",
            EntityKind::PickupLocation => "pickup_locations",
            EntityKind::RateSlab => "rate_slabs",
            EntityKind::PickupClientDistance => "pickup_client_distances",
            EntityKind::Trip => "trips",
            EntityKind::FuelEntry => "fuel_entries",
            EntityKind::Advance => "advances",
        }
    }

    /// Cloud Store collection name.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Driver => "drivers",
            EntityKind::Company => "companies",
            EntityKind::Client => "clients",
            EntityKind::PickupLocation => "pickupLocations",
            EntityKind::RateSlab => "rateSlabs",
            EntityKind::PickupClientDistance => "pickupClientDistances",
            EntityKind::Trip => "trips",
            EntityKind::FuelEntry => "fuel",
            EntityKind::Advance => "advances",
        }
    }

    /// Records that belong to a single driver and are only replicated to that driver's device.
    pub fn is_driver_scoped(&self) -> bool {
        matches!(
            self,
            EntityKind::Trip | EntityKind::FuelEntry | EntityKind::Advance
        )
    }
}

/// Derived replication state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Local,
    Pending,
    Synced,
    Failed,
}

impl SyncState {
    pub fn derive(cloud_id: Option<&str>, attempts: i64, dirty: bool, max_attempts: i64) -> Self {
        let needs_push = cloud_id.is_none() || dirty;
        if !needs_push {
            return SyncState::Synced;
        }
        if attempts >= max_attempts {
            SyncState::Failed
        } else if attempts > 0 || cloud_id.is_some() {
            SyncState::Pending
        } else {
            SyncState::Local
        }
    }
}

/// Device-side bookkeeping carried by every syncable row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncMeta {
    pub local_id: i64,
    pub cloud_id: Option<String>,
    pub owner_id: String,
    pub sync_attempts: i64,
    pub dirty: bool,
    pub synced_at: Option<String>,
    pub created_at: String,
    pub last_sync_error: Option<String>,
}

impl SyncMeta {
    /// Meta for a record about to be created locally for `owner_id`.
    pub fn new_local(owner_id: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            created_at: crate::db::timestamp(),
            ..Default::default()
        }
    }

    /// Meta for a record that arrived from the cloud.
    pub fn from_cloud(owner_id: &str, cloud_id: &str) -> Self {
        Self {
            cloud_id: Some(cloud_id.to_string()),
            ..Self::new_local(owner_id)
        }
    }

    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let dirty: i32 = row.try_get("dirty")?;
        Ok(Self {
            local_id: row.try_get("local_id")?,
            cloud_id: row.try_get("cloud_id")?,
            owner_id: row.try_get("owner_id")?,
            sync_attempts: row.try_get("sync_attempts")?,
            dirty: dirty != 0,
            synced_at: row.try_get("synced_at")?,
            created_at: row.try_get("created_at")?,
            last_sync_error: row.try_get("last_sync_error")?,
        })
    }

    pub fn state(&self, max_attempts: i64) -> SyncState {
        SyncState::derive(
            self.cloud_id.as_deref(),
            self.sync_attempts,
            self.dirty,
            max_attempts,
        )
    }
}

/// A single column value bound into a dynamically built statement.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Null,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Integer(value as i64)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// A tenant entity stored locally and replicated to the cloud.
pub trait SyncRecord:
    Clone + Send + Sync + Unpin + Serialize + DeserializeOwned + 'static
{
    const KIND: EntityKind;

    /// Columns written once at insert and never touched by later updates.
    const IMMUTABLE_COLUMNS: &'static [&'static str] = &[];

    fn meta(&self) -> &SyncMeta;
    fn meta_mut(&mut self) -> &mut SyncMeta;

    /// Deterministic natural key recognising the same real-world fact across devices.
    fn logical_key(&self) -> String;

    /// The logical key without any local driver id, so it reads the same on every device.
    fn fact_key(&self) -> String {
        self.logical_key()
    }

    /// Domain columns, excluding the shared meta columns.
    fn columns(&self) -> Vec<(&'static str, FieldValue)>;

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error>;

    fn validate(&self) -> Result<(), AppError> {
        Ok(())
    }

    /// Local id of the driver this record belongs to, if any.
    fn driver_id(&self) -> Option<i64> {
        None
    }

    fn set_driver_id(&mut self, _driver_id: i64) {}
}

/// A record as returned by the local API: domain fields plus its sync state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView<T: Serialize> {
    pub local_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_id: Option<String>,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<i64>,
    pub sync_state: SyncState,
    pub sync_attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_error: Option<String>,
    pub created_at: String,
    #[serde(flatten)]
    pub record: T,
}

impl<T: SyncRecord> RecordView<T> {
    pub fn new(record: T, max_attempts: i64) -> Self {
        let meta = record.meta().clone();
        Self {
            local_id: meta.local_id,
            sync_state: meta.state(max_attempts),
            cloud_id: meta.cloud_id,
            owner_id: meta.owner_id,
            driver_id: record.driver_id(),
            sync_attempts: meta.sync_attempts,
            last_sync_error: meta.last_sync_error,
            created_at: meta.created_at,
            record,
        }
    }
}

/// Normalise a free-text name into its logical-key form.
pub fn name_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Render a money or distance amount for use inside a logical key.
pub fn amount_key(amount: f64) -> String {
    format!("{:.2}", amount)
}

pub(crate) fn require_name(kind: EntityKind, name: &str) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::Validation(format!(
            "{} name is required",
            kind.table()
        )));
    }
    Ok(())
}

pub(crate) fn require_amount(field: &str, amount: f64) -> Result<(), AppError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(AppError::Validation(format!(
            "{} must be a non-negative number",
            field
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state_transitions() {
        assert_eq!(SyncState::derive(None, 0, false, 3), SyncState::Local);
        assert_eq!(SyncState::derive(None, 1, false, 3), SyncState::Pending);
        assert_eq!(SyncState::derive(None, 2, false, 3), SyncState::Pending);
        assert_eq!(SyncState::derive(None, 3, false, 3), SyncState::Failed);
        assert_eq!(SyncState::derive(Some("F1"), 0, false, 3), SyncState::Synced);
        assert_eq!(SyncState::derive(Some("F1"), 0, true, 3), SyncState::Pending);
        assert_eq!(SyncState::derive(Some("F1"), 3, true, 3), SyncState::Failed);
    }

    #[test]
    fn test_name_key_normalises_case_and_spacing() {
        assert_eq!(name_key("  Raj   Kumar "), "raj kumar");
        assert_eq!(name_key("ACME Cement"), name_key("acme  cement"));
    }

    #[test]
    fn test_amount_key_is_stable() {
        assert_eq!(amount_key(500.0), "500.00");
        assert_eq!(amount_key(499.999), "500.00");
    }

    #[test]
    fn test_push_order_starts_with_drivers() {
        assert_eq!(EntityKind::ALL[0], EntityKind::Driver);
        let first_scoped = EntityKind::ALL
            .iter()
            .position(|k| k.is_driver_scoped())
            .unwrap();
        assert!(EntityKind::ALL[..first_scoped]
            .iter()
            .all(|k| !k.is_driver_scoped()));
    }
}
