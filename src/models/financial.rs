//! Financial records: trips, fuel entries, advances and the audit log.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::reference::meta_accessors;
use super::sync::{
    amount_key, name_key, require_amount, require_name, EntityKind, FieldValue, SyncMeta,
    SyncRecord,
};
use crate::errors::AppError;

fn require_driver(driver_id: i64) -> Result<(), AppError> {
    if driver_id <= 0 {
        return Err(AppError::Validation("driverId is required".to_string()));
    }
    Ok(())
}

/// A completed haul. Append-only: trips are verified or overridden, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    #[serde(skip)]
    pub meta: SyncMeta,
    #[serde(skip)]
    pub driver_id: i64,
    pub trip_date: NaiveDate,
    pub company: String,
    pub pickup_location: String,
    pub client: String,
    pub bags: i64,
    /// Snapshot of the distance at creation time.
    pub distance_km: f64,
    /// Snapshot of the driver rate at creation time.
    pub driver_rate: f64,
    /// Snapshot of the company rate at creation time.
    pub company_rate: f64,
    /// Snapshot of the labour cost per bag at creation time.
    pub labour_cost_per_bag: f64,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub overridden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_reason: Option<String>,
}

impl SyncRecord for Trip {
    const KIND: EntityKind = EntityKind::Trip;

    const IMMUTABLE_COLUMNS: &'static [&'static str] = &[
        "distance_km",
        "driver_rate",
        "company_rate",
        "labour_cost_per_bag",
    ];

    meta_accessors!();

    fn logical_key(&self) -> String {
        format!("{}|{}", self.driver_id, self.fact_key())
    }

    fn fact_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.trip_date,
            name_key(&self.pickup_location),
            name_key(&self.client),
            self.bags
        )
    }

    fn columns(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("driver_id", self.driver_id.into()),
            ("trip_date", self.trip_date.to_string().into()),
            ("company", self.company.as_str().into()),
            ("pickup_location", self.pickup_location.as_str().into()),
            ("client", self.client.as_str().into()),
            ("bags", self.bags.into()),
            ("distance_km", self.distance_km.into()),
            ("driver_rate", self.driver_rate.into()),
            ("company_rate", self.company_rate.into()),
            ("labour_cost_per_bag", self.labour_cost_per_bag.into()),
            ("verified", self.verified.into()),
            ("overridden", self.overridden.into()),
            ("override_amount", self.override_amount.into()),
            ("override_reason", self.override_reason.clone().into()),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let verified: i32 = row.try_get("verified")?;
        let overridden: i32 = row.try_get("overridden")?;
        Ok(Self {
            meta: SyncMeta::from_row(row)?,
            driver_id: row.try_get("driver_id")?,
            trip_date: row.try_get("trip_date")?,
            company: row.try_get("company")?,
            pickup_location: row.try_get("pickup_location")?,
            client: row.try_get("client")?,
            bags: row.try_get("bags")?,
            distance_km: row.try_get("distance_km")?,
            driver_rate: row.try_get("driver_rate")?,
            company_rate: row.try_get("company_rate")?,
            labour_cost_per_bag: row.try_get("labour_cost_per_bag")?,
            verified: verified != 0,
            overridden: overridden != 0,
            override_amount: row.try_get("override_amount")?,
            override_reason: row.try_get("override_reason")?,
        })
    }

    fn validate(&self) -> Result<(), AppError> {
        require_driver(self.driver_id)?;
        require_name(EntityKind::Company, &self.company)?;
        require_name(EntityKind::PickupLocation, &self.pickup_location)?;
        require_name(EntityKind::Client, &self.client)?;
        if self.bags <= 0 {
            return Err(AppError::Validation("bags must be positive".to_string()));
        }
        require_amount("distanceKm", self.distance_km)?;
        require_amount("driverRate", self.driver_rate)?;
        require_amount("companyRate", self.company_rate)?;
        require_amount("labourCostPerBag", self.labour_cost_per_bag)
    }

    fn driver_id(&self) -> Option<i64> {
        Some(self.driver_id)
    }

    fn set_driver_id(&mut self, driver_id: i64) {
        self.driver_id = driver_id;
    }
}

/// Fuel purchased by a driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FuelEntry {
    #[serde(skip)]
    pub meta: SyncMeta,
    #[serde(skip)]
    pub driver_id: i64,
    pub entry_date: NaiveDate,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub litres: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl SyncRecord for FuelEntry {
    const KIND: EntityKind = EntityKind::FuelEntry;

    meta_accessors!();

    fn logical_key(&self) -> String {
        format!("{}|{}", self.driver_id, self.fact_key())
    }

    fn fact_key(&self) -> String {
        format!("{}|{}", self.entry_date, amount_key(self.amount))
    }

    fn columns(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("driver_id", self.driver_id.into()),
            ("entry_date", self.entry_date.to_string().into()),
            ("amount", self.amount.into()),
            ("litres", self.litres.into()),
            ("notes", self.notes.clone().into()),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            meta: SyncMeta::from_row(row)?,
            driver_id: row.try_get("driver_id")?,
            entry_date: row.try_get("entry_date")?,
            amount: row.try_get("amount")?,
            litres: row.try_get("litres")?,
            notes: row.try_get("notes")?,
        })
    }

    fn validate(&self) -> Result<(), AppError> {
        require_driver(self.driver_id)?;
        require_amount("amount", self.amount)?;
        if let Some(litres) = self.litres {
            require_amount("litres", litres)?;
        }
        Ok(())
    }

    fn driver_id(&self) -> Option<i64> {
        Some(self.driver_id)
    }

    fn set_driver_id(&mut self, driver_id: i64) {
        self.driver_id = driver_id;
    }
}

/// Direction of an advance movement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AdvanceKind {
    /// Cash handed to the driver.
    Given,
    /// Cash recovered from the driver, usually against earnings.
    Recovered,
}

impl AdvanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvanceKind::Given => "given",
            AdvanceKind::Recovered => "recovered",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "given" => Some(AdvanceKind::Given),
            "recovered" => Some(AdvanceKind::Recovered),
            _ => None,
        }
    }
}

/// A cash advance given to, or recovered from, a driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Advance {
    #[serde(skip)]
    pub meta: SyncMeta,
    #[serde(skip)]
    pub driver_id: i64,
    pub entry_date: NaiveDate,
    pub amount: f64,
    pub kind: AdvanceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Advance {
    /// Signed effect on the driver's outstanding balance.
    pub fn balance_delta(&self) -> f64 {
        match self.kind {
            AdvanceKind::Given => self.amount,
            AdvanceKind::Recovered => -self.amount,
        }
    }
}

impl SyncRecord for Advance {
    const KIND: EntityKind = EntityKind::Advance;

    meta_accessors!();

    fn logical_key(&self) -> String {
        format!("{}|{}", self.driver_id, self.fact_key())
    }

    fn fact_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.entry_date,
            amount_key(self.amount),
            self.kind.as_str()
        )
    }

    fn columns(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("driver_id", self.driver_id.into()),
            ("entry_date", self.entry_date.to_string().into()),
            ("amount", self.amount.into()),
            ("kind", self.kind.as_str().into()),
            ("notes", self.notes.clone().into()),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        Ok(Self {
            meta: SyncMeta::from_row(row)?,
            driver_id: row.try_get("driver_id")?,
            entry_date: row.try_get("entry_date")?,
            amount: row.try_get("amount")?,
            kind: AdvanceKind::from_str(&kind).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "kind".to_string(),
                source: format!("unknown advance kind {}", kind).into(),
            })?,
            notes: row.try_get("notes")?,
        })
    }

    fn validate(&self) -> Result<(), AppError> {
        require_driver(self.driver_id)?;
        require_amount("amount", self.amount)?;
        if self.amount == 0.0 {
            return Err(AppError::Validation("amount must be positive".to_string()));
        }
        Ok(())
    }

    fn driver_id(&self) -> Option<i64> {
        Some(self.driver_id)
    }

    fn set_driver_id(&mut self, driver_id: i64) {
        self.driver_id = driver_id;
    }
}

/// One row of the local audit trail. Audit rows stay on the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    #[serde(default)]
    pub id: i64,
    pub owner_id: String,
    pub table_name: String,
    pub record_id: i64,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    pub reason: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fuel(driver_id: i64, amount: f64) -> FuelEntry {
        FuelEntry {
            meta: SyncMeta::new_local("owner-1"),
            driver_id,
            entry_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            amount,
            litres: None,
            notes: None,
        }
    }

    #[test]
    fn test_fuel_key_is_driver_date_amount() {
        assert_eq!(fuel(5, 500.0).logical_key(), "5|2024-03-01|500.00");
    }

    #[test]
    fn test_fuel_requires_driver() {
        assert!(matches!(
            fuel(0, 500.0).validate(),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_fuel_document_carries_no_local_driver_id() {
        let doc = serde_json::to_value(fuel(5, 500.0)).unwrap();
        assert!(doc.get("driverId").is_none());
        assert_eq!(doc["entryDate"], "2024-03-01");
        assert_eq!(doc["amount"], 500.0);
    }

    #[test]
    fn test_advance_balance_delta() {
        let mut advance = Advance {
            meta: SyncMeta::new_local("owner-1"),
            driver_id: 5,
            entry_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            amount: 1000.0,
            kind: AdvanceKind::Given,
            notes: None,
        };
        assert_eq!(advance.balance_delta(), 1000.0);
        advance.kind = AdvanceKind::Recovered;
        assert_eq!(advance.balance_delta(), -1000.0);
        assert!(advance.logical_key().ends_with("|recovered"));
    }

    #[test]
    fn test_trip_snapshot_columns_are_immutable() {
        for column in ["distance_km", "driver_rate", "company_rate", "labour_cost_per_bag"] {
            assert!(Trip::IMMUTABLE_COLUMNS.contains(&column));
        }
        assert!(!Trip::IMMUTABLE_COLUMNS.contains(&"verified"));
    }
}
