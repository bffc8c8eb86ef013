//! Tenant reference data: drivers, companies, clients, pickup locations and rates.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::sync::{
    amount_key, name_key, require_amount, require_name, EntityKind, FieldValue, SyncMeta,
    SyncRecord,
};
use crate::errors::AppError;

macro_rules! meta_accessors {
    () => {
        fn meta(&self) -> &SyncMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut SyncMeta {
            &mut self.meta
        }
    };
}

pub(crate) use meta_accessors;

fn default_true() -> bool {
    true
}

/// A driver profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    #[serde(skip)]
    pub meta: SyncMeta,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl SyncRecord for Driver {
    const KIND: EntityKind = EntityKind::Driver;

    meta_accessors!();

    fn logical_key(&self) -> String {
        name_key(&self.name)
    }

    fn columns(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("name", self.name.as_str().into()),
            ("phone", self.phone.clone().into()),
            ("active", self.active.into()),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let active: i32 = row.try_get("active")?;
        Ok(Self {
            meta: SyncMeta::from_row(row)?,
            name: row.try_get("name")?,
            phone: row.try_get("phone")?,
            active: active != 0,
        })
    }

    fn validate(&self) -> Result<(), AppError> {
        require_name(Self::KIND, &self.name)
    }
}

/// A company the fleet hauls for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    #[serde(skip)]
    pub meta: SyncMeta,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

impl SyncRecord for Company {
    const KIND: EntityKind = EntityKind::Company;

    meta_accessors!();

    fn logical_key(&self) -> String {
        name_key(&self.name)
    }

    fn columns(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("name", self.name.as_str().into()),
            ("contact", self.contact.clone().into()),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            meta: SyncMeta::from_row(row)?,
            name: row.try_get("name")?,
            contact: row.try_get("contact")?,
        })
    }

    fn validate(&self) -> Result<(), AppError> {
        require_name(Self::KIND, &self.name)
    }
}

/// A delivery client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    #[serde(skip)]
    pub meta: SyncMeta,
    pub name: String,
}

impl SyncRecord for Client {
    const KIND: EntityKind = EntityKind::Client;

    meta_accessors!();

    fn logical_key(&self) -> String {
        name_key(&self.name)
    }

    fn columns(&self) -> Vec<(&'static str, FieldValue)> {
        vec![("name", self.name.as_str().into())]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            meta: SyncMeta::from_row(row)?,
            name: row.try_get("name")?,
        })
    }

    fn validate(&self) -> Result<(), AppError> {
        require_name(Self::KIND, &self.name)
    }
}

/// A loading point trips start from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PickupLocation {
    #[serde(skip)]
    pub meta: SyncMeta,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl SyncRecord for PickupLocation {
    const KIND: EntityKind = EntityKind::PickupLocation;

    meta_accessors!();

    fn logical_key(&self) -> String {
        name_key(&self.name)
    }

    fn columns(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("name", self.name.as_str().into()),
            ("notes", self.notes.clone().into()),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            meta: SyncMeta::from_row(row)?,
            name: row.try_get("name")?,
            notes: row.try_get("notes")?,
        })
    }

    fn validate(&self) -> Result<(), AppError> {
        require_name(Self::KIND, &self.name)
    }
}

/// Road distance between a pickup location and a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PickupClientDistance {
    #[serde(skip)]
    pub meta: SyncMeta,
    pub pickup_location: String,
    pub client: String,
    pub distance_km: f64,
}

impl SyncRecord for PickupClientDistance {
    const KIND: EntityKind = EntityKind::PickupClientDistance;

    meta_accessors!();

    fn logical_key(&self) -> String {
        format!(
            "{}|{}",
            name_key(&self.pickup_location),
            name_key(&self.client)
        )
    }

    fn columns(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("pickup_location", self.pickup_location.as_str().into()),
            ("client", self.client.as_str().into()),
            ("distance_km", self.distance_km.into()),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            meta: SyncMeta::from_row(row)?,
            pickup_location: row.try_get("pickup_location")?,
            client: row.try_get("client")?,
            distance_km: row.try_get("distance_km")?,
        })
    }

    fn validate(&self) -> Result<(), AppError> {
        require_name(EntityKind::PickupLocation, &self.pickup_location)?;
        require_name(EntityKind::Client, &self.client)?;
        require_amount("distanceKm", self.distance_km)
    }
}

/// Per-distance-band rates. Replaced as a set, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateSlab {
    #[serde(skip)]
    pub meta: SyncMeta,
    pub min_km: f64,
    pub max_km: f64,
    pub driver_rate: f64,
    pub company_rate: f64,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl RateSlab {
    pub fn covers(&self, distance_km: f64) -> bool {
        self.active && distance_km >= self.min_km && distance_km <= self.max_km
    }
}

impl SyncRecord for RateSlab {
    const KIND: EntityKind = EntityKind::RateSlab;

    meta_accessors!();

    fn logical_key(&self) -> String {
        format!("{}-{}", amount_key(self.min_km), amount_key(self.max_km))
    }

    fn columns(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("min_km", self.min_km.into()),
            ("max_km", self.max_km.into()),
            ("driver_rate", self.driver_rate.into()),
            ("company_rate", self.company_rate.into()),
            ("active", self.active.into()),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let active: i32 = row.try_get("active")?;
        Ok(Self {
            meta: SyncMeta::from_row(row)?,
            min_km: row.try_get("min_km")?,
            max_km: row.try_get("max_km")?,
            driver_rate: row.try_get("driver_rate")?,
            company_rate: row.try_get("company_rate")?,
            active: active != 0,
        })
    }

    fn validate(&self) -> Result<(), AppError> {
        require_amount("minKm", self.min_km)?;
        require_amount("maxKm", self.max_km)?;
        require_amount("driverRate", self.driver_rate)?;
        require_amount("companyRate", self.company_rate)?;
        if self.max_km < self.min_km {
            return Err(AppError::Validation(format!(
                "Rate slab range {}-{} is inverted",
                self.min_km, self.max_km
            )));
        }
        Ok(())
    }
}
