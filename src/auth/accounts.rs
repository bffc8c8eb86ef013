//! Owner setup, PIN login and session restore at launch.

use rand::RngCore;
use sha2::{Digest, Sha256};

use super::constant_time_compare;
use crate::db::{timestamp, LocalStore};
use crate::errors::AppError;
use crate::models::{LaunchRoute, OwnerProfile};
use crate::scope::ScopeManager;

const SALT_LEN: usize = 16;
const PIN_MIN_LEN: usize = 4;
const PIN_MAX_LEN: usize = 8;

fn check_pin_format(pin: &str) -> Result<(), AppError> {
    let valid_len = (PIN_MIN_LEN..=PIN_MAX_LEN).contains(&pin.len());
    if !valid_len || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::Validation(format!(
            "PIN must be {} to {} digits",
            PIN_MIN_LEN, PIN_MAX_LEN
        )));
    }
    Ok(())
}

fn digest(salt: &[u8], pin: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    hex::encode(hasher.finalize())
}

/// Salted hash of a PIN, stored as `hex(salt)$hex(sha256(salt || pin))`.
pub fn hash_pin(pin: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    format!("{}${}", hex::encode(salt), digest(&salt, pin))
}

pub fn verify_pin(pin: &str, stored: &str) -> bool {
    let Some((salt_hex, expected)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    constant_time_compare(&digest(&salt, pin), expected)
}

/// Owner account lifecycle on this device.
#[derive(Clone)]
pub struct Accounts {
    store: LocalStore,
    scope: ScopeManager,
}

impl Accounts {
    pub fn new(store: LocalStore, scope: ScopeManager) -> Self {
        Self { store, scope }
    }

    /// Create the tenant on this device and log the owner in.
    pub async fn setup_owner(&self, business_name: &str, pin: &str) -> Result<OwnerProfile, AppError> {
        if business_name.trim().is_empty() {
            return Err(AppError::Validation("businessName is required".to_string()));
        }
        check_pin_format(pin)?;
        if self.store.owner_profile().await?.is_some() {
            return Err(AppError::Conflict("Owner is already set up".to_string()));
        }
        if self.store.load_prefs().await?.driver_access_granted {
            return Err(AppError::Conflict(
                "This device is linked to a driver".to_string(),
            ));
        }

        let profile = OwnerProfile {
            owner_id: uuid::Uuid::new_v4().to_string(),
            business_name: business_name.trim().to_string(),
            created_at: timestamp(),
        };
        self.store.save_owner_profile(&profile, &hash_pin(pin)).await?;
        self.scope.set_owner_session(&profile.owner_id)?;
        tracing::info!(owner_id = profile.owner_id.as_str(), "Owner account created");
        Ok(profile)
    }

    pub async fn login_owner(&self, pin: &str) -> Result<OwnerProfile, AppError> {
        let profile = self
            .store
            .owner_profile()
            .await?
            .ok_or_else(|| AppError::NotFound("No owner account on this device".to_string()))?;
        let stored = self.store.load_prefs().await?.owner_pin_hash;
        let matches = stored.as_deref().is_some_and(|hash| verify_pin(pin, hash));
        if !matches {
            tracing::warn!("Owner PIN rejected");
            return Err(AppError::Unauthorized("Incorrect PIN".to_string()));
        }
        self.scope.set_owner_session(&profile.owner_id)?;
        Ok(profile)
    }

    pub fn logout(&self) {
        self.scope.logout();
    }

    pub async fn launch_route(&self) -> Result<LaunchRoute, AppError> {
        Ok(LaunchRoute::from_prefs(&self.store.load_prefs().await?))
    }

    /// Re-enter a driver session persisted by an earlier join.
    ///
    /// Owner sessions always need the PIN again.
    pub async fn restore_session(&self) -> Result<LaunchRoute, AppError> {
        let route = self.launch_route().await?;
        if let LaunchRoute::DriverHome {
            driver_id,
            owner_id,
        } = &route
        {
            self.scope.set_driver_session(driver_id, owner_id)?;
            tracing::info!(owner_id = owner_id.as_str(), "Driver session restored");
        }
        Ok(route)
    }
}
