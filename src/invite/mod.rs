//! Invite/Bootstrap Flow.
//!
//! The owner issues a short-lived single-use code for a driver. The driver's
//! device validates it, consumes it atomically in the cloud, links itself to
//! the tenant and pulls the tenant's reference data in one local transaction.
//! The driver grant is the last write of that transaction, so a device that
//! crashes mid-join comes back to the invite screen.

mod identity;

pub use identity::*;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;

use crate::cloud::{CloudDocument, CloudStore, ConsumeOutcome, ScopedCloud};
use crate::db::{grant_driver_access_in, LocalStore};
use crate::errors::AppError;
use crate::models::{
    normalize_code, Client, Company, Driver, DriverLink, EntityKind, InviteCode, InviteError,
    InviteValidation, PickupClientDistance, PickupLocation, RateSlab, Session, SyncRecord,
    INVITE_ALPHABET, INVITE_CODE_LEN,
};
use crate::scope::ScopeManager;
use crate::sync::{apply_documents_in, decode_in, resolve_in};

/// Attempts at finding an unused code before giving up.
const MAX_CODE_ATTEMPTS: usize = 5;

/// What a successful join brought onto the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSummary {
    pub owner_id: String,
    pub driver_cloud_id: String,
    pub driver_local_id: i64,
    pub driver_name: String,
    pub companies: usize,
    pub clients: usize,
    pub pickup_locations: usize,
    pub rate_slabs: usize,
    pub distances: usize,
}

/// Reference data of a tenant as fetched from the cloud.
struct TenantSnapshot {
    companies: Vec<CloudDocument>,
    clients: Vec<CloudDocument>,
    pickup_locations: Vec<CloudDocument>,
    rate_slabs: Vec<CloudDocument>,
    distances: Vec<CloudDocument>,
    driver: CloudDocument,
}

pub struct InviteService {
    cloud: Arc<dyn CloudStore>,
    scoped: ScopedCloud,
    scope: ScopeManager,
    store: LocalStore,
    identity: Arc<dyn IdentityProvider>,
    ttl: Duration,
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LEN)
        .map(|_| INVITE_ALPHABET[rng.gen_range(0..INVITE_ALPHABET.len())] as char)
        .collect()
}

impl InviteService {
    pub fn new(
        cloud: Arc<dyn CloudStore>,
        scope: ScopeManager,
        store: LocalStore,
        identity: Arc<dyn IdentityProvider>,
        ttl: Duration,
    ) -> Self {
        Self {
            scoped: ScopedCloud::new(cloud.clone(), scope.scope()),
            cloud,
            scope,
            store,
            identity,
            ttl,
        }
    }

    // ==================== OWNER SIDE ====================

    /// Issue a code for a driver that already exists in the cloud.
    pub async fn generate_code(
        &self,
        driver_cloud_id: &str,
        driver_name: &str,
    ) -> Result<InviteCode, AppError> {
        let Session::Owner { owner_id } = self.scope.current() else {
            return Err(AppError::Unauthorized(
                "Only the owner can invite drivers".to_string(),
            ));
        };
        if driver_name.trim().is_empty() {
            return Err(AppError::Validation("driverName is required".to_string()));
        }
        let driver = self
            .store
            .find_by_cloud_id::<Driver>(driver_cloud_id)
            .await?
            .filter(|d| d.meta.owner_id == owner_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Driver {} has not been synced to the cloud",
                    driver_cloud_id
                ))
            })?;

        let now = Utc::now();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let invite = InviteCode {
                code: random_code(),
                owner_id: owner_id.clone(),
                target_driver_cloud_id: driver_cloud_id.to_string(),
                driver_name: driver_name.trim().to_string(),
                created_at: now,
                expires_at: now + self.ttl,
                used: false,
                used_by: None,
                used_at: None,
            };
            if self.cloud.create_invite(&invite).await? {
                tracing::info!(
                    owner_id = owner_id.as_str(),
                    driver_local_id = driver.meta.local_id,
                    expires_at = %invite.expires_at,
                    "Invite code issued"
                );
                return Ok(invite);
            }
            tracing::debug!("Invite code collision; drawing another");
        }
        Err(AppError::Internal(
            "Could not allocate a unique invite code".to_string(),
        ))
    }

    // ==================== DRIVER SIDE ====================

    pub async fn validate(&self, raw: &str) -> Result<InviteValidation, AppError> {
        self.validate_at(raw, Utc::now()).await
    }

    /// Read-only check of a code. Malformed codes never reach the network.
    pub async fn validate_at(
        &self,
        raw: &str,
        now: DateTime<Utc>,
    ) -> Result<InviteValidation, AppError> {
        let code = normalize_code(raw)?;
        let invite = self
            .cloud
            .get_invite(&code)
            .await?
            .ok_or(InviteError::NotFound)?;
        invite.check(now)?;
        Ok(InviteValidation::from(&invite))
    }

    pub async fn confirm(&self, raw: &str) -> Result<JoinSummary, AppError> {
        self.confirm_at(raw, Utc::now()).await
    }

    /// Join the tenant named by the code.
    ///
    /// A code consumed by a join that later fails stays used; the owner
    /// issues a new one.
    pub async fn confirm_at(&self, raw: &str, now: DateTime<Utc>) -> Result<JoinSummary, AppError> {
        if self.store.load_prefs().await?.driver_access_granted {
            return Err(AppError::Conflict(
                "This device is already linked to a tenant".to_string(),
            ));
        }
        if self.store.owner_profile().await?.is_some() {
            return Err(AppError::Conflict(
                "This device belongs to an owner".to_string(),
            ));
        }
        if self.scope.current() != Session::NotLoggedIn {
            return Err(AppError::Conflict(
                "Log out before joining a tenant".to_string(),
            ));
        }

        let validation = self.validate_at(raw, now).await?;
        let device_id = self.identity.sign_in_anonymously().await?;

        match self
            .cloud
            .consume_invite(&validation.code, &device_id, now)
            .await?
        {
            ConsumeOutcome::Consumed => {}
            ConsumeOutcome::AlreadyUsed => return Err(InviteError::AlreadyUsed.into()),
            ConsumeOutcome::Expired => return Err(InviteError::Expired.into()),
            ConsumeOutcome::NotFound => return Err(InviteError::NotFound.into()),
        }
        tracing::info!(
            code = validation.code.as_str(),
            device_id = device_id.as_str(),
            "Invite code consumed"
        );

        self.cloud
            .put_driver_link(&DriverLink {
                device_id,
                linked_owner_id: validation.owner_id.clone(),
                driver_cloud_id: validation.driver_cloud_id.clone(),
                created_at: now,
            })
            .await?;

        self.scope
            .set_driver_session(&validation.driver_cloud_id, &validation.owner_id)?;

        match self.bootstrap(&validation).await {
            Ok(summary) => {
                tracing::info!(
                    owner_id = summary.owner_id.as_str(),
                    driver_cloud_id = summary.driver_cloud_id.as_str(),
                    "Driver device joined tenant"
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(error = %e, "Bootstrap failed; session cleared");
                self.scope.logout();
                Err(e)
            }
        }
    }

    async fn pull(&self, owner_id: &str, kind: EntityKind) -> Result<Vec<CloudDocument>, AppError> {
        self.scoped.pull(owner_id, kind.collection()).await
    }

    async fn fetch_snapshot(&self, owner_id: &str, driver_cloud_id: &str) -> Result<TenantSnapshot, AppError> {
        let companies = self.pull(owner_id, EntityKind::Company).await?;
        let clients = self.pull(owner_id, EntityKind::Client).await?;
        let pickup_locations = self.pull(owner_id, EntityKind::PickupLocation).await?;
        let rate_slabs = self.pull(owner_id, EntityKind::RateSlab).await?;
        let distances = self.pull(owner_id, EntityKind::PickupClientDistance).await?;
        let driver = self
            .scoped
            .get(owner_id, EntityKind::Driver.collection(), driver_cloud_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Driver profile {} not found", driver_cloud_id))
            })?;

        Ok(TenantSnapshot {
            companies,
            clients,
            pickup_locations,
            rate_slabs,
            distances,
            driver,
        })
    }

    /// Pull the tenant's reference data and write it, plus the grant, atomically.
    async fn bootstrap(&self, validation: &InviteValidation) -> Result<JoinSummary, AppError> {
        let owner_id = validation.owner_id.as_str();
        let snapshot = self
            .fetch_snapshot(owner_id, &validation.driver_cloud_id)
            .await?;

        let mut tx = self.store.begin().await?;
        let companies = apply_documents_in::<Company>(&mut tx, owner_id, &snapshot.companies).await?;
        let clients = apply_documents_in::<Client>(&mut tx, owner_id, &snapshot.clients).await?;
        let pickup_locations =
            apply_documents_in::<PickupLocation>(&mut tx, owner_id, &snapshot.pickup_locations)
                .await?;
        let rate_slabs = apply_documents_in::<RateSlab>(&mut tx, owner_id, &snapshot.rate_slabs).await?;
        let distances =
            apply_documents_in::<PickupClientDistance>(&mut tx, owner_id, &snapshot.distances)
                .await?;

        let driver = decode_in::<Driver>(&mut tx, owner_id, &snapshot.driver)
            .await?
            .ok_or_else(|| AppError::Internal("Driver profile could not be decoded".to_string()))?;
        let driver_name = driver.name.clone();
        let driver_local_id = resolve_in(&mut tx, driver).await?.local_id();

        self.scope
            .scope()
            .ensure("bootstrap", owner_id)?;
        grant_driver_access_in(&mut tx, &validation.driver_cloud_id, owner_id).await?;

        let touched = [
            Company::KIND,
            Client::KIND,
            PickupLocation::KIND,
            RateSlab::KIND,
            PickupClientDistance::KIND,
            Driver::KIND,
        ]
        .iter()
        .map(|kind| (kind.table(), owner_id.to_string()))
        .collect();
        self.store.commit(tx, touched).await?;

        Ok(JoinSummary {
            owner_id: owner_id.to_string(),
            driver_cloud_id: validation.driver_cloud_id.clone(),
            driver_local_id,
            driver_name,
            companies: companies.applied,
            clients: clients.applied,
            pickup_locations: pickup_locations.applied,
            rate_slabs: rate_slabs.applied,
            distances: distances.applied,
        })
    }
}
