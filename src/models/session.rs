//! Session, persisted device preferences and start-up routing.

use serde::{Deserialize, Serialize};

/// Who is using the device right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Session {
    NotLoggedIn,
    #[serde(rename_all = "camelCase")]
    Owner { owner_id: String },
    /// `driver_id` is the driver's cloud id; it is the same on every device.
    #[serde(rename_all = "camelCase")]
    Driver { driver_id: String, owner_id: String },
}

impl Session {
    /// Tenant this session is scoped to.
    pub fn owner_id(&self) -> Option<&str> {
        match self {
            Session::NotLoggedIn => None,
            Session::Owner { owner_id } | Session::Driver { owner_id, .. } => Some(owner_id),
        }
    }

    pub fn driver_cloud_id(&self) -> Option<&str> {
        match self {
            Session::Driver { driver_id, .. } => Some(driver_id),
            _ => None,
        }
    }

    pub fn is_owner(&self) -> bool {
        matches!(self, Session::Owner { .. })
    }
}

/// Preference keys in the local key-value table.
pub mod pref_keys {
    pub const FIRST_LAUNCH: &str = "firstLaunch";
    pub const LICENSE_ACTIVATED: &str = "licenseActivated";
    pub const DRIVER_ACCESS_GRANTED: &str = "driverAccessGranted";
    pub const LINKED_DRIVER_ID: &str = "linkedDriverId";
    pub const LINKED_OWNER_ID: &str = "linkedOwnerId";
    pub const OWNER_PIN_HASH: &str = "ownerPinHash";
    pub const LAST_BACKUP_TIME: &str = "lastBackupTime";
    pub const DEVICE_ID: &str = "deviceId";
}

/// Persisted device state that decides which flow runs at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppPrefs {
    pub first_launch: bool,
    pub license_activated: bool,
    pub driver_access_granted: bool,
    pub linked_driver_id: Option<String>,
    pub linked_owner_id: Option<String>,
    #[serde(skip)]
    pub owner_pin_hash: Option<String>,
    pub last_backup_time: Option<String>,
}

impl Default for AppPrefs {
    fn default() -> Self {
        Self {
            first_launch: true,
            license_activated: false,
            driver_access_granted: false,
            linked_driver_id: None,
            linked_owner_id: None,
            owner_pin_hash: None,
            last_backup_time: None,
        }
    }
}

/// Flow to show when the app starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "camelCase")]
pub enum LaunchRoute {
    Onboarding,
    InviteJoin,
    OwnerSetup,
    OwnerPinLogin,
    #[serde(rename_all = "camelCase")]
    DriverHome { driver_id: String, owner_id: String },
}

impl LaunchRoute {
    /// Pure function of the persisted preferences, re-evaluated every launch.
    pub fn from_prefs(prefs: &AppPrefs) -> Self {
        if prefs.driver_access_granted {
            if let (Some(driver_id), Some(owner_id)) =
                (&prefs.linked_driver_id, &prefs.linked_owner_id)
            {
                if !driver_id.is_empty() && !owner_id.is_empty() {
                    return LaunchRoute::DriverHome {
                        driver_id: driver_id.clone(),
                        owner_id: owner_id.clone(),
                    };
                }
            }
        }
        if prefs.first_launch {
            return LaunchRoute::Onboarding;
        }
        if prefs.license_activated {
            return if prefs.owner_pin_hash.is_some() {
                LaunchRoute::OwnerPinLogin
            } else {
                LaunchRoute::OwnerSetup
            };
        }
        LaunchRoute::InviteJoin
    }
}

/// The tenant's own profile, present only on the owner's device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerProfile {
    pub owner_id: String,
    pub business_name: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_device_goes_to_onboarding() {
        assert_eq!(
            LaunchRoute::from_prefs(&AppPrefs::default()),
            LaunchRoute::Onboarding
        );
    }

    #[test]
    fn test_granted_driver_skips_invite_flow() {
        let prefs = AppPrefs {
            first_launch: false,
            driver_access_granted: true,
            linked_driver_id: Some("drv-1".into()),
            linked_owner_id: Some("owner-1".into()),
            ..Default::default()
        };
        assert_eq!(
            LaunchRoute::from_prefs(&prefs),
            LaunchRoute::DriverHome {
                driver_id: "drv-1".into(),
                owner_id: "owner-1".into()
            }
        );
    }

    #[test]
    fn test_grant_without_link_is_ignored() {
        let prefs = AppPrefs {
            first_launch: false,
            driver_access_granted: true,
            linked_owner_id: Some("owner-1".into()),
            ..Default::default()
        };
        assert_eq!(LaunchRoute::from_prefs(&prefs), LaunchRoute::InviteJoin);
    }

    #[test]
    fn test_activated_owner_routes() {
        let mut prefs = AppPrefs {
            first_launch: false,
            license_activated: true,
            ..Default::default()
        };
        assert_eq!(LaunchRoute::from_prefs(&prefs), LaunchRoute::OwnerSetup);
        prefs.owner_pin_hash = Some("salt$hash".into());
        assert_eq!(LaunchRoute::from_prefs(&prefs), LaunchRoute::OwnerPinLogin);
    }

    #[test]
    fn test_session_owner_id() {
        assert_eq!(Session::NotLoggedIn.owner_id(), None);
        let driver = Session::Driver {
            driver_id: "drv-1".into(),
            owner_id: "owner-1".into(),
        };
        assert_eq!(driver.owner_id(), Some("owner-1"));
        assert_eq!(driver.driver_cloud_id(), Some("drv-1"));
        assert!(!driver.is_owner());
    }
}
