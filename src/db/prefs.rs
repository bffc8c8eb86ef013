//! Process-wide key-value preferences and the owner profile.

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use super::repository::LocalStore;
use crate::errors::AppError;
use crate::models::{pref_keys, AppPrefs, OwnerProfile};

fn parse_flag(value: Option<&String>, default: bool) -> bool {
    value.map(|v| v == "true").unwrap_or(default)
}

pub(crate) async fn set_pref_in(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO prefs (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Write the driver grant. Callers issue this as the final statement of a join.
pub(crate) async fn grant_driver_access_in(
    conn: &mut SqliteConnection,
    driver_cloud_id: &str,
    owner_id: &str,
) -> Result<(), AppError> {
    set_pref_in(conn, pref_keys::LINKED_DRIVER_ID, driver_cloud_id).await?;
    set_pref_in(conn, pref_keys::LINKED_OWNER_ID, owner_id).await?;
    set_pref_in(conn, pref_keys::FIRST_LAUNCH, "false").await?;
    set_pref_in(conn, pref_keys::DRIVER_ACCESS_GRANTED, "true").await
}

impl LocalStore {
    pub async fn get_pref(&self, key: &str) -> Result<Option<String>, AppError> {
        let row = sqlx::query("SELECT value FROM prefs WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_pref(&self, key: &str, value: &str) -> Result<(), AppError> {
        let mut conn = self.pool().acquire().await?;
        set_pref_in(&mut conn, key, value).await
    }

    /// Load every start-up preference, falling back to fresh-install defaults.
    pub async fn load_prefs(&self) -> Result<AppPrefs, AppError> {
        let rows = sqlx::query("SELECT key, value FROM prefs")
            .fetch_all(self.pool())
            .await?;
        let values: std::collections::HashMap<String, String> = rows
            .iter()
            .map(|r| (r.get("key"), r.get("value")))
            .collect();

        let defaults = AppPrefs::default();
        Ok(AppPrefs {
            first_launch: parse_flag(values.get(pref_keys::FIRST_LAUNCH), defaults.first_launch),
            license_activated: parse_flag(
                values.get(pref_keys::LICENSE_ACTIVATED),
                defaults.license_activated,
            ),
            driver_access_granted: parse_flag(
                values.get(pref_keys::DRIVER_ACCESS_GRANTED),
                defaults.driver_access_granted,
            ),
            linked_driver_id: values.get(pref_keys::LINKED_DRIVER_ID).cloned(),
            linked_owner_id: values.get(pref_keys::LINKED_OWNER_ID).cloned(),
            owner_pin_hash: values.get(pref_keys::OWNER_PIN_HASH).cloned(),
            last_backup_time: values.get(pref_keys::LAST_BACKUP_TIME).cloned(),
        })
    }

    // ==================== OWNER PROFILE ====================

    pub async fn owner_profile(&self) -> Result<Option<OwnerProfile>, AppError> {
        let row = sqlx::query("SELECT owner_id, business_name, created_at FROM owner_profile LIMIT 1")
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| OwnerProfile {
            owner_id: r.get("owner_id"),
            business_name: r.get("business_name"),
            created_at: r.get("created_at"),
        }))
    }

    /// Create the owner profile and activate owner mode in one transaction.
    pub async fn save_owner_profile(
        &self,
        profile: &OwnerProfile,
        pin_hash: &str,
    ) -> Result<(), AppError> {
        let mut tx = self.begin().await?;
        sqlx::query("INSERT INTO owner_profile (owner_id, business_name, created_at) VALUES (?, ?, ?)")
            .bind(&profile.owner_id)
            .bind(&profile.business_name)
            .bind(&profile.created_at)
            .execute(&mut *tx)
            .await?;
        set_pref_in(&mut tx, pref_keys::OWNER_PIN_HASH, pin_hash).await?;
        set_pref_in(&mut tx, pref_keys::LICENSE_ACTIVATED, "true").await?;
        set_pref_in(&mut tx, pref_keys::FIRST_LAUNCH, "false").await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_database, timestamp};
    use tempfile::TempDir;

    async fn store() -> (LocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_database(&temp_dir.path().join("test.sqlite"))
            .await
            .unwrap();
        (LocalStore::new(pool), temp_dir)
    }

    #[tokio::test]
    async fn test_fresh_prefs_are_defaults() {
        let (store, _dir) = store().await;
        assert_eq!(store.load_prefs().await.unwrap(), AppPrefs::default());
    }

    #[tokio::test]
    async fn test_grant_round_trip() {
        let (store, _dir) = store().await;
        let mut conn = store.pool().acquire().await.unwrap();
        grant_driver_access_in(&mut conn, "drv-1", "owner-1")
            .await
            .unwrap();
        drop(conn);

        let prefs = store.load_prefs().await.unwrap();
        assert!(prefs.driver_access_granted);
        assert!(!prefs.first_launch);
        assert_eq!(prefs.linked_driver_id.as_deref(), Some("drv-1"));
        assert_eq!(prefs.linked_owner_id.as_deref(), Some("owner-1"));
    }

    #[tokio::test]
    async fn test_owner_profile_activates_license() {
        let (store, _dir) = store().await;
        let profile = OwnerProfile {
            owner_id: "owner-1".into(),
            business_name: "Sharma Transport".into(),
            created_at: timestamp(),
        };
        store.save_owner_profile(&profile, "salt$hash").await.unwrap();

        assert_eq!(store.owner_profile().await.unwrap(), Some(profile));
        let prefs = store.load_prefs().await.unwrap();
        assert!(prefs.license_activated);
        assert_eq!(prefs.owner_pin_hash.as_deref(), Some("salt$hash"));
    }
}
