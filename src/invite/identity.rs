//! Anonymous device identity used when a driver device joins a tenant.

use async_trait::async_trait;

use crate::db::LocalStore;
use crate::errors::AppError;
use crate::models::pref_keys;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Sign the device in without credentials and return its stable id.
    async fn sign_in_anonymously(&self) -> Result<String, AppError>;
}

/// Identity minted once per install and kept in the device preferences.
pub struct LocalDeviceIdentity {
    store: LocalStore,
}

impl LocalDeviceIdentity {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IdentityProvider for LocalDeviceIdentity {
    async fn sign_in_anonymously(&self) -> Result<String, AppError> {
        if let Some(device_id) = self.store.get_pref(pref_keys::DEVICE_ID).await? {
            return Ok(device_id);
        }
        let device_id = uuid::Uuid::new_v4().to_string();
        self.store.set_pref(pref_keys::DEVICE_ID, &device_id).await?;
        tracing::info!(device_id = device_id.as_str(), "Device identity created");
        Ok(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_device_id_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_database(&temp_dir.path().join("test.sqlite"))
            .await
            .unwrap();
        let identity = LocalDeviceIdentity::new(LocalStore::new(pool));

        let first = identity.sign_in_anonymously().await.unwrap();
        let second = identity.sign_in_anonymously().await.unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
