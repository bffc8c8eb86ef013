//! Tenant Scope Manager.
//!
//! Holds the current [`Session`] and hands out read-only [`TenantScope`]
//! handles. Every cloud call checks its handle before it touches the network.

use std::sync::Arc;

use tokio::sync::watch;

use crate::errors::AppError;
use crate::models::Session;

/// Process-wide owner of the current session.
#[derive(Clone)]
pub struct ScopeManager {
    tx: Arc<watch::Sender<Session>>,
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeManager {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Session::NotLoggedIn);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_owner_session(&self, owner_id: &str) -> Result<(), AppError> {
        if owner_id.trim().is_empty() {
            return Err(AppError::Validation("ownerId is required".to_string()));
        }
        tracing::info!(owner_id, "Owner session started");
        self.replace(Session::Owner {
            owner_id: owner_id.to_string(),
        });
        Ok(())
    }

    pub fn set_driver_session(&self, driver_id: &str, owner_id: &str) -> Result<(), AppError> {
        if driver_id.trim().is_empty() || owner_id.trim().is_empty() {
            return Err(AppError::Validation(
                "driverId and ownerId are required".to_string(),
            ));
        }
        tracing::info!(driver_id, owner_id, "Driver session started");
        self.replace(Session::Driver {
            driver_id: driver_id.to_string(),
            owner_id: owner_id.to_string(),
        });
        Ok(())
    }

    pub fn logout(&self) {
        if let Some(owner_id) = self.current().owner_id() {
            tracing::info!(owner_id, "Session ended");
        }
        self.replace(Session::NotLoggedIn);
    }

    pub fn current(&self) -> Session {
        self.tx.borrow().clone()
    }

    /// A handle that always observes the latest session.
    pub fn scope(&self) -> TenantScope {
        TenantScope {
            rx: self.tx.subscribe(),
        }
    }

    fn replace(&self, session: Session) {
        self.tx.send_replace(session);
    }
}

/// Read-only view of the current tenant, held by cloud clients.
#[derive(Clone)]
pub struct TenantScope {
    rx: watch::Receiver<Session>,
}

impl TenantScope {
    pub fn session(&self) -> Session {
        self.rx.borrow().clone()
    }

    pub fn current_owner(&self) -> Option<String> {
        self.rx.borrow().owner_id().map(str::to_string)
    }

    /// Tenant for a cloud operation, or `ScopeNotSet` if nobody is logged in.
    pub fn require(&self, operation: &str) -> Result<String, AppError> {
        self.current_owner().ok_or_else(|| {
            tracing::error!(operation, "Cloud operation attempted with no tenant scope");
            AppError::ScopeNotSet(format!("{} requires a tenant scope", operation))
        })
    }

    /// Fail unless the scope is still `owner_id`.
    pub fn ensure(&self, operation: &str, owner_id: &str) -> Result<(), AppError> {
        let current = self.require(operation)?;
        if current != owner_id {
            tracing::warn!(
                operation,
                expected = owner_id,
                current = current.as_str(),
                "Tenant scope changed during operation"
            );
            return Err(AppError::ScopeChanged(format!(
                "{} started for another tenant",
                operation
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_follows_session() {
        let manager = ScopeManager::new();
        let scope = manager.scope();
        assert!(scope.current_owner().is_none());

        manager.set_owner_session("owner-1").unwrap();
        assert_eq!(scope.current_owner().as_deref(), Some("owner-1"));

        manager.set_driver_session("drv-1", "owner-2").unwrap();
        assert_eq!(scope.current_owner().as_deref(), Some("owner-2"));
        assert_eq!(manager.current().driver_cloud_id(), Some("drv-1"));

        manager.logout();
        assert_eq!(manager.current(), Session::NotLoggedIn);
    }

    #[test]
    fn test_require_without_session_is_an_error() {
        let manager = ScopeManager::new();
        let result = manager.scope().require("push");
        assert!(matches!(result, Err(AppError::ScopeNotSet(_))));
    }

    #[test]
    fn test_ensure_detects_tenant_switch() {
        let manager = ScopeManager::new();
        let scope = manager.scope();
        manager.set_owner_session("owner-1").unwrap();
        assert!(scope.ensure("pull", "owner-1").is_ok());

        manager.set_owner_session("owner-2").unwrap();
        assert!(matches!(
            scope.ensure("pull", "owner-1"),
            Err(AppError::ScopeChanged(_))
        ));
    }

    #[test]
    fn test_empty_ids_rejected() {
        let manager = ScopeManager::new();
        assert!(manager.set_owner_session("").is_err());
        assert!(manager.set_driver_session("drv-1", " ").is_err());
        assert_eq!(manager.current(), Session::NotLoggedIn);
    }
}
