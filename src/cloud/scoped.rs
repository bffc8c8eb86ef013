//! Tenant-checked access to the cloud store.

use std::sync::Arc;

use serde_json::Value;

use super::{CloudDocument, CloudStore, OWNER_FIELD};
use crate::errors::AppError;
use crate::scope::TenantScope;

/// Cloud client bound to the current tenant scope.
///
/// Each call names the tenant it was started for. The call fails if that is
/// not the current scope, both before the request and after it returns.
#[derive(Clone)]
pub struct ScopedCloud {
    cloud: Arc<dyn CloudStore>,
    scope: TenantScope,
}

impl ScopedCloud {
    pub fn new(cloud: Arc<dyn CloudStore>, scope: TenantScope) -> Self {
        Self { cloud, scope }
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    /// Write a tenant document with set-with-merge semantics.
    pub async fn push(
        &self,
        owner_id: &str,
        collection: &str,
        doc_id: &str,
        mut data: Value,
    ) -> Result<(), AppError> {
        self.scope.ensure("push", owner_id)?;
        if let Some(fields) = data.as_object_mut() {
            fields.insert(OWNER_FIELD.to_string(), Value::String(owner_id.to_string()));
        }
        self.cloud
            .set_document(owner_id, collection, doc_id, data)
            .await?;
        self.scope.ensure("push", owner_id)
    }

    /// Every document of a collection belonging to `owner_id`.
    pub async fn pull(&self, owner_id: &str, collection: &str) -> Result<Vec<CloudDocument>, AppError> {
        self.scope.ensure("pull", owner_id)?;
        let documents = self.cloud.list_documents(owner_id, collection).await?;
        self.scope.ensure("pull", owner_id)?;
        Ok(retain_tenant(owner_id, collection, documents))
    }

    pub async fn get(
        &self,
        owner_id: &str,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<CloudDocument>, AppError> {
        self.scope.ensure("get", owner_id)?;
        let document = self.cloud.get_document(owner_id, collection, doc_id).await?;
        self.scope.ensure("get", owner_id)?;
        Ok(document.filter(|doc| doc.owner_id() == Some(owner_id)))
    }
}

fn retain_tenant(owner_id: &str, collection: &str, documents: Vec<CloudDocument>) -> Vec<CloudDocument> {
    let total = documents.len();
    let kept: Vec<CloudDocument> = documents
        .into_iter()
        .filter(|doc| doc.owner_id() == Some(owner_id))
        .collect();
    if kept.len() < total {
        tracing::warn!(
            owner_id,
            collection,
            dropped = total - kept.len(),
            "Dropped cloud documents belonging to another tenant"
        );
    }
    kept
}
