//! Cloud Store Client.
//!
//! The cloud is a document store keyed by tenant and collection, plus the
//! global invite-code and driver-link collections used by the join flow.
//! [`CloudStore`] is the raw transport; tenant calls go through
//! [`ScopedCloud`], which refuses to run without a tenant scope.

mod http;
mod memory;
mod scoped;

pub use http::*;
pub use memory::*;
pub use scoped::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::AppError;
use crate::models::{DriverLink, InviteCode};

/// Length of a generated document id, in hex characters.
const DOCUMENT_ID_LEN: usize = 20;

/// Field every tenant document carries naming its tenant.
pub const OWNER_FIELD: &str = "ownerId";

/// Field naming the driver a driver-scoped document belongs to.
pub const DRIVER_FIELD: &str = "driverCloudId";

/// A document as stored in the cloud.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudDocument {
    pub id: String,
    pub data: Value,
}

impl CloudDocument {
    /// Tenant the document claims to belong to.
    pub fn owner_id(&self) -> Option<&str> {
        self.data.get(OWNER_FIELD).and_then(Value::as_str)
    }

    pub fn driver_cloud_id(&self) -> Option<&str> {
        self.data.get(DRIVER_FIELD).and_then(Value::as_str)
    }
}

/// Outcome of the atomic check-and-mark on an invite code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsumeOutcome {
    Consumed,
    AlreadyUsed,
    Expired,
    NotFound,
}

#[async_trait]
pub trait CloudStore: Send + Sync {
    /// Write a tenant document, merging into any existing fields.
    async fn set_document(
        &self,
        owner_id: &str,
        collection: &str,
        doc_id: &str,
        data: Value,
    ) -> Result<(), AppError>;

    async fn get_document(
        &self,
        owner_id: &str,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<CloudDocument>, AppError>;

    async fn list_documents(
        &self,
        owner_id: &str,
        collection: &str,
    ) -> Result<Vec<CloudDocument>, AppError>;

    async fn get_invite(&self, code: &str) -> Result<Option<InviteCode>, AppError>;

    /// Create an invite. Returns `false` if the code is already taken.
    async fn create_invite(&self, invite: &InviteCode) -> Result<bool, AppError>;

    /// Mark an invite used if, and only if, it is still unused and unexpired.
    ///
    /// `used_at` is the caller's clock. A hosted store ignores it and decides
    /// expiry by its own time.
    async fn consume_invite(
        &self,
        code: &str,
        device_id: &str,
        used_at: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, AppError>;

    async fn put_driver_link(&self, link: &DriverLink) -> Result<(), AppError>;
}

/// Deterministic document id for a logical fact of a tenant.
///
/// Two devices pushing the same fact write the same document.
pub fn document_id(owner_id: &str, collection: &str, logical_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(collection.as_bytes());
    hasher.update([0x1f]);
    hasher.update(logical_key.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(DOCUMENT_ID_LEN);
    id
}

/// Shallow merge of `incoming` into `existing`, as a set-with-merge write does.
pub(crate) fn merge_document(existing: &mut Value, incoming: Value) {
    match (existing.as_object_mut(), incoming) {
        (Some(target), Value::Object(fields)) => {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
        (_, incoming) => *existing = incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_id_is_deterministic_and_tenant_bound() {
        let a = document_id("owner-1", "fuel", "5|2024-03-01|500.00");
        let b = document_id("owner-1", "fuel", "5|2024-03-01|500.00");
        let other_owner = document_id("owner-2", "fuel", "5|2024-03-01|500.00");
        let other_collection = document_id("owner-1", "advances", "5|2024-03-01|500.00");

        assert_eq!(a, b);
        assert_eq!(a.len(), DOCUMENT_ID_LEN);
        assert_ne!(a, other_owner);
        assert_ne!(a, other_collection);
    }

    #[test]
    fn test_merge_keeps_unrelated_fields() {
        let mut doc = json!({ "amount": 500.0, "notes": "diesel" });
        merge_document(&mut doc, json!({ "amount": 550.0, "ownerId": "owner-1" }));
        assert_eq!(
            doc,
            json!({ "amount": 550.0, "notes": "diesel", "ownerId": "owner-1" })
        );
    }

    #[test]
    fn test_document_accessors() {
        let doc = CloudDocument {
            id: "F1".into(),
            data: json!({ "ownerId": "owner-1", "driverCloudId": "D1" }),
        };
        assert_eq!(doc.owner_id(), Some("owner-1"));
        assert_eq!(doc.driver_cloud_id(), Some("D1"));
    }
}
