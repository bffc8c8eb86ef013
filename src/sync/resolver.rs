//! Dedup Resolver: maps incoming records onto existing local rows.
//!
//! A record arriving with a cloud id is matched by that id first, then by
//! logical key against rows that have never been pushed, then inserted.
//! Records without a cloud id (local creation) collapse onto any existing row
//! with the same logical key.

use serde_json::Value;
use sqlx::sqlite::SqliteConnection;

use crate::cloud::{CloudDocument, DRIVER_FIELD};
use crate::db::{
    apply_cloud_version, fetch_by_cloud_id, fetch_by_logical_key, fetch_orphan, insert_record,
    LocalStore,
};
use crate::errors::AppError;
use crate::models::{Driver, SyncMeta, SyncRecord};

/// What the resolver did with an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A new local row was created.
    Inserted(i64),
    /// An unsynced local row took over the incoming cloud id.
    Adopted(i64),
    /// The row already bound to the cloud id was refreshed from the cloud.
    Updated(i64),
    /// The record was already present and nothing was written.
    Existing(i64),
}

impl Resolution {
    pub fn local_id(&self) -> i64 {
        match self {
            Resolution::Inserted(id)
            | Resolution::Adopted(id)
            | Resolution::Updated(id)
            | Resolution::Existing(id) => *id,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Inserted(_) => "inserted",
            Resolution::Adopted(_) => "adopted",
            Resolution::Updated(_) => "updated",
            Resolution::Existing(_) => "existing",
        }
    }
}

/// Resolve one record inside the caller's transaction.
pub(crate) async fn resolve_in<T: SyncRecord>(
    conn: &mut SqliteConnection,
    record: T,
) -> Result<Resolution, AppError> {
    let owner_id = record.meta().owner_id.clone();
    if owner_id.trim().is_empty() {
        return Err(AppError::Validation("ownerId is required".to_string()));
    }
    let logical_key = record.logical_key();

    let Some(cloud_id) = record.meta().cloud_id.clone() else {
        if let Some(existing) = fetch_by_logical_key::<T>(conn, &owner_id, &logical_key).await? {
            tracing::debug!(table = T::KIND.table(), local_id = existing.meta().local_id, "Duplicate local record collapsed");
            return Ok(Resolution::Existing(existing.meta().local_id));
        }
        return Ok(Resolution::Inserted(insert_record(conn, &record).await?));
    };

    if let Some(existing) = fetch_by_cloud_id::<T>(conn, &cloud_id).await? {
        let meta = existing.meta();
        if meta.owner_id != owner_id {
            tracing::error!(table = T::KIND.table(), cloud_id = cloud_id.as_str(), "Cloud id already bound to another tenant");
            return Err(AppError::Conflict(format!(
                "Cloud id {} belongs to another tenant",
                cloud_id
            )));
        }
        if meta.dirty {
            // Keep the unpushed local edit; the next push merges it into the cloud
            return Ok(Resolution::Existing(meta.local_id));
        }
        apply_cloud_version(conn, meta.local_id, &record, &cloud_id).await?;
        return Ok(Resolution::Updated(meta.local_id));
    }

    if let Some(orphan) = fetch_orphan::<T>(conn, &owner_id, &logical_key).await? {
        let local_id = orphan.meta().local_id;
        apply_cloud_version(conn, local_id, &record, &cloud_id).await?;
        tracing::info!(table = T::KIND.table(), local_id, cloud_id = cloud_id.as_str(), "Adopted cloud id onto local record");
        return Ok(Resolution::Adopted(local_id));
    }

    Ok(Resolution::Inserted(insert_record(conn, &record).await?))
}

/// Turn a cloud document into a record for `owner_id`.
///
/// Driver-scoped documents name their driver by cloud id; that is translated
/// to the local driver row. Returns `None` when the driver is not known locally.
pub(crate) async fn decode_in<T: SyncRecord>(
    conn: &mut SqliteConnection,
    owner_id: &str,
    document: &CloudDocument,
) -> Result<Option<T>, AppError> {
    let mut record: T = serde_json::from_value(document.data.clone()).map_err(|e| {
        AppError::Validation(format!(
            "Malformed {} document {}: {}",
            T::KIND.collection(),
            document.id,
            e
        ))
    })?;
    *record.meta_mut() = SyncMeta::from_cloud(owner_id, &document.id);
    if let Some(created_at) = document.data.get("createdAt").and_then(Value::as_str) {
        record.meta_mut().created_at = created_at.to_string();
    }

    if T::KIND.is_driver_scoped() {
        let Some(driver_cloud_id) = document.driver_cloud_id() else {
            return Err(AppError::Validation(format!(
                "{} document {} has no {}",
                T::KIND.collection(),
                document.id,
                DRIVER_FIELD
            )));
        };
        match fetch_by_cloud_id::<Driver>(conn, driver_cloud_id).await? {
            Some(driver) if driver.meta.owner_id == owner_id => {
                record.set_driver_id(driver.meta.local_id)
            }
            _ => return Ok(None),
        }
    }
    Ok(Some(record))
}

/// Totals of one batch of pulled documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Decode and resolve pulled documents inside the caller's transaction.
///
/// Malformed documents, documents whose driver is unknown and documents that
/// clash with another tenant's identity are skipped.
pub(crate) async fn apply_documents_in<T: SyncRecord>(
    conn: &mut SqliteConnection,
    owner_id: &str,
    documents: &[CloudDocument],
) -> Result<ApplyReport, AppError> {
    let mut report = ApplyReport::default();
    for document in documents {
        let record = match decode_in::<T>(conn, owner_id, document).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                report.skipped += 1;
                continue;
            }
            Err(AppError::Validation(message)) => {
                tracing::warn!(collection = T::KIND.collection(), "{}", message);
                report.skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        match resolve_in(conn, record).await {
            Ok(_) => report.applied += 1,
            Err(AppError::Validation(message)) | Err(AppError::Conflict(message)) => {
                tracing::warn!(
                    collection = T::KIND.collection(),
                    doc_id = document.id.as_str(),
                    "Skipped cloud document: {}",
                    message
                );
                report.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

/// Pool-level entry points to the resolver, each in its own transaction.
#[derive(Clone)]
pub struct DedupResolver {
    store: LocalStore,
}

impl DedupResolver {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub async fn resolve<T: SyncRecord>(&self, record: T) -> Result<Resolution, AppError> {
        let owner_id = record.meta().owner_id.clone();
        let mut tx = self.store.begin().await?;
        let resolution = resolve_in(&mut tx, record).await?;
        self.store
            .commit(tx, vec![(T::KIND.table(), owner_id)])
            .await?;
        Ok(resolution)
    }

    /// Apply pulled documents of one collection in a single transaction.
    pub async fn apply_documents<T: SyncRecord>(
        &self,
        owner_id: &str,
        documents: &[CloudDocument],
    ) -> Result<ApplyReport, AppError> {
        let mut tx = self.store.begin().await?;
        let report = apply_documents_in::<T>(&mut tx, owner_id, documents).await?;
        self.store
            .commit(tx, vec![(T::KIND.table(), owner_id.to_string())])
            .await?;
        Ok(report)
    }
}
