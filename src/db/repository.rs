//! Local Store: tenant-scoped CRUD and sync bookkeeping for every syncable table.
//!
//! Statements are built from each record's column list, so one implementation
//! serves every entity type. Connection-level helpers take a
//! `&mut SqliteConnection` and run inside whatever transaction the caller
//! holds; the `LocalStore` methods wrap them in their own transaction.

use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection};
use sqlx::{Row, SqlitePool, Transaction};

use super::changes::{ChangeFeed, Subscription, TableChange};
use super::timestamp;
use crate::errors::AppError;
use crate::models::{EntityKind, FieldValue, SyncRecord};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Tables touched by a transaction, published once it commits.
pub type Touched = Vec<(&'static str, String)>;

/// Counts of records still owed to the cloud.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub pending: i64,
    pub failed: i64,
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: FieldValue) -> SqliteQuery<'q> {
    match value {
        FieldValue::Text(v) => query.bind(v),
        FieldValue::Integer(v) => query.bind(v),
        FieldValue::Real(v) => query.bind(v),
        FieldValue::Null => query.bind(Option::<String>::None),
    }
}

/// Map constraint violations raised by triggers and checks to domain errors.
fn map_write_error(err: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db_err) = &err {
        let message = db_err.message().to_string();
        if message.contains("immutable") || message.contains("append-only") {
            return AppError::Conflict(message);
        }
        if message.contains("CHECK constraint failed") || message.contains("NOT NULL") {
            return AppError::Validation(message);
        }
    }
    AppError::from(err)
}

// ==================== CONNECTION-LEVEL HELPERS ====================

/// Insert a record as-is. Duplicate logical keys are allowed at this layer.
pub(crate) async fn insert_record<T: SyncRecord>(
    conn: &mut SqliteConnection,
    record: &T,
) -> Result<i64, AppError> {
    record.validate()?;
    let meta = record.meta();
    if meta.owner_id.trim().is_empty() {
        return Err(AppError::Validation("ownerId is required".to_string()));
    }

    let columns = record.columns();
    let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
    let placeholders = vec!["?"; names.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} (cloud_id, owner_id, logical_key, sync_attempts, dirty, synced_at, created_at, {}) VALUES (?, ?, ?, 0, 0, ?, ?, {})",
        T::KIND.table(),
        names.join(", "),
        placeholders
    );

    let created_at = if meta.created_at.is_empty() {
        timestamp()
    } else {
        meta.created_at.clone()
    };
    let synced_at = meta.cloud_id.as_ref().map(|_| timestamp());

    let mut query = sqlx::query(&sql)
        .bind(&meta.cloud_id)
        .bind(&meta.owner_id)
        .bind(record.logical_key())
        .bind(synced_at)
        .bind(created_at);
    for (_, value) in columns {
        query = bind_value(query, value);
    }

    let result = query
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    Ok(result.last_insert_rowid())
}

/// Fetch rows of `T` matching a WHERE clause.
pub(crate) async fn fetch_where<T: SyncRecord>(
    conn: &mut SqliteConnection,
    clause: &str,
    binds: Vec<FieldValue>,
) -> Result<Vec<T>, AppError> {
    let sql = format!("SELECT * FROM {} WHERE {}", T::KIND.table(), clause);
    let mut query = sqlx::query(&sql);
    for value in binds {
        query = bind_value(query, value);
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter()
        .map(T::from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(AppError::from)
}

pub(crate) async fn fetch_by_local_id<T: SyncRecord>(
    conn: &mut SqliteConnection,
    local_id: i64,
) -> Result<Option<T>, AppError> {
    let mut rows = fetch_where::<T>(conn, "local_id = ?", vec![local_id.into()]).await?;
    Ok(rows.pop())
}

pub(crate) async fn fetch_by_cloud_id<T: SyncRecord>(
    conn: &mut SqliteConnection,
    cloud_id: &str,
) -> Result<Option<T>, AppError> {
    let mut rows = fetch_where::<T>(conn, "cloud_id = ?", vec![cloud_id.into()]).await?;
    Ok(rows.pop())
}

/// Oldest row of `T` for a tenant with the given logical key, synced or not.
pub(crate) async fn fetch_by_logical_key<T: SyncRecord>(
    conn: &mut SqliteConnection,
    owner_id: &str,
    logical_key: &str,
) -> Result<Option<T>, AppError> {
    let mut rows = fetch_where::<T>(
        conn,
        "owner_id = ? AND logical_key = ? ORDER BY local_id LIMIT 1",
        vec![owner_id.into(), logical_key.into()],
    )
    .await?;
    Ok(rows.pop())
}

/// Oldest unsynced row of `T` for a tenant sharing the given logical key.
pub(crate) async fn fetch_orphan<T: SyncRecord>(
    conn: &mut SqliteConnection,
    owner_id: &str,
    logical_key: &str,
) -> Result<Option<T>, AppError> {
    let mut rows = fetch_where::<T>(
        conn,
        "owner_id = ? AND logical_key = ? AND cloud_id IS NULL ORDER BY local_id LIMIT 1",
        vec![owner_id.into(), logical_key.into()],
    )
    .await?;
    Ok(rows.pop())
}

/// Overwrite a row with the cloud version and pin it to `cloud_id`.
///
/// Fails with `Conflict` if the row already carries a different cloud id.
pub(crate) async fn apply_cloud_version<T: SyncRecord>(
    conn: &mut SqliteConnection,
    local_id: i64,
    record: &T,
    cloud_id: &str,
) -> Result<(), AppError> {
    record.validate()?;
    let columns: Vec<(&'static str, FieldValue)> = record
        .columns()
        .into_iter()
        .filter(|(name, _)| !T::IMMUTABLE_COLUMNS.contains(name))
        .collect();
    let assignments: Vec<String> = columns
        .iter()
        .map(|(name, _)| format!("{} = ?", name))
        .collect();
    let sql = format!(
        "UPDATE {} SET cloud_id = ?, synced_at = ?, sync_attempts = 0, dirty = 0, last_sync_error = NULL, logical_key = ?, {} WHERE local_id = ? AND (cloud_id IS NULL OR cloud_id = ?)",
        T::KIND.table(),
        assignments.join(", ")
    );

    let mut query = sqlx::query(&sql)
        .bind(cloud_id)
        .bind(timestamp())
        .bind(record.logical_key());
    for (_, value) in columns {
        query = bind_value(query, value);
    }
    let result = query
        .bind(local_id)
        .bind(cloud_id)
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;

    if result.rows_affected() == 0 {
        return Err(AppError::Conflict(format!(
            "{} row {} is already bound to another cloud id",
            T::KIND.table(),
            local_id
        )));
    }
    Ok(())
}

/// Persist a local edit of an existing row. Synced rows become dirty so the edit is pushed.
pub(crate) async fn update_local<T: SyncRecord>(
    conn: &mut SqliteConnection,
    record: &T,
) -> Result<(), AppError> {
    record.validate()?;
    let columns: Vec<(&'static str, FieldValue)> = record
        .columns()
        .into_iter()
        .filter(|(name, _)| !T::IMMUTABLE_COLUMNS.contains(name))
        .collect();
    let assignments: Vec<String> = columns
        .iter()
        .map(|(name, _)| format!("{} = ?", name))
        .collect();
    let sql = format!(
        "UPDATE {} SET logical_key = ?, sync_attempts = 0, last_sync_error = NULL, dirty = CASE WHEN cloud_id IS NULL THEN 0 ELSE 1 END, {} WHERE local_id = ? AND owner_id = ?",
        T::KIND.table(),
        assignments.join(", ")
    );

    let mut query = sqlx::query(&sql).bind(record.logical_key());
    for (_, value) in columns {
        query = bind_value(query, value);
    }
    let result = query
        .bind(record.meta().local_id)
        .bind(&record.meta().owner_id)
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "{} row {} not found",
            T::KIND.table(),
            record.meta().local_id
        )));
    }
    Ok(())
}

/// Increment the revision ID and return the new value.
pub(crate) async fn bump_revision(conn: &mut SqliteConnection) -> Result<i64, AppError> {
    let row = sqlx::query(
        "UPDATE meta SET revision_id = revision_id + 1, generated_at = ? WHERE id = 1 RETURNING revision_id",
    )
    .bind(timestamp())
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.get("revision_id"))
}

// ==================== LOCAL STORE ====================

/// Durable, transactional storage of all tenant entities on this device.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    changes: ChangeFeed,
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            changes: ChangeFeed::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Listen for commits touching `table` that match `predicate`.
    pub fn subscribe<F>(&self, table: &'static str, predicate: F) -> Subscription
    where
        F: Fn(&TableChange) -> bool + Send + Sync + 'static,
    {
        self.changes.subscribe(table, predicate)
    }

    /// Get the current revision ID.
    pub async fn get_revision_id(&self) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT revision_id FROM meta WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("revision_id"))
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, AppError> {
        Ok(self.pool.begin().await?)
    }

    /// Bump the revision inside `tx`, commit, then notify listeners.
    pub async fn commit(
        &self,
        mut tx: Transaction<'static, Sqlite>,
        touched: Touched,
    ) -> Result<i64, AppError> {
        let revision = bump_revision(&mut tx).await?;
        tx.commit().await?;
        for (table, owner_id) in &touched {
            self.changes.publish(table, owner_id, revision);
        }
        Ok(revision)
    }

    // ==================== RECORD OPERATIONS ====================

    /// Insert a single record and return its local id.
    pub async fn insert<T: SyncRecord>(&self, record: &T) -> Result<i64, AppError> {
        let mut tx = self.begin().await?;
        let local_id = insert_record(&mut tx, record).await?;
        self.commit(tx, vec![(T::KIND.table(), record.meta().owner_id.clone())])
            .await?;
        Ok(local_id)
    }

    /// Insert records all-or-nothing. Any failure rolls back every row in the batch.
    pub async fn batch_insert<T: SyncRecord>(&self, records: &[T]) -> Result<Vec<i64>, AppError> {
        let mut tx = self.begin().await?;
        let mut ids = Vec::with_capacity(records.len());
        let mut touched = Touched::new();
        for record in records {
            ids.push(insert_record(&mut tx, record).await?);
            let owner = record.meta().owner_id.clone();
            if !touched.iter().any(|(_, o)| *o == owner) {
                touched.push((T::KIND.table(), owner));
            }
        }
        self.commit(tx, touched).await?;
        Ok(ids)
    }

    pub async fn get<T: SyncRecord>(&self, local_id: i64) -> Result<Option<T>, AppError> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_local_id(&mut conn, local_id).await
    }

    /// Get a record by local id, requiring it to belong to `owner_id`.
    pub async fn get_owned<T: SyncRecord>(
        &self,
        owner_id: &str,
        local_id: i64,
    ) -> Result<T, AppError> {
        self.get::<T>(local_id)
            .await?
            .filter(|record| record.meta().owner_id == owner_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("{} {} not found", T::KIND.table(), local_id))
            })
    }

    /// First row of `T` for a tenant with the given logical key, synced or not.
    pub async fn find_by_logical_key<T: SyncRecord>(
        &self,
        owner_id: &str,
        logical_key: &str,
    ) -> Result<Option<T>, AppError> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_logical_key(&mut conn, owner_id, logical_key).await
    }

    pub async fn find_by_cloud_id<T: SyncRecord>(
        &self,
        cloud_id: &str,
    ) -> Result<Option<T>, AppError> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_cloud_id(&mut conn, cloud_id).await
    }

    /// All rows of `T` belonging to a tenant, oldest first.
    pub async fn list<T: SyncRecord>(&self, owner_id: &str) -> Result<Vec<T>, AppError> {
        let mut conn = self.pool.acquire().await?;
        fetch_where::<T>(
            &mut conn,
            "owner_id = ? ORDER BY created_at, local_id",
            vec![owner_id.into()],
        )
        .await
    }

    /// Rows of a driver-scoped type for one driver.
    pub async fn list_for_driver<T: SyncRecord>(
        &self,
        owner_id: &str,
        driver_id: i64,
    ) -> Result<Vec<T>, AppError> {
        let mut conn = self.pool.acquire().await?;
        fetch_where::<T>(
            &mut conn,
            "owner_id = ? AND driver_id = ? ORDER BY created_at, local_id",
            vec![owner_id.into(), driver_id.into()],
        )
        .await
    }

    /// Rows owed to the cloud for a tenant, oldest first, excluding failed ones.
    pub async fn pending<T: SyncRecord>(
        &self,
        owner_id: &str,
        max_attempts: i64,
    ) -> Result<Vec<T>, AppError> {
        let mut conn = self.pool.acquire().await?;
        fetch_where::<T>(
            &mut conn,
            "owner_id = ? AND (cloud_id IS NULL OR dirty = 1) AND sync_attempts < ? ORDER BY created_at, local_id",
            vec![owner_id.into(), max_attempts.into()],
        )
        .await
    }

    // ==================== SYNC BOOKKEEPING ====================

    /// Record a successful push. Resets the attempt counter and clears the dirty flag.
    pub async fn mark_synced(
        &self,
        kind: EntityKind,
        local_id: i64,
        cloud_id: &str,
        synced_at: &str,
    ) -> Result<(), AppError> {
        let mut tx = self.begin().await?;
        let sql = format!(
            "UPDATE {} SET cloud_id = ?, synced_at = ?, sync_attempts = 0, dirty = 0, last_sync_error = NULL WHERE local_id = ? AND (cloud_id IS NULL OR cloud_id = ?) RETURNING owner_id",
            kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(cloud_id)
            .bind(synced_at)
            .bind(local_id)
            .bind(cloud_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_write_error)?;

        let Some(row) = row else {
            let exists = fetch_exists(&mut tx, kind, local_id).await?;
            return Err(if exists {
                AppError::Conflict(format!(
                    "{} row {} already has a different cloud id",
                    kind.table(),
                    local_id
                ))
            } else {
                AppError::NotFound(format!("{} row {} not found", kind.table(), local_id))
            });
        };

        let owner_id: String = row.get("owner_id");
        self.commit(tx, vec![(kind.table(), owner_id)]).await?;
        Ok(())
    }

    /// Atomically bump the attempt counter and return the new value.
    pub async fn increment_sync_attempts(
        &self,
        kind: EntityKind,
        local_id: i64,
        error: &str,
    ) -> Result<i64, AppError> {
        let mut tx = self.begin().await?;
        let sql = format!(
            "UPDATE {} SET sync_attempts = sync_attempts + 1, last_sync_error = ? WHERE local_id = ? RETURNING sync_attempts, owner_id",
            kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(error)
            .bind(local_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("{} row {} not found", kind.table(), local_id))
            })?;

        let attempts: i64 = row.get("sync_attempts");
        let owner_id: String = row.get("owner_id");
        self.commit(tx, vec![(kind.table(), owner_id)]).await?;
        Ok(attempts)
    }

    pub async fn reset_sync_attempts(&self, kind: EntityKind, local_id: i64) -> Result<(), AppError> {
        let mut tx = self.begin().await?;
        let sql = format!(
            "UPDATE {} SET sync_attempts = 0, last_sync_error = NULL WHERE local_id = ? RETURNING owner_id",
            kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(local_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("{} row {} not found", kind.table(), local_id))
            })?;

        let owner_id: String = row.get("owner_id");
        self.commit(tx, vec![(kind.table(), owner_id)]).await?;
        Ok(())
    }

    /// Make every failed row of a tenant eligible for the next pass again.
    pub async fn reset_failed(&self, owner_id: &str, max_attempts: i64) -> Result<u64, AppError> {
        let mut tx = self.begin().await?;
        let mut reset = 0;
        let mut touched = Touched::new();
        for kind in EntityKind::ALL {
            let sql = format!(
                "UPDATE {} SET sync_attempts = 0, last_sync_error = NULL WHERE owner_id = ? AND (cloud_id IS NULL OR dirty = 1) AND sync_attempts >= ?",
                kind.table()
            );
            let result = sqlx::query(&sql)
                .bind(owner_id)
                .bind(max_attempts)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                reset += result.rows_affected();
                touched.push((kind.table(), owner_id.to_string()));
            }
        }
        self.commit(tx, touched).await?;
        Ok(reset)
    }

    /// Pending and failed totals across every syncable table for a tenant.
    pub async fn sync_counts(&self, owner_id: &str, max_attempts: i64) -> Result<SyncCounts, AppError> {
        let mut counts = SyncCounts::default();
        for kind in EntityKind::ALL {
            let sql = format!(
                "SELECT SUM(CASE WHEN sync_attempts < ? THEN 1 ELSE 0 END) AS pending, SUM(CASE WHEN sync_attempts >= ? THEN 1 ELSE 0 END) AS failed FROM {} WHERE owner_id = ? AND (cloud_id IS NULL OR dirty = 1)",
                kind.table()
            );
            let row = sqlx::query(&sql)
                .bind(max_attempts)
                .bind(max_attempts)
                .bind(owner_id)
                .fetch_one(&self.pool)
                .await?;
            let pending: Option<i64> = row.get("pending");
            let failed: Option<i64> = row.get("failed");
            counts.pending += pending.unwrap_or(0);
            counts.failed += failed.unwrap_or(0);
        }
        Ok(counts)
    }
}

async fn fetch_exists(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    local_id: i64,
) -> Result<bool, AppError> {
    let sql = format!("SELECT 1 FROM {} WHERE local_id = ?", kind.table());
    let row = sqlx::query(&sql)
        .bind(local_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}
