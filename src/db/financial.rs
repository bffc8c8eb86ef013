//! Multi-row financial mutations.
//!
//! Every write here runs inside one [`FinancialTx`]. Override-type mutations
//! register an audit obligation, and `commit` refuses to persist anything
//! while an obligation is outstanding.

use serde_json::json;
use sqlx::sqlite::{Sqlite, SqliteConnection};
use sqlx::{Row, Transaction};

use super::repository::{
    fetch_by_local_id, fetch_by_logical_key, fetch_where, insert_record, update_local, LocalStore, Touched,
};
use super::timestamp;
use crate::errors::AppError;
use crate::models::{
    Advance, AdvanceKind, AuditEntry, EntityKind, RateSlab, SyncMeta, SyncRecord, Trip,
};
use crate::sync::{resolve_in, Resolution};

/// Tolerance for floating-point money comparisons.
const BALANCE_EPSILON: f64 = 1e-6;

/// A transaction that enforces audit pairing for override-type mutations.
pub struct FinancialTx<'a> {
    store: &'a LocalStore,
    tx: Transaction<'static, Sqlite>,
    owner_id: String,
    obligations: Vec<(&'static str, i64)>,
    touched: Touched,
}

impl<'a> FinancialTx<'a> {
    pub async fn begin(store: &'a LocalStore, owner_id: &str) -> Result<Self, AppError> {
        if owner_id.trim().is_empty() {
            return Err(AppError::Validation("ownerId is required".to_string()));
        }
        Ok(Self {
            store,
            tx: store.begin().await?,
            owner_id: owner_id.to_string(),
            obligations: Vec::new(),
            touched: Touched::new(),
        })
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    fn touch(&mut self, table: &'static str) {
        if !self.touched.iter().any(|(t, _)| *t == table) {
            self.touched.push((table, self.owner_id.clone()));
        }
    }

    /// Declare that `record_id` of `table` needs an audit row before commit.
    pub fn require_audit(&mut self, table: &'static str, record_id: i64) {
        self.obligations.push((table, record_id));
    }

    async fn load_trip(&mut self, trip_id: i64) -> Result<Trip, AppError> {
        let owner_id = self.owner_id.clone();
        fetch_by_local_id::<Trip>(&mut self.tx, trip_id)
            .await?
            .filter(|trip| trip.meta.owner_id == owner_id)
            .ok_or_else(|| AppError::NotFound(format!("Trip {} not found", trip_id)))
    }

    pub async fn verify_trip(&mut self, trip_id: i64) -> Result<Trip, AppError> {
        let mut trip = self.load_trip(trip_id).await?;
        trip.verified = true;
        update_local(&mut self.tx, &trip).await?;
        self.touch(EntityKind::Trip.table());
        Ok(trip)
    }

    /// Override a trip's payable amount. Returns the trip as it was before and after.
    pub async fn override_trip(
        &mut self,
        trip_id: i64,
        amount: f64,
        reason: &str,
    ) -> Result<(Trip, Trip), AppError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(AppError::Validation(
                "Override amount must be a non-negative number".to_string(),
            ));
        }
        if reason.trim().is_empty() {
            return Err(AppError::Validation(
                "Override reason is required".to_string(),
            ));
        }

        let before = self.load_trip(trip_id).await?;
        let mut after = before.clone();
        after.overridden = true;
        after.override_amount = Some(amount);
        after.override_reason = Some(reason.trim().to_string());
        update_local(&mut self.tx, &after).await?;

        self.require_audit(EntityKind::Trip.table(), trip_id);
        self.touch(EntityKind::Trip.table());
        Ok((before, after))
    }

    /// Append an audit row, discharging any matching obligation.
    pub async fn write_audit(&mut self, entry: &AuditEntry) -> Result<i64, AppError> {
        if entry.owner_id != self.owner_id {
            return Err(AppError::Validation(
                "Audit entry belongs to another tenant".to_string(),
            ));
        }
        let result = sqlx::query(
            "INSERT INTO audit_log (owner_id, table_name, record_id, action, old_value, new_value, reason, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.owner_id)
        .bind(&entry.table_name)
        .bind(entry.record_id)
        .bind(&entry.action)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(&entry.reason)
        .bind(&entry.created_at)
        .execute(&mut *self.tx)
        .await?;

        self.obligations
            .retain(|(table, id)| !(*table == entry.table_name && *id == entry.record_id));
        Ok(result.last_insert_rowid())
    }

    /// Commit, or roll back with `AuditMissing` if an override was left unaudited.
    pub async fn commit(self) -> Result<i64, AppError> {
        if let Some((table, record_id)) = self.obligations.first() {
            tracing::error!(table, record_id, "Override attempted without audit entry");
            return Err(AppError::AuditMissing(format!(
                "{} row {} was overridden without an audit entry",
                table, record_id
            )));
        }
        self.store.commit(self.tx, self.touched).await
    }
}

pub(crate) async fn advance_balance_in(
    conn: &mut SqliteConnection,
    owner_id: &str,
    driver_id: i64,
) -> Result<f64, AppError> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(CASE WHEN kind = 'given' THEN amount ELSE -amount END), 0.0) AS balance FROM advances WHERE owner_id = ? AND driver_id = ?",
    )
    .bind(owner_id)
    .bind(driver_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.get("balance"))
}

fn audit_entry(
    owner_id: &str,
    table: &str,
    record_id: i64,
    action: &str,
    old_value: Option<String>,
    new_value: Option<String>,
    reason: &str,
) -> AuditEntry {
    AuditEntry {
        id: 0,
        owner_id: owner_id.to_string(),
        table_name: table.to_string(),
        record_id,
        action: action.to_string(),
        old_value,
        new_value,
        reason: reason.to_string(),
        created_at: timestamp(),
    }
}

fn check_slab_set(slabs: &[RateSlab]) -> Result<(), AppError> {
    let mut sorted: Vec<&RateSlab> = slabs.iter().collect();
    sorted.sort_by(|a, b| a.min_km.total_cmp(&b.min_km));
    for pair in sorted.windows(2) {
        if pair[1].min_km <= pair[0].max_km {
            return Err(AppError::Validation(format!(
                "Rate slabs {}-{} and {}-{} overlap",
                pair[0].min_km, pair[0].max_km, pair[1].min_km, pair[1].max_km
            )));
        }
    }
    Ok(())
}

impl LocalStore {
    pub async fn verify_trip(&self, owner_id: &str, trip_id: i64) -> Result<Trip, AppError> {
        let mut ftx = FinancialTx::begin(self, owner_id).await?;
        let trip = ftx.verify_trip(trip_id).await?;
        ftx.commit().await?;
        Ok(trip)
    }

    /// Override a trip and write its audit entry in the same transaction.
    pub async fn override_trip(
        &self,
        owner_id: &str,
        trip_id: i64,
        amount: f64,
        reason: &str,
    ) -> Result<Trip, AppError> {
        let mut ftx = FinancialTx::begin(self, owner_id).await?;
        let (before, after) = ftx.override_trip(trip_id, amount, reason).await?;
        let entry = audit_entry(
            owner_id,
            EntityKind::Trip.table(),
            trip_id,
            "override",
            Some(json!({ "overrideAmount": before.override_amount }).to_string()),
            Some(json!({ "overrideAmount": after.override_amount }).to_string()),
            reason,
        );
        ftx.write_audit(&entry).await?;
        ftx.commit().await?;
        tracing::info!(trip_id, amount, "Trip overridden");
        Ok(after)
    }

    /// Replace the tenant's rate slabs as a set.
    ///
    /// Slabs are matched by range; missing ones are deactivated, never deleted.
    pub async fn replace_rate_slabs(
        &self,
        owner_id: &str,
        slabs: Vec<RateSlab>,
        reason: &str,
    ) -> Result<Vec<RateSlab>, AppError> {
        for slab in &slabs {
            slab.validate()?;
        }
        check_slab_set(&slabs)?;

        let mut ftx = FinancialTx::begin(self, owner_id).await?;
        let existing =
            fetch_where::<RateSlab>(ftx.conn(), "owner_id = ?", vec![owner_id.into()]).await?;

        let mut kept_keys = Vec::with_capacity(slabs.len());
        for mut slab in slabs {
            let key = slab.logical_key();
            match existing.iter().find(|old| old.logical_key() == key) {
                Some(old) => {
                    let changed = !old.active
                        || old.driver_rate != slab.driver_rate
                        || old.company_rate != slab.company_rate;
                    if changed {
                        let mut updated = old.clone();
                        updated.driver_rate = slab.driver_rate;
                        updated.company_rate = slab.company_rate;
                        updated.active = true;
                        update_local(ftx.conn(), &updated).await?;
                    }
                }
                None => {
                    slab.meta = SyncMeta::new_local(owner_id);
                    slab.active = true;
                    insert_record(ftx.conn(), &slab).await?;
                }
            }
            kept_keys.push(key);
        }

        for old in existing.iter().filter(|old| old.active) {
            if !kept_keys.contains(&old.logical_key()) {
                let mut retired = old.clone();
                retired.active = false;
                update_local(ftx.conn(), &retired).await?;
            }
        }

        ftx.require_audit(EntityKind::RateSlab.table(), 0);
        let entry = audit_entry(
            owner_id,
            EntityKind::RateSlab.table(),
            0,
            "replace",
            Some(serde_json::to_string(&existing)?),
            Some(serde_json::to_string(&kept_keys)?),
            reason,
        );
        ftx.write_audit(&entry).await?;
        ftx.touch(EntityKind::RateSlab.table());
        ftx.commit().await?;

        let mut active: Vec<RateSlab> = self
            .list::<RateSlab>(owner_id)
            .await?
            .into_iter()
            .filter(|slab| slab.active)
            .collect();
        active.sort_by(|a, b| a.min_km.total_cmp(&b.min_km));
        Ok(active)
    }

    /// Outstanding advance balance of a driver: given minus recovered.
    pub async fn advance_balance(&self, owner_id: &str, driver_id: i64) -> Result<f64, AppError> {
        let mut conn = self.pool().acquire().await?;
        advance_balance_in(&mut conn, owner_id, driver_id).await
    }

    /// Record an advance through the dedup path, refusing recoveries beyond the balance.
    pub async fn record_advance(&self, advance: Advance) -> Result<Resolution, AppError> {
        advance.validate()?;
        let owner_id = advance.meta.owner_id.clone();
        let mut tx = self.begin().await?;

        let duplicate =
            fetch_by_logical_key::<Advance>(&mut tx, &owner_id, &advance.logical_key()).await?;
        if duplicate.is_none() && advance.kind == AdvanceKind::Recovered {
            let balance = advance_balance_in(&mut tx, &owner_id, advance.driver_id).await?;
            if balance - advance.amount < -BALANCE_EPSILON {
                return Err(AppError::Validation(format!(
                    "Recovery of {:.2} exceeds outstanding advance balance {:.2}",
                    advance.amount, balance
                )));
            }
        }

        let resolution = resolve_in(&mut tx, advance).await?;
        self.commit(tx, vec![(EntityKind::Advance.table(), owner_id)])
            .await?;
        Ok(resolution)
    }

    pub async fn list_audit(&self, owner_id: &str) -> Result<Vec<AuditEntry>, AppError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, table_name, record_id, action, old_value, new_value, reason, created_at FROM audit_log WHERE owner_id = ? ORDER BY id",
        )
        .bind(owner_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| AuditEntry {
                id: row.get("id"),
                owner_id: row.get("owner_id"),
                table_name: row.get("table_name"),
                record_id: row.get("record_id"),
                action: row.get("action"),
                old_value: row.get("old_value"),
                new_value: row.get("new_value"),
                reason: row.get("reason"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}
