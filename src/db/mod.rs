//! Database module for SQLite persistence.
//!
//! The device's SQLite file is the source of truth for everything the user
//! sees; the cloud is only ever reconciled against it.

mod changes;
mod financial;
mod prefs;
mod repository;

pub use changes::*;
pub use financial::*;
pub use repository::*;

pub(crate) use prefs::grant_driver_access_in;

use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::models::EntityKind;

/// Current time as RFC 3339 with fixed microsecond precision, so text order is time order.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Initialize the database connection pool and run migrations.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run embedded migrations
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Domain columns of each syncable table. The shared sync columns are added by `sync_table_ddl`.
fn domain_columns(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Driver => {
            "name TEXT NOT NULL,
            phone TEXT,
            active INTEGER NOT NULL DEFAULT 1"
        }
        EntityKind::Company => {
            "name TEXT NOT NULL,
            contact TEXT"
        }
        EntityKind::Client => "name TEXT NOT NULL",
        EntityKind::PickupLocation => {
            "name TEXT NOT NULL,
            notes TEXT"
        }
        EntityKind::PickupClientDistance => {
            "pickup_location TEXT NOT NULL,
            client TEXT NOT NULL,
            distance_km REAL NOT NULL"
        }
        EntityKind::RateSlab => {
            "min_km REAL NOT NULL,
            max_km REAL NOT NULL,
            driver_rate REAL NOT NULL,
            company_rate REAL NOT NULL,
            active INTEGER NOT NULL DEFAULT 1"
        }
        EntityKind::Trip => {
            "driver_id INTEGER NOT NULL,
            trip_date TEXT NOT NULL,
            company TEXT NOT NULL,
            pickup_location TEXT NOT NULL,
            client TEXT NOT NULL,
            bags INTEGER NOT NULL,
            distance_km REAL NOT NULL,
            driver_rate REAL NOT NULL,
            company_rate REAL NOT NULL,
            labour_cost_per_bag REAL NOT NULL,
            verified INTEGER NOT NULL DEFAULT 0,
            overridden INTEGER NOT NULL DEFAULT 0,
            override_amount REAL,
            override_reason TEXT"
        }
        EntityKind::FuelEntry => {
            "driver_id INTEGER NOT NULL,
            entry_date TEXT NOT NULL,
            amount REAL NOT NULL,
            litres REAL,
            notes TEXT"
        }
        EntityKind::Advance => {
            "driver_id INTEGER NOT NULL,
            entry_date TEXT NOT NULL,
            amount REAL NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('given', 'recovered')),
            notes TEXT"
        }
    }
}

fn sync_table_ddl(kind: EntityKind) -> String {
    let table = kind.table();
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            cloud_id TEXT UNIQUE,
            owner_id TEXT NOT NULL CHECK (owner_id <> ''),
            logical_key TEXT NOT NULL,
            sync_attempts INTEGER NOT NULL DEFAULT 0,
            dirty INTEGER NOT NULL DEFAULT 0,
            synced_at TEXT,
            last_sync_error TEXT,
            created_at TEXT NOT NULL,
            {columns}
        );

        CREATE INDEX IF NOT EXISTS idx_{table}_owner_key ON {table}(owner_id, logical_key);
        CREATE INDEX IF NOT EXISTS idx_{table}_pending ON {table}(owner_id, cloud_id, created_at);

        CREATE TRIGGER IF NOT EXISTS trg_{table}_cloud_id_immutable
        BEFORE UPDATE OF cloud_id ON {table}
        WHEN OLD.cloud_id IS NOT NULL AND NEW.cloud_id IS NOT OLD.cloud_id
        BEGIN
            SELECT RAISE(ABORT, 'cloud_id is immutable');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_{table}_owner_immutable
        BEFORE UPDATE OF owner_id ON {table}
        WHEN NEW.owner_id IS NOT OLD.owner_id
        BEGIN
            SELECT RAISE(ABORT, 'owner_id is immutable');
        END;
        "#,
        table = table,
        columns = domain_columns(kind),
    )
}

/// Run database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            schema_version INTEGER NOT NULL DEFAULT 1,
            revision_id INTEGER NOT NULL DEFAULT 0,
            generated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        INSERT OR IGNORE INTO meta (id, schema_version, revision_id, generated_at)
        VALUES (1, 1, 0, datetime('now'));
        "#,
    )
    .execute(pool)
    .await?;

    for kind in EntityKind::ALL {
        sqlx::query(&sync_table_ddl(kind)).execute(pool).await?;
    }

    // Snapshot fields are frozen at creation and trips are never hard-deleted
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS trg_trips_snapshot_immutable
        BEFORE UPDATE OF distance_km, driver_rate, company_rate, labour_cost_per_bag ON trips
        WHEN NEW.distance_km IS NOT OLD.distance_km
          OR NEW.driver_rate IS NOT OLD.driver_rate
          OR NEW.company_rate IS NOT OLD.company_rate
          OR NEW.labour_cost_per_bag IS NOT OLD.labour_cost_per_bag
        BEGIN
            SELECT RAISE(ABORT, 'trip snapshot fields are immutable');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_trips_append_only
        BEFORE DELETE ON trips
        BEGIN
            SELECT RAISE(ABORT, 'trips are append-only');
        END;
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            record_id INTEGER NOT NULL,
            action TEXT NOT NULL,
            old_value TEXT,
            new_value TEXT,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS owner_profile (
            owner_id TEXT PRIMARY KEY,
            business_name TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS prefs (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_record ON audit_log(table_name, record_id);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
