//! Database initialization
//!
//! Creates the SQLite schema used by the persistence adapter. Every
//! statement is idempotent, so opening an existing database is safe.
//!
//! Tables:
//! - `pools`: reagent pools with stock concentration
//! - `racks`: plates and tube racks
//! - `containers`: wells and tubes with their sample (single pool or buffer)
//! - `iso_jobs`, `isos`: entities with JSON payloads (layout records, plates, stock racks)
//! - `executed_worklists`: audit trail written by the executor

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Current schema version
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// In-memory database with the full schema (tests and dry runs)
pub async fn init_memory_database() -> Result<SqlitePool> {
    // A single connection keeps the in-memory database alive and shared
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_pools_table(pool).await?;
    create_racks_table(pool).await?;
    create_containers_table(pool).await?;
    create_iso_jobs_table(pool).await?;
    create_isos_table(pool).await?;
    create_executed_worklists_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_pools_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pools (
            id INTEGER PRIMARY KEY,
            stock_concentration REAL NOT NULL CHECK (stock_concentration > 0),
            molecule_type TEXT NOT NULL,
            supplier TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_racks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS racks (
            barcode TEXT PRIMARY KEY,
            label TEXT NOT NULL DEFAULT '',
            kind TEXT NOT NULL CHECK (kind IN ('plate', 'tube_rack')),
            number_rows INTEGER NOT NULL,
            number_columns INTEGER NOT NULL,
            reservoir TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_containers_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS containers (
            rack_barcode TEXT NOT NULL REFERENCES racks(barcode) ON DELETE CASCADE,
            position TEXT NOT NULL,
            tube_barcode TEXT UNIQUE,
            pool_id INTEGER REFERENCES pools(id),
            volume REAL NOT NULL DEFAULT 0 CHECK (volume >= 0),
            concentration REAL,
            PRIMARY KEY (rack_barcode, position)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_containers_pool ON containers(pool_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_iso_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS iso_jobs (
            label TEXT PRIMARY KEY,
            ticket TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_isos_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS isos (
            label TEXT PRIMARY KEY,
            ticket TEXT NOT NULL,
            job_label TEXT REFERENCES iso_jobs(label),
            status TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_executed_worklists_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS executed_worklists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_label TEXT NOT NULL,
            worklist_label TEXT NOT NULL,
            target_rack TEXT NOT NULL,
            executed_by TEXT NOT NULL,
            executed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
