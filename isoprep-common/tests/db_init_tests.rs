//! Tests for database initialization

use isoprep_common::db::{init_database, init_memory_database, SCHEMA_VERSION};
use sqlx::Row;

#[tokio::test]
async fn test_database_creation_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("isoprep.db");

    let result = init_database(&db_path).await;

    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("isoprep.db");

    let first = init_database(&db_path).await.unwrap();
    first.close().await;

    let second = init_database(&db_path).await;
    assert!(second.is_ok(), "Failed to open existing database: {:?}", second.err());
}

#[tokio::test]
async fn test_schema_tables_exist() {
    let pool = init_memory_database().await.unwrap();

    for table in [
        "schema_version",
        "pools",
        "racks",
        "containers",
        "iso_jobs",
        "isos",
        "executed_worklists",
    ] {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, 1, "table {} missing", table);
    }

    let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
}

#[tokio::test]
async fn test_container_volume_must_not_be_negative() {
    let pool = init_memory_database().await.unwrap();

    sqlx::query("INSERT INTO racks (barcode, kind, number_rows, number_columns) VALUES ('09999999', 'plate', 8, 12)")
        .execute(&pool)
        .await
        .unwrap();

    let result = sqlx::query("INSERT INTO containers (rack_barcode, position, volume) VALUES ('09999999', 'A1', -1.0)")
        .execute(&pool)
        .await;
    assert!(result.is_err());
}
