//! SQLite inventory
//!
//! Pools, racks and containers are relational; ISOs and jobs are stored as
//! JSON payloads of their records keyed by label, with the ISO status
//! mirrored into its own column. Layouts inside a payload are tagged
//! position sets. `commit_execution` writes everything inside one
//! transaction.

use super::records::{decoding_context, IsoJobRecord, IsoRecord};
use super::{EntityRepository, ExecutionChangeSet, PoolRepository, RackRepository, TubeRepository};
use crate::error::{LabError, LabResult};
use crate::model::{Container, Iso, IsoJob, Pool, PoolId, Rack, RackKind, RackPosition, RackShape, Sample, TubeCandidate};
use async_trait::async_trait;
use isoprep_common::db::init_database;
use isoprep_common::labels::EntityLabel;
use isoprep_common::ReservoirSpecs;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SqliteInventory {
    pool: SqlitePool,
}

impl SqliteInventory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (and initialize) the database file
    pub async fn open(db_path: &Path) -> LabResult<Self> {
        let pool = init_database(db_path).await?;
        Ok(Self::new(pool))
    }

    pub fn db(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_pool(&self, pool: &Pool) -> LabResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pools (id, stock_concentration, molecule_type, supplier)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                stock_concentration = excluded.stock_concentration,
                molecule_type = excluded.molecule_type,
                supplier = excluded.supplier
            "#,
        )
        .bind(pool.id as i64)
        .bind(pool.stock_concentration)
        .bind(&pool.molecule_type)
        .bind(&pool.supplier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_containers(&self, barcode: &str) -> LabResult<BTreeMap<RackPosition, Container>> {
        let rows = sqlx::query(
            "SELECT position, tube_barcode, pool_id, volume, concentration FROM containers WHERE rack_barcode = ?",
        )
        .bind(barcode)
        .fetch_all(&self.pool)
        .await?;

        let mut containers = BTreeMap::new();
        for row in rows {
            let position: RackPosition = row.get::<String, _>("position").parse()?;
            let volume: f64 = row.get("volume");
            let pool_id: Option<i64> = row.get("pool_id");
            let sample = if volume > 0.0 || pool_id.is_some() {
                Some(Sample {
                    pool: pool_id.map(|id| id as PoolId),
                    volume,
                    concentration: row.get("concentration"),
                })
            } else {
                None
            };
            containers.insert(
                position,
                Container {
                    tube_barcode: row.get("tube_barcode"),
                    sample,
                },
            );
        }
        Ok(containers)
    }
}

fn parse_rack_kind(kind: &str) -> LabResult<RackKind> {
    match kind {
        "plate" => Ok(RackKind::Plate),
        "tube_rack" => Ok(RackKind::TubeRack),
        other => Err(LabError::InvalidRequest(format!("Unknown rack kind '{}'", other))),
    }
}

fn rack_from_row(row: &SqliteRow) -> LabResult<Rack> {
    let rows: i64 = row.get("number_rows");
    let columns: i64 = row.get("number_columns");
    let shape = RackShape::from_dimensions(rows as u8, columns as u8).ok_or_else(|| {
        LabError::InvalidRequest(format!("Unsupported rack dimensions {}x{}", rows, columns))
    })?;
    Ok(Rack {
        barcode: row.get("barcode"),
        label: row.get("label"),
        kind: parse_rack_kind(&row.get::<String, _>("kind"))?,
        shape,
        reservoir: row.get("reservoir"),
        containers: BTreeMap::new(),
    })
}

/// Replace a rack and all of its containers
async fn write_rack(conn: &mut SqliteConnection, rack: &Rack) -> LabResult<()> {
    sqlx::query(
        r#"
        INSERT INTO racks (barcode, label, kind, number_rows, number_columns, reservoir)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(barcode) DO UPDATE SET
            label = excluded.label,
            kind = excluded.kind,
            number_rows = excluded.number_rows,
            number_columns = excluded.number_columns,
            reservoir = excluded.reservoir
        "#,
    )
    .bind(&rack.barcode)
    .bind(&rack.label)
    .bind(rack.kind.as_str())
    .bind(rack.shape.number_rows() as i64)
    .bind(rack.shape.number_columns() as i64)
    .bind(&rack.reservoir)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM containers WHERE rack_barcode = ?")
        .bind(&rack.barcode)
        .execute(&mut *conn)
        .await?;

    for (position, container) in &rack.containers {
        if container.tube_barcode.is_none() && container.is_empty() {
            continue;
        }
        let sample = container.sample.as_ref();
        sqlx::query(
            r#"
            INSERT INTO containers (rack_barcode, position, tube_barcode, pool_id, volume, concentration)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rack.barcode)
        .bind(position.label())
        .bind(&container.tube_barcode)
        .bind(sample.and_then(|s| s.pool).map(|id| id as i64))
        .bind(sample.map(|s| s.volume).unwrap_or(0.0))
        .bind(sample.and_then(|s| s.concentration))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn write_iso(conn: &mut SqliteConnection, iso: &Iso) -> LabResult<()> {
    let payload = serde_json::to_string(&IsoRecord::from(iso))?;
    sqlx::query(
        r#"
        INSERT INTO isos (label, ticket, job_label, status, payload, updated_at)
        VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(label) DO UPDATE SET
            status = excluded.status,
            payload = excluded.payload,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(iso.label.to_string())
    .bind(&iso.label.ticket)
    .bind(iso.job.to_string())
    .bind(iso.status.as_str())
    .bind(payload)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl PoolRepository for SqliteInventory {
    async fn get_pool(&self, id: PoolId) -> LabResult<Option<Pool>> {
        let row = sqlx::query("SELECT id, stock_concentration, molecule_type, supplier FROM pools WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| Pool {
            id: row.get::<i64, _>("id") as PoolId,
            stock_concentration: row.get("stock_concentration"),
            molecule_type: row.get("molecule_type"),
            supplier: row.get("supplier"),
        }))
    }
}

#[async_trait]
impl TubeRepository for SqliteInventory {
    async fn find_candidates(&self, pool: PoolId, min_volume: f64) -> LabResult<Vec<TubeCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT c.tube_barcode, c.rack_barcode, c.position, c.volume, c.concentration
            FROM containers c
            JOIN racks r ON r.barcode = c.rack_barcode
            WHERE r.kind = 'tube_rack'
              AND c.tube_barcode IS NOT NULL
              AND c.pool_id = ?
              AND c.volume >= ?
            ORDER BY c.tube_barcode
            "#,
        )
        .bind(pool as i64)
        .bind(min_volume)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TubeCandidate {
                    tube_barcode: row.get("tube_barcode"),
                    pool,
                    rack_barcode: row.get("rack_barcode"),
                    rack_position: row.get::<String, _>("position").parse()?,
                    volume: row.get("volume"),
                    concentration: row.get::<Option<f64>, _>("concentration").unwrap_or_default(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl RackRepository for SqliteInventory {
    async fn get_rack(&self, barcode: &str) -> LabResult<Option<Rack>> {
        let row = sqlx::query(
            "SELECT barcode, label, kind, number_rows, number_columns, reservoir FROM racks WHERE barcode = ?",
        )
        .bind(barcode)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut rack = rack_from_row(&row)?;
        rack.containers = self.load_containers(barcode).await?;
        Ok(Some(rack))
    }

    async fn create_plate(
        &self,
        specs: &ReservoirSpecs,
        shape: RackShape,
        label: &str,
        barcode: &str,
    ) -> LabResult<Rack> {
        if let Some(existing) = self.get_rack(barcode).await? {
            return Ok(existing);
        }
        let rack = Rack::plate(barcode, label, shape, specs.name.clone());
        self.save_rack(&rack).await?;
        debug!(barcode, label, "Created plate");
        Ok(rack)
    }

    async fn save_rack(&self, rack: &Rack) -> LabResult<()> {
        let mut tx = self.pool.begin().await?;
        write_rack(&mut *tx, rack).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl EntityRepository for SqliteInventory {
    async fn get_iso(&self, label: &EntityLabel) -> LabResult<Option<Iso>> {
        let payload: Option<String> = sqlx::query_scalar("SELECT payload FROM isos WHERE label = ?")
            .bind(label.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(text) = payload else {
            return Ok(None);
        };
        let record: IsoRecord = serde_json::from_str(&text)?;
        let context = decoding_context(self, &record.pool_ids()).await?;
        Ok(Some(record.decode(&context)?))
    }

    async fn get_job(&self, label: &EntityLabel) -> LabResult<Option<IsoJob>> {
        let payload: Option<String> = sqlx::query_scalar("SELECT payload FROM iso_jobs WHERE label = ?")
            .bind(label.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(text) = payload else {
            return Ok(None);
        };
        let record: IsoJobRecord = serde_json::from_str(&text)?;
        let context = decoding_context(self, &record.pool_ids()).await?;
        Ok(Some(record.decode(&context)?))
    }

    async fn save_job(&self, job: &IsoJob, isos: &[Iso]) -> LabResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO iso_jobs (label, ticket, payload, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(label) DO UPDATE SET
                payload = excluded.payload,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(job.label.to_string())
        .bind(&job.label.ticket)
        .bind(serde_json::to_string(&IsoJobRecord::from(job))?)
        .execute(&mut *tx)
        .await?;

        for iso in isos {
            write_iso(&mut *tx, iso).await?;
        }

        tx.commit().await?;
        info!(job = %job.label, isos = isos.len(), "Saved ISO job");
        Ok(())
    }

    async fn used_floating_pools(&self, ticket: &str) -> LabResult<BTreeSet<PoolId>> {
        let payloads: Vec<String> = sqlx::query_scalar("SELECT payload FROM isos WHERE ticket = ?")
            .bind(ticket)
            .fetch_all(&self.pool)
            .await?;
        let mut used = BTreeSet::new();
        for text in payloads {
            let record: IsoRecord = serde_json::from_str(&text)?;
            used.extend(record.bound_pools());
        }
        Ok(used)
    }

    async fn commit_execution(&self, changes: ExecutionChangeSet) -> LabResult<()> {
        let mut tx = self.pool.begin().await?;

        // Step 1: racks (sources before targets keeps tube barcodes unique)
        for rack in &changes.racks {
            write_rack(&mut *tx, rack).await?;
        }

        // Step 2: ISO states
        for iso in &changes.isos {
            write_iso(&mut *tx, iso).await?;
        }

        // Step 3: execution log
        for entry in &changes.executed {
            sqlx::query(
                r#"
                INSERT INTO executed_worklists (entity_label, worklist_label, target_rack, executed_by, executed_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.entity_label)
            .bind(&entry.worklist_label)
            .bind(&entry.target_rack)
            .bind(&entry.user)
            .bind(entry.executed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            racks = changes.racks.len(),
            isos = changes.isos.len(),
            worklists = changes.executed.len(),
            "Committed execution"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isoprep_common::db::init_memory_database;

    async fn inventory() -> SqliteInventory {
        let inventory = SqliteInventory::new(init_memory_database().await.unwrap());
        inventory
            .insert_pool(&Pool {
                id: 205201,
                stock_concentration: 50000.0,
                molecule_type: "siRNA".to_string(),
                supplier: None,
            })
            .await
            .unwrap();
        inventory
    }

    #[tokio::test]
    async fn test_pool_lookup() {
        let inventory = inventory().await;
        let pool = inventory.get_pool(205201).await.unwrap().unwrap();
        assert_eq!(pool.stock_concentration, 50000.0);
        assert!(inventory.get_pool(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rack_round_trip_and_candidates() {
        let inventory = inventory().await;
        let mut rack = Rack::tube_rack("09000001", "source");
        rack.put_tube(RackPosition::new(0, 0), "1000001", Sample::new(205201, 40.0, 50000.0));
        inventory.save_rack(&rack).await.unwrap();

        let loaded = inventory.get_rack("09000001").await.unwrap().unwrap();
        assert_eq!(loaded, rack);

        let candidates = inventory.find_candidates(205201, 10.0).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].rack_position, RackPosition::new(0, 0));
        assert!(inventory.find_candidates(205201, 50.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plate_containers_keep_buffer() {
        let inventory = inventory().await;
        let specs = ReservoirSpecs::standard_96();
        let mut plate = inventory
            .create_plate(&specs, RackShape::Wells96, "t_iso_01_a", "t_iso_01_a")
            .await
            .unwrap();
        *plate.sample_mut(RackPosition::new(1, 1)) = Some(Sample::buffer(8.0));
        inventory.save_rack(&plate).await.unwrap();

        let loaded = inventory.get_rack("t_iso_01_a").await.unwrap().unwrap();
        assert_eq!(loaded.sample(RackPosition::new(1, 1)), Some(&Sample::buffer(8.0)));
        assert_eq!(loaded.reservoir.as_deref(), Some("standard 96"));
    }
}
