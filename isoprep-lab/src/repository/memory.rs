//! In-memory inventory
//!
//! Backs the integration tests and the CLI's `--inventory <fixture.json>`
//! mode. The whole state serializes to one JSON document; ISOs and jobs are
//! held as records and decoded against the stored pools on every read.

use super::records::{IsoJobRecord, IsoRecord};
use super::{EntityRepository, ExecutedWorklist, ExecutionChangeSet, PoolRepository, RackRepository, TubeRepository};
use crate::context::Context;
use crate::error::LabResult;
use crate::model::{Iso, IsoJob, Pool, PoolId, Rack, RackKind, RackShape, TubeCandidate};
use async_trait::async_trait;
use isoprep_common::labels::EntityLabel;
use isoprep_common::{units, ReservoirSpecs};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Serializable state of a [`MemoryInventory`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub racks: Vec<Rack>,
    #[serde(default)]
    pub jobs: Vec<IsoJobRecord>,
    #[serde(default)]
    pub isos: Vec<IsoRecord>,
    #[serde(default)]
    pub executed: Vec<ExecutedWorklist>,
}

#[derive(Debug, Default)]
struct State {
    pools: BTreeMap<PoolId, Pool>,
    racks: BTreeMap<String, Rack>,
    jobs: BTreeMap<String, IsoJobRecord>,
    isos: BTreeMap<String, IsoRecord>,
    executed: Vec<ExecutedWorklist>,
}

impl State {
    fn decoding_context(&self) -> Context {
        Context::default().with_pools(self.pools.values().cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryInventory {
    state: RwLock<State>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: InventorySnapshot) -> Self {
        let state = State {
            pools: snapshot.pools.into_iter().map(|p| (p.id, p)).collect(),
            racks: snapshot.racks.into_iter().map(|r| (r.barcode.clone(), r)).collect(),
            jobs: snapshot.jobs.into_iter().map(|j| (j.label.to_string(), j)).collect(),
            isos: snapshot.isos.into_iter().map(|i| (i.label.to_string(), i)).collect(),
            executed: snapshot.executed,
        };
        Self {
            state: RwLock::new(state),
        }
    }

    pub async fn snapshot(&self) -> InventorySnapshot {
        let state = self.state.read().await;
        InventorySnapshot {
            pools: state.pools.values().cloned().collect(),
            racks: state.racks.values().cloned().collect(),
            jobs: state.jobs.values().cloned().collect(),
            isos: state.isos.values().cloned().collect(),
            executed: state.executed.clone(),
        }
    }

    /// Load a JSON fixture
    pub async fn load_json(path: &Path) -> LabResult<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let snapshot: InventorySnapshot = serde_json::from_str(&text)?;
        info!(
            path = %path.display(),
            pools = snapshot.pools.len(),
            racks = snapshot.racks.len(),
            "Loaded inventory fixture"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Write the current state back as JSON
    pub async fn save_json(&self, path: &Path) -> LabResult<()> {
        let snapshot = self.snapshot().await;
        let text = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(path, text).await?;
        debug!(path = %path.display(), "Saved inventory fixture");
        Ok(())
    }

    pub async fn insert_pool(&self, pool: Pool) {
        self.state.write().await.pools.insert(pool.id, pool);
    }

    pub async fn executed_worklists(&self) -> Vec<ExecutedWorklist> {
        self.state.read().await.executed.clone()
    }
}

#[async_trait]
impl PoolRepository for MemoryInventory {
    async fn get_pool(&self, id: PoolId) -> LabResult<Option<Pool>> {
        Ok(self.state.read().await.pools.get(&id).cloned())
    }
}

#[async_trait]
impl TubeRepository for MemoryInventory {
    async fn find_candidates(&self, pool: PoolId, min_volume: f64) -> LabResult<Vec<TubeCandidate>> {
        let state = self.state.read().await;
        let mut candidates: Vec<TubeCandidate> = state
            .racks
            .values()
            .filter(|rack| rack.kind == RackKind::TubeRack)
            .flat_map(|rack| {
                rack.containers.iter().filter_map(move |(position, container)| {
                    let tube_barcode = container.tube_barcode.clone()?;
                    let sample = container.sample.as_ref()?;
                    if sample.pool != Some(pool) || units::is_smaller_than(sample.volume, min_volume) {
                        return None;
                    }
                    Some(TubeCandidate {
                        tube_barcode,
                        pool,
                        rack_barcode: rack.barcode.clone(),
                        rack_position: *position,
                        volume: sample.volume,
                        concentration: sample.concentration.unwrap_or_default(),
                    })
                })
            })
            .collect();
        candidates.sort_by(|a, b| a.tube_barcode.cmp(&b.tube_barcode));
        Ok(candidates)
    }
}

#[async_trait]
impl RackRepository for MemoryInventory {
    async fn get_rack(&self, barcode: &str) -> LabResult<Option<Rack>> {
        Ok(self.state.read().await.racks.get(barcode).cloned())
    }

    async fn create_plate(
        &self,
        specs: &ReservoirSpecs,
        shape: RackShape,
        label: &str,
        barcode: &str,
    ) -> LabResult<Rack> {
        let mut state = self.state.write().await;
        let rack = state
            .racks
            .entry(barcode.to_string())
            .or_insert_with(|| Rack::plate(barcode, label, shape, specs.name.clone()));
        Ok(rack.clone())
    }

    async fn save_rack(&self, rack: &Rack) -> LabResult<()> {
        self.state
            .write()
            .await
            .racks
            .insert(rack.barcode.clone(), rack.clone());
        Ok(())
    }
}

#[async_trait]
impl EntityRepository for MemoryInventory {
    async fn get_iso(&self, label: &EntityLabel) -> LabResult<Option<Iso>> {
        let state = self.state.read().await;
        let context = state.decoding_context();
        state
            .isos
            .get(&label.to_string())
            .map(|record| record.decode(&context))
            .transpose()
    }

    async fn get_job(&self, label: &EntityLabel) -> LabResult<Option<IsoJob>> {
        let state = self.state.read().await;
        let context = state.decoding_context();
        state
            .jobs
            .get(&label.to_string())
            .map(|record| record.decode(&context))
            .transpose()
    }

    async fn save_job(&self, job: &IsoJob, isos: &[Iso]) -> LabResult<()> {
        let mut state = self.state.write().await;
        state.jobs.insert(job.label.to_string(), IsoJobRecord::from(job));
        for iso in isos {
            state.isos.insert(iso.label.to_string(), IsoRecord::from(iso));
        }
        Ok(())
    }

    async fn used_floating_pools(&self, ticket: &str) -> LabResult<BTreeSet<PoolId>> {
        let state = self.state.read().await;
        Ok(state
            .isos
            .values()
            .filter(|iso| iso.label.ticket == ticket)
            .flat_map(|iso| iso.bound_pools())
            .collect())
    }

    async fn commit_execution(&self, changes: ExecutionChangeSet) -> LabResult<()> {
        // One write guard for the whole change set
        let mut state = self.state.write().await;
        for rack in changes.racks {
            state.racks.insert(rack.barcode.clone(), rack);
        }
        for iso in &changes.isos {
            state.isos.insert(iso.label.to_string(), IsoRecord::from(iso));
        }
        state.executed.extend(changes.executed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RackPosition, Sample};

    fn tube_rack() -> Rack {
        let mut rack = Rack::tube_rack("09000001", "source rack");
        rack.put_tube(RackPosition::new(0, 1), "1000002", Sample::new(205201, 40.0, 50000.0));
        rack.put_tube(RackPosition::new(0, 0), "1000001", Sample::new(205201, 8.0, 50000.0));
        rack.put_tube(RackPosition::new(1, 0), "1000003", Sample::new(330001, 40.0, 50000.0));
        rack
    }

    #[tokio::test]
    async fn test_candidates_filter_by_pool_and_volume() {
        let inventory = MemoryInventory::new();
        inventory.save_rack(&tube_rack()).await.unwrap();

        let all = inventory.find_candidates(205201, 0.0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].tube_barcode, "1000001");

        let enough = inventory.find_candidates(205201, 10.0).await.unwrap();
        assert_eq!(enough.len(), 1);
        assert_eq!(enough[0].tube_barcode, "1000002");
        assert_eq!(enough[0].rack_position, RackPosition::new(0, 1));
    }

    #[tokio::test]
    async fn test_create_plate_is_idempotent() {
        let inventory = MemoryInventory::new();
        let specs = ReservoirSpecs::standard_96();
        let first = inventory
            .create_plate(&specs, RackShape::Wells96, "t_iso_01_a", "t_iso_01_a")
            .await
            .unwrap();
        let second = inventory
            .create_plate(&specs, RackShape::Wells96, "other", "t_iso_01_a")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.label, "t_iso_01_a");
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let inventory = MemoryInventory::new();
        inventory
            .insert_pool(Pool {
                id: 205201,
                stock_concentration: 50000.0,
                molecule_type: "siRNA".to_string(),
                supplier: Some("Ambion".to_string()),
            })
            .await;
        inventory.save_rack(&tube_rack()).await.unwrap();

        let snapshot = inventory.snapshot().await;
        let text = serde_json::to_string(&snapshot).unwrap();
        let restored = MemoryInventory::from_snapshot(serde_json::from_str(&text).unwrap());
        assert_eq!(restored.snapshot().await, snapshot);
    }
}
