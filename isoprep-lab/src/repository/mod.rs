//! Repository seams
//!
//! The planner, assigner and executor reach pools, tubes, racks and entities
//! only through these traits. Two adapters implement all of them:
//! [`MemoryInventory`] (tests and JSON fixtures) and [`SqliteInventory`].
//! Both keep ISOs and jobs in their [`records`] form.

pub mod memory;
pub mod records;
pub mod sqlite;

pub use memory::{InventorySnapshot, MemoryInventory};
pub use records::{IsoJobRecord, IsoRecord};
pub use sqlite::SqliteInventory;

use crate::error::LabResult;
use crate::model::{Entity, Iso, IsoJob, Pool, PoolId, Rack, RackShape, TubeCandidate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use isoprep_common::labels::{EntityKind, EntityLabel};
use isoprep_common::ReservoirSpecs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[async_trait]
pub trait PoolRepository: Send + Sync {
    async fn get_pool(&self, id: PoolId) -> LabResult<Option<Pool>>;
}

#[async_trait]
pub trait TubeRepository: Send + Sync {
    /// Stock tubes of `pool` holding at least `min_volume` µl, ordered by tube barcode
    async fn find_candidates(&self, pool: PoolId, min_volume: f64) -> LabResult<Vec<TubeCandidate>>;
}

#[async_trait]
pub trait RackRepository: Send + Sync {
    async fn get_rack(&self, barcode: &str) -> LabResult<Option<Rack>>;

    /// Register an empty plate; an existing rack with the same barcode is returned as is
    async fn create_plate(
        &self,
        specs: &ReservoirSpecs,
        shape: RackShape,
        label: &str,
        barcode: &str,
    ) -> LabResult<Rack>;

    /// Store a rack with its containers (replaces the previous state)
    async fn save_rack(&self, rack: &Rack) -> LabResult<()>;
}

#[async_trait]
pub trait EntityRepository: Send + Sync {
    async fn get_iso(&self, label: &EntityLabel) -> LabResult<Option<Iso>>;

    async fn get_job(&self, label: &EntityLabel) -> LabResult<Option<IsoJob>>;

    /// Store a job together with its ISOs
    async fn save_job(&self, job: &IsoJob, isos: &[Iso]) -> LabResult<()>;

    /// Pools already bound to floating placeholders by ISOs of this ticket
    async fn used_floating_pools(&self, ticket: &str) -> LabResult<BTreeSet<PoolId>>;

    /// Write racks, ISO states and the execution log in one unit
    async fn commit_execution(&self, changes: ExecutionChangeSet) -> LabResult<()>;

    async fn get_entity(&self, label: &EntityLabel) -> LabResult<Option<Entity>> {
        Ok(match label.kind {
            EntityKind::Iso => self.get_iso(label).await?.map(Entity::Iso),
            EntityKind::Job => self.get_job(label).await?.map(Entity::Job),
        })
    }
}

/// Everything the lab pipeline needs from storage
pub trait Inventory: PoolRepository + TubeRepository + RackRepository + EntityRepository {}

impl<T> Inventory for T where T: PoolRepository + TubeRepository + RackRepository + EntityRepository {}

/// Log entry of one executed worklist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedWorklist {
    pub entity_label: String,
    pub worklist_label: String,
    pub target_rack: String,
    pub user: String,
    pub executed_at: DateTime<Utc>,
}

/// State written by one execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionChangeSet {
    pub racks: Vec<Rack>,
    pub isos: Vec<Iso>,
    pub executed: Vec<ExecutedWorklist>,
}
