//! Explicit parameters threaded through the pipeline
//!
//! The planner and converters are pure: pools are fetched from the
//! repository up front and handed over together with the machine constants.

use crate::diagnostics::Diagnostics;
use crate::error::{LabError, LabResult};
use crate::model::{Entity, LayoutPosition, Pool, PoolId, ReagentKey};
use crate::repository::{EntityRepository, PoolRepository};
use isoprep_common::labels::EntityLabel;
use isoprep_common::config::MachineConstants;
use isoprep_common::{PipettingSpecs, Pipettor, ReservoirSpecs};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Context {
    pub constants: MachineConstants,
    pools: BTreeMap<PoolId, Pool>,
}

impl Context {
    pub fn new(constants: MachineConstants) -> Self {
        Self {
            constants,
            pools: BTreeMap::new(),
        }
    }

    pub fn with_pools(mut self, pools: impl IntoIterator<Item = Pool>) -> Self {
        for pool in pools {
            self.pools.insert(pool.id, pool);
        }
        self
    }

    /// Fetch the given pools; every unknown id is reported
    pub async fn load<R>(repository: &R, ids: &BTreeSet<PoolId>, constants: MachineConstants) -> LabResult<Self>
    where
        R: PoolRepository + ?Sized,
    {
        let mut diagnostics = Diagnostics::new();
        let mut context = Self::new(constants);
        for &id in ids {
            match repository.get_pool(id).await? {
                Some(pool) => {
                    context.pools.insert(id, pool);
                }
                None => diagnostics.push(LabError::UnknownPool(id)),
            }
        }
        debug!(pools = context.pools.len(), "Loaded pool catalog");
        diagnostics.into_result(context)
    }

    /// Context with every pool a job and its ISOs refer to
    ///
    /// `label` may name the job or one of its ISOs.
    pub async fn for_entity<R>(repository: &R, label: &EntityLabel, constants: MachineConstants) -> LabResult<Self>
    where
        R: PoolRepository + EntityRepository + ?Sized,
    {
        let job = match repository.get_entity(label).await? {
            Some(Entity::Job(job)) => job,
            Some(Entity::Iso(iso)) => repository
                .get_job(&iso.job)
                .await?
                .ok_or_else(|| LabError::UnknownLabel(iso.job.to_string()))?,
            None => return Err(LabError::UnknownLabel(label.to_string())),
        };
        let mut ids: BTreeSet<PoolId> = job
            .plan
            .final_layout
            .positions()
            .filter_map(|p| p.content().pool())
            .collect();
        for plate in &job.plan.prep_plates {
            ids.extend(plate.layout.positions().filter_map(|p| p.content().pool()));
        }
        for iso_label in &job.isos {
            if let Some(iso) = repository.get_iso(iso_label).await? {
                ids.extend(iso.floating_bindings.values().flatten().copied());
            }
        }
        Self::load(repository, &ids, constants).await
    }

    pub fn has_pool(&self, id: PoolId) -> bool {
        self.pools.contains_key(&id)
    }

    pub fn pool(&self, id: PoolId) -> LabResult<&Pool> {
        self.pools.get(&id).ok_or(LabError::UnknownPool(id))
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    /// Stock concentration of a reagent (floatings share one value)
    pub fn stock_concentration(&self, key: ReagentKey, floating_stock: Option<f64>) -> LabResult<f64> {
        match key {
            ReagentKey::Pool(id) => Ok(self.pool(id)?.stock_concentration),
            ReagentKey::Floating(placeholder) => floating_stock.ok_or_else(|| {
                LabError::InvalidRequest(format!(
                    "no floating stock concentration known for {}",
                    placeholder
                ))
            }),
        }
    }

    pub fn specs(&self, pipettor: Pipettor) -> PipettingSpecs {
        self.constants.specs(pipettor)
    }

    /// Plate type by name, or the default plate of the geometry
    pub fn reservoir(&self, name: Option<&str>, number_rows: u8, number_columns: u8) -> LabResult<ReservoirSpecs> {
        let found = match name {
            Some(name) => self.constants.reservoir(name),
            None => self.constants.default_reservoir(number_rows, number_columns),
        };
        match found {
            Some(specs) if specs.number_rows == number_rows && specs.number_columns == number_columns => {
                Ok(specs.clone())
            }
            Some(specs) => Err(LabError::InvalidRequest(format!(
                "plate type '{}' does not have {}x{} wells",
                specs.name, number_rows, number_columns
            ))),
            None => Err(LabError::InvalidRequest(format!(
                "unknown plate type '{}'",
                name.unwrap_or("default")
            ))),
        }
    }
}
