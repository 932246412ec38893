//! Stored forms of ISOs and ISO jobs
//!
//! Every layout an entity carries is written through the layout converter
//! and read back through its decoder, so a stored entity passes the same
//! rules as a freshly planned one. Plates, worklists and bindings are kept
//! as they are.

use crate::context::Context;
use crate::converter::lab::{encode_final_layout, encode_prep_layout};
use crate::converter::stock::encode_stock_rack_layout;
use crate::converter::{decode_final_layout, decode_prep_layout, decode_stock_rack_layout, RackLayoutRecord};
use crate::error::LabResult;
use crate::model::{
    FinalLayout, Iso, IsoJob, IsoStatus, LayoutPosition, LibraryPlate, LibraryReference, Placeholder, PlateRef,
    PoolId, PrepLayout, PrepPlate, PreparationPlan, ProcessingOrder, RackLayout, RackShape, Scenario, StockRack,
    StockRackPlan,
};
use crate::repository::PoolRepository;
use crate::worklists::WorklistSeries;
use isoprep_common::labels::{EntityLabel, RackMarker};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Converter record plus the stock concentration shared by floating positions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLayout {
    pub record: RackLayoutRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floating_stock_concentration: Option<f64>,
}

impl StoredLayout {
    fn new<P: LayoutPosition>(layout: &RackLayout<P>, record: RackLayoutRecord) -> Self {
        Self {
            record,
            floating_stock_concentration: layout.floating_stock_concentration(),
        }
    }

    fn final_layout(layout: &FinalLayout) -> Self {
        Self::new(layout, encode_final_layout(layout))
    }

    fn prep_layout(layout: &PrepLayout) -> Self {
        Self::new(layout, encode_prep_layout(layout))
    }

    fn restore<P: LayoutPosition>(&self, mut layout: RackLayout<P>) -> LabResult<RackLayout<P>> {
        if let Some(stock) = self.floating_stock_concentration {
            layout.set_floating_stock_concentration(stock)?;
        }
        Ok(layout)
    }

    fn decode_final(&self, context: &Context) -> LabResult<FinalLayout> {
        self.restore(decode_final_layout(&self.record, context)?)
    }

    fn decode_prep(&self, context: &Context) -> LabResult<PrepLayout> {
        self.restore(decode_prep_layout(&self.record, context)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepPlateRecord {
    pub marker: RackMarker,
    pub reservoir: String,
    pub layout: StoredLayout,
}

impl From<&PrepPlate> for PrepPlateRecord {
    fn from(plate: &PrepPlate) -> Self {
        Self {
            marker: plate.marker,
            reservoir: plate.reservoir.clone(),
            layout: StoredLayout::prep_layout(&plate.layout),
        }
    }
}

impl PrepPlateRecord {
    fn decode(&self, context: &Context) -> LabResult<PrepPlate> {
        Ok(PrepPlate {
            marker: self.marker,
            reservoir: self.reservoir.clone(),
            layout: self.layout.decode_prep(context)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockRackRecord {
    pub marker: RackMarker,
    pub label: String,
    pub barcode: String,
    #[serde(default)]
    pub sector: Option<u8>,
    pub layout: RackLayoutRecord,
    pub series: WorklistSeries,
}

impl From<&StockRack> for StockRackRecord {
    fn from(rack: &StockRack) -> Self {
        Self {
            marker: rack.marker,
            label: rack.label.clone(),
            barcode: rack.barcode.clone(),
            sector: rack.sector,
            layout: encode_stock_rack_layout(&rack.layout),
            series: rack.series.clone(),
        }
    }
}

impl StockRackRecord {
    fn decode(&self) -> LabResult<StockRack> {
        Ok(StockRack {
            marker: self.marker,
            label: self.label.clone(),
            barcode: self.barcode.clone(),
            sector: self.sector,
            layout: decode_stock_rack_layout(&self.layout)?,
            series: self.series.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub ticket: String,
    pub scenario: Scenario,
    pub shape: RackShape,
    pub number_aliquots: u32,
    pub isos_per_job: u32,
    pub aliquot_dilution_factor: u32,
    pub processing_order: ProcessingOrder,
    pub final_layout: StoredLayout,
    pub final_reservoir: String,
    pub prep_plates: Vec<PrepPlateRecord>,
    pub stock_racks: Vec<StockRackPlan>,
    #[serde(default)]
    pub sector_groups: Vec<Vec<u8>>,
    #[serde(default)]
    pub floating_stock_concentration: Option<f64>,
    #[serde(default)]
    pub library: Option<LibraryReference>,
}

impl From<&PreparationPlan> for PlanRecord {
    fn from(plan: &PreparationPlan) -> Self {
        Self {
            ticket: plan.ticket.clone(),
            scenario: plan.scenario,
            shape: plan.shape,
            number_aliquots: plan.number_aliquots,
            isos_per_job: plan.isos_per_job,
            aliquot_dilution_factor: plan.aliquot_dilution_factor,
            processing_order: plan.processing_order,
            final_layout: StoredLayout::final_layout(&plan.final_layout),
            final_reservoir: plan.final_reservoir.clone(),
            prep_plates: plan.prep_plates.iter().map(PrepPlateRecord::from).collect(),
            stock_racks: plan.stock_racks.clone(),
            sector_groups: plan.sector_groups.clone(),
            floating_stock_concentration: plan.floating_stock_concentration,
            library: plan.library.clone(),
        }
    }
}

impl PlanRecord {
    fn decode(&self, context: &Context) -> LabResult<PreparationPlan> {
        Ok(PreparationPlan {
            ticket: self.ticket.clone(),
            scenario: self.scenario,
            shape: self.shape,
            number_aliquots: self.number_aliquots,
            isos_per_job: self.isos_per_job,
            aliquot_dilution_factor: self.aliquot_dilution_factor,
            processing_order: self.processing_order,
            final_layout: self.final_layout.decode_final(context)?,
            final_reservoir: self.final_reservoir.clone(),
            prep_plates: self
                .prep_plates
                .iter()
                .map(|plate| plate.decode(context))
                .collect::<LabResult<_>>()?,
            stock_racks: self.stock_racks.clone(),
            sector_groups: self.sector_groups.clone(),
            floating_stock_concentration: self.floating_stock_concentration,
            library: self.library.clone(),
        })
    }
}

/// Stored ISO
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsoRecord {
    pub label: EntityLabel,
    pub status: IsoStatus,
    pub job: EntityLabel,
    #[serde(default)]
    pub floating_bindings: BTreeMap<Placeholder, Option<PoolId>>,
    pub final_layout: StoredLayout,
    #[serde(default)]
    pub prep_layouts: Vec<PrepPlateRecord>,
    pub final_plates: Vec<PlateRef>,
    #[serde(default)]
    pub prep_plates: Vec<PlateRef>,
    #[serde(default)]
    pub stock_racks: Vec<StockRackRecord>,
    #[serde(default)]
    pub library_plates: Vec<LibraryPlate>,
}

impl From<&Iso> for IsoRecord {
    fn from(iso: &Iso) -> Self {
        Self {
            label: iso.label.clone(),
            status: iso.status,
            job: iso.job.clone(),
            floating_bindings: iso.floating_bindings.clone(),
            final_layout: StoredLayout::final_layout(&iso.final_layout),
            prep_layouts: iso.prep_layouts.iter().map(PrepPlateRecord::from).collect(),
            final_plates: iso.final_plates.clone(),
            prep_plates: iso.prep_plates.clone(),
            stock_racks: iso.stock_racks.iter().map(StockRackRecord::from).collect(),
            library_plates: iso.library_plates.clone(),
        }
    }
}

impl IsoRecord {
    /// Pools the layouts refer to; the decoding context must know all of them
    pub fn pool_ids(&self) -> BTreeSet<PoolId> {
        let mut pools = self.final_layout.record.pool_ids();
        for plate in &self.prep_layouts {
            pools.extend(plate.layout.record.pool_ids());
        }
        pools
    }

    /// Pools bound to floating placeholders
    pub fn bound_pools(&self) -> impl Iterator<Item = PoolId> + '_ {
        self.floating_bindings.values().filter_map(|pool| *pool)
    }

    pub fn decode(&self, context: &Context) -> LabResult<Iso> {
        Ok(Iso {
            label: self.label.clone(),
            status: self.status,
            job: self.job.clone(),
            floating_bindings: self.floating_bindings.clone(),
            final_layout: self.final_layout.decode_final(context)?,
            prep_layouts: self
                .prep_layouts
                .iter()
                .map(|plate| plate.decode(context))
                .collect::<LabResult<_>>()?,
            final_plates: self.final_plates.clone(),
            prep_plates: self.prep_plates.clone(),
            stock_racks: self
                .stock_racks
                .iter()
                .map(StockRackRecord::decode)
                .collect::<LabResult<_>>()?,
            library_plates: self.library_plates.clone(),
        })
    }
}

/// Stored ISO job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsoJobRecord {
    pub label: EntityLabel,
    pub plan: PlanRecord,
    pub isos: Vec<EntityLabel>,
    #[serde(default)]
    pub prep_plates: Vec<PlateRef>,
    #[serde(default)]
    pub stock_racks: Vec<StockRackRecord>,
    pub processing_series: WorklistSeries,
}

impl From<&IsoJob> for IsoJobRecord {
    fn from(job: &IsoJob) -> Self {
        Self {
            label: job.label.clone(),
            plan: PlanRecord::from(&job.plan),
            isos: job.isos.clone(),
            prep_plates: job.prep_plates.clone(),
            stock_racks: job.stock_racks.iter().map(StockRackRecord::from).collect(),
            processing_series: job.processing_series.clone(),
        }
    }
}

impl IsoJobRecord {
    pub fn pool_ids(&self) -> BTreeSet<PoolId> {
        let mut pools = self.plan.final_layout.record.pool_ids();
        for plate in &self.plan.prep_plates {
            pools.extend(plate.layout.record.pool_ids());
        }
        pools
    }

    pub fn decode(&self, context: &Context) -> LabResult<IsoJob> {
        Ok(IsoJob {
            label: self.label.clone(),
            plan: self.plan.decode(context)?,
            isos: self.isos.clone(),
            prep_plates: self.prep_plates.clone(),
            stock_racks: self
                .stock_racks
                .iter()
                .map(StockRackRecord::decode)
                .collect::<LabResult<_>>()?,
            processing_series: self.processing_series.clone(),
        })
    }
}

/// Context holding every stored pool among `ids`
///
/// Ids missing from the catalog are left out; the decoders report them as
/// unknown pools where the position type requires a known one.
pub async fn decoding_context<R>(repo: &R, ids: &BTreeSet<PoolId>) -> LabResult<Context>
where
    R: PoolRepository + ?Sized,
{
    let mut pools = Vec::new();
    for &id in ids {
        if let Some(pool) = repo.get_pool(id).await? {
            pools.push(pool);
        }
    }
    Ok(Context::default().with_pools(pools))
}
