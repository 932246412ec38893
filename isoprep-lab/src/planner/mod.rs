//! Preparation-chain builder
//!
//! Turns a validated [`IsoRequest`] into a [`PreparationPlan`]: the final
//! layout, the preparation layouts, the stock rack slots and the processing
//! order. The builder is pure; pools and machine constants come in through
//! the [`Context`].
//!
//! Policies per scenario:
//! - order only: every sample is a starting well at stock concentration
//! - manual: the request is the final layout, starting wells are padded to
//!   the stock minimum transfer volume
//! - optimization: well-wise dilution series through a preparation plate
//! - screening: quadrant transfers planned from the rack-sector association
//! - library: controls for pre-existing library plates, prepared by the job

mod empty_positions;
pub mod isos;
mod scenarios;
mod screening;
pub mod volumes;
mod wellwise;

pub use empty_positions::EmptyPositionManager;
pub use isos::{build_isos, register_job, IsoBatch, IsoDraft};

use crate::context::Context;
use crate::diagnostics::Diagnostics;
use crate::error::{LabError, LabResult};
use crate::model::{
    FinalLayout, FinalPosition, IsoRequest, LabIsoPosition, LabPosition, LayoutPosition, PreparationPlan, PrepLayout,
    PrepPlate, ProcessingOrder, RackLayout, RackPosition, RackShape, ReagentKey, Scenario, StockRackPlan, WellContent,
};
use isoprep_common::labels::{EntityKind, RackMarker, RackRole};
use isoprep_common::{units, PipettingSpecs, Pipettor, ReservoirSpecs};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Order in which job and ISO processing run for a request
pub fn processing_order(request: &IsoRequest) -> ProcessingOrder {
    if request.scenario == Scenario::Library {
        return ProcessingOrder::NoIso;
    }
    let has_controls = request
        .layout
        .positions()
        .any(|p| matches!(p.content(), WellContent::Fixed { .. }));
    match (request.has_floatings() && has_controls, request.process_job_first) {
        (false, _) => ProcessingOrder::NoJob,
        (true, true) => ProcessingOrder::JobFirst,
        (true, false) => ProcessingOrder::IsoFirst,
    }
}

/// Plan the preparation of a request
pub fn plan(request: &IsoRequest, context: &Context) -> LabResult<PreparationPlan> {
    request.validate()?;
    let mut draft = PlanDraft::new(request, context)?;
    info!(
        ticket = %request.ticket,
        scenario = %request.scenario,
        shape = %request.shape(),
        order = %draft.order,
        "Planning ISO preparation"
    );

    // Step 1: nothing may exceed its stock concentration
    draft.check_stock_concentrations()?;

    // Step 2: wells that are carried over without preparation
    draft.add_passive_wells()?;

    // Step 3: scenario policy
    match request.scenario {
        Scenario::OrderOnly => scenarios::order_only(&mut draft)?,
        Scenario::Manual => scenarios::manual(&mut draft)?,
        Scenario::Library => scenarios::library(&mut draft)?,
        Scenario::Optimization => wellwise::plan_optimization(&mut draft)?,
        Scenario::Screening => screening::plan_screening(&mut draft)?,
    }

    let plan = draft.finish()?;
    info!(
        ticket = %plan.ticket,
        prep_plates = plan.prep_plates.len(),
        stock_racks = plan.stock_racks.len(),
        sector_groups = ?plan.sector_groups,
        aliquot_dilution_factor = plan.aliquot_dilution_factor,
        order = %plan.processing_order,
        "Planned ISO preparation"
    );
    Ok(plan)
}

/// Well of the final plate as asked for by the request
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlannedWell {
    pub position: RackPosition,
    pub content: WellContent,
    pub volume: f64,
    pub concentration: Option<f64>,
}

impl PlannedWell {
    pub fn key(&self) -> Option<ReagentKey> {
        self.content.reagent_key()
    }

    pub fn concentration(&self) -> f64 {
        self.concentration.unwrap_or_default()
    }
}

/// Well filled directly from a stock tube
#[derive(Debug, Clone, Copy)]
struct StartingWell {
    plate: RackMarker,
    position: RackPosition,
    owner: EntityKind,
    /// Quadrant stock rack target sector
    sector: Option<u8>,
}

/// Mutable state of one planning run
pub(crate) struct PlanDraft<'a> {
    pub request: &'a IsoRequest,
    pub context: &'a Context,
    pub order: ProcessingOrder,
    pub reservoir: ReservoirSpecs,
    pub final_layout: FinalLayout,
    pub prep_layouts: BTreeMap<RackMarker, PrepLayout>,
    pub sector_groups: Vec<Vec<u8>>,
    pub aliquot_dilution_factor: u32,
    pub diagnostics: Diagnostics,
    starting_wells: Vec<StartingWell>,
}

impl<'a> PlanDraft<'a> {
    fn new(request: &'a IsoRequest, context: &'a Context) -> LabResult<Self> {
        let shape = request.shape();
        let reservoir = context.reservoir(
            request.reservoir.as_deref(),
            shape.number_rows(),
            shape.number_columns(),
        )?;
        let mut final_layout = RackLayout::new(shape);
        if let Some(stock) = request.layout.floating_stock_concentration() {
            final_layout.set_floating_stock_concentration(stock)?;
        }
        Ok(Self {
            request,
            context,
            order: processing_order(request),
            reservoir,
            final_layout,
            prep_layouts: BTreeMap::new(),
            sector_groups: Vec::new(),
            aliquot_dilution_factor: 1,
            diagnostics: Diagnostics::new(),
            starting_wells: Vec::new(),
        })
    }

    pub fn shape(&self) -> RackShape {
        self.request.shape()
    }

    pub fn stock_concentration(&self, key: ReagentKey) -> LabResult<f64> {
        self.context
            .stock_concentration(key, self.request.layout.floating_stock_concentration())
    }

    /// Stock tube transfers
    pub fn stock_specs(&self) -> PipettingSpecs {
        self.context.specs(Pipettor::BiomekStock)
    }

    /// Well-to-well transfers
    pub fn transfer_specs(&self) -> PipettingSpecs {
        self.context.specs(Pipettor::Biomek)
    }

    /// Quadrant transfers
    pub fn quadrant_specs(&self) -> PipettingSpecs {
        self.context.specs(Pipettor::CyBio)
    }

    /// Buffer additions: Biomek on 96-well plates, CyBio on 384-well plates
    pub fn buffer_specs(&self) -> PipettingSpecs {
        match self.shape() {
            RackShape::Wells384 => self.quadrant_specs(),
            RackShape::Wells96 => self.transfer_specs(),
        }
    }

    pub fn increment(&self) -> f64 {
        self.context.constants.volumes.dead_volume_increment
    }

    /// Fixed positions of a request with floatings are controls shared by the job
    pub fn is_control(&self, content: &WellContent) -> bool {
        self.request.has_floatings() && matches!(content, WellContent::Fixed { .. })
    }

    /// Entity whose stock rack fills a starting well of this content
    pub fn owner(&self, content: &WellContent) -> EntityKind {
        if self.order == ProcessingOrder::NoIso || self.is_control(content) {
            EntityKind::Job
        } else {
            EntityKind::Iso
        }
    }

    /// Preparation plate a sample is diluted on
    ///
    /// Controls go through the job preparation plate when the job runs
    /// after the ISOs (and always for library plates).
    pub fn prep_marker_for(&self, content: &WellContent) -> RackMarker {
        match self.order {
            ProcessingOrder::NoIso => RackMarker::new(RackRole::JobPrep),
            ProcessingOrder::IsoFirst if self.is_control(content) => RackMarker::new(RackRole::JobPrep),
            _ => RackMarker::new(RackRole::IsoPrep),
        }
    }

    /// Copies of a transfer from a preparation plate into the final plates
    pub fn copies_to_final(&self, prep_marker: RackMarker) -> usize {
        let aliquots = self.request.number_aliquots as usize;
        match prep_marker.role {
            RackRole::JobPrep => aliquots * self.request.isos_per_job as usize,
            _ => aliquots,
        }
    }

    pub fn prep_layout(&mut self, marker: RackMarker) -> &mut PrepLayout {
        let shape = self.shape();
        self.prep_layouts
            .entry(marker)
            .or_insert_with(|| RackLayout::new(shape))
    }

    pub fn add_starting_well(&mut self, plate: RackMarker, position: RackPosition, owner: EntityKind, sector: Option<u8>) {
        self.starting_wells.push(StartingWell {
            plate,
            position,
            owner,
            sector,
        });
    }

    /// Fail with `VolumeExceedsCapacity` if a well cannot hold `volume`
    pub fn check_capacity(&self, position: RackPosition, volume: f64) -> LabResult<()> {
        if units::is_larger_than(volume, self.reservoir.max_volume) {
            return Err(LabError::VolumeExceedsCapacity {
                position: position.label(),
                volume,
                max_volume: self.reservoir.max_volume,
            });
        }
        Ok(())
    }

    /// Samples and mocks of the request in row-first order
    pub fn requested_wells(&self) -> Vec<PlannedWell> {
        self.request
            .layout
            .positions()
            .filter(|p| p.content.is_sample() || p.content.is_mock())
            .map(|p| PlannedWell {
                position: p.position,
                content: p.content.clone(),
                volume: p.volume.unwrap_or_default(),
                concentration: p.concentration,
            })
            .collect()
    }

    /// Rack positions the request uses (intermediate wells go elsewhere)
    pub fn occupied_positions(&self) -> Vec<RackPosition> {
        self.request
            .layout
            .positions()
            .filter(|p| !p.is_empty())
            .map(|p| p.position)
            .collect()
    }

    /// Mock well that receives buffer only, directly on the final plate
    pub fn add_final_buffer_well(&mut self, well: &PlannedWell) -> LabResult<()> {
        let base = LabIsoPosition::new(well.position, WellContent::Mock, well.volume, None)?;
        self.final_layout.add(FinalPosition::new(base, false))
    }

    fn check_stock_concentrations(&mut self) -> LabResult<()> {
        let mut exceeding: BTreeMap<ReagentKey, (f64, f64, Vec<String>)> = BTreeMap::new();
        for well in self.requested_wells() {
            let Some(key) = well.key() else { continue };
            let stock = match self.stock_concentration(key) {
                Ok(stock) => stock,
                Err(err) => {
                    self.diagnostics.push(err);
                    continue;
                }
            };
            if units::is_larger_than(well.concentration(), stock) {
                let entry = exceeding.entry(key).or_insert((well.concentration(), stock, Vec::new()));
                entry.0 = entry.0.max(well.concentration());
                entry.2.push(well.position.label());
            }
        }
        for (key, (concentration, stock_concentration, positions)) in exceeding {
            self.diagnostics.push(LabError::ConcentrationExceedsStock {
                pool: key.to_string(),
                concentration,
                stock_concentration,
                positions,
            });
        }
        self.diagnostics.check()
    }

    /// Untreated and library positions go to the final layout as they are
    fn add_passive_wells(&mut self) -> LabResult<()> {
        let passive: Vec<_> = self
            .request
            .layout
            .positions()
            .filter(|p| p.content.is_untreated() || matches!(p.content, WellContent::Library { .. }))
            .cloned()
            .collect();
        for position in passive {
            let base = match position.content {
                WellContent::Untreated => LabIsoPosition::new(position.position, WellContent::Untreated, 0.0, None)?,
                content => LabIsoPosition::new(
                    position.position,
                    content,
                    position.volume.unwrap_or_default(),
                    position.concentration,
                )?,
            };
            self.final_layout.add(FinalPosition::new(base, false))?;
        }
        Ok(())
    }

    /// Assign stock rack markers, close the layouts and assemble the plan
    ///
    /// Markers are numbered job racks first, then ISO racks, then quadrant
    /// racks by target sector.
    fn finish(mut self) -> LabResult<PreparationPlan> {
        self.diagnostics.check()?;

        // Step 1: one stock rack per (owner, sector)
        let mut groups: BTreeMap<(bool, u8, Option<u8>), Vec<StartingWell>> = BTreeMap::new();
        for well in &self.starting_wells {
            let owner_rank = match well.owner {
                EntityKind::Job => 0,
                EntityKind::Iso => 1,
            };
            groups
                .entry((well.sector.is_some(), owner_rank, well.sector))
                .or_default()
                .push(*well);
        }

        // Step 2: mark the starting wells
        let mut stock_racks = Vec::new();
        for (index, wells) in groups.into_values().enumerate() {
            let marker = RackMarker::stock(index as u16 + 1);
            let first = wells[0];
            for well in &wells {
                let base = match well.plate.role {
                    RackRole::Final => self.final_layout.get_mut(well.position)?.map(|p| p.base_mut()),
                    _ => match self.prep_layouts.get_mut(&well.plate) {
                        Some(layout) => layout.get_mut(well.position)?.map(|p| p.base_mut()),
                        None => None,
                    },
                };
                match base {
                    Some(base) => base.set_stock_rack_marker(marker)?,
                    None => {
                        return Err(LabError::LayoutInvariantViolation(format!(
                            "starting well {} is missing on plate {}",
                            well.position, well.plate
                        )))
                    }
                }
            }
            debug!(marker = %marker, owner = ?first.owner, sector = ?first.sector, wells = wells.len(), "Reserved stock rack");
            stock_racks.push(StockRackPlan {
                marker,
                owner: first.owner,
                sector: first.sector,
            });
        }

        // Step 3: freeze the layouts
        self.final_layout.close();
        let mut prep_plates = Vec::new();
        for (marker, mut layout) in self.prep_layouts {
            if let Some(stock) = self.request.layout.floating_stock_concentration() {
                layout.set_floating_stock_concentration(stock)?;
            }
            layout.close();
            prep_plates.push(PrepPlate {
                marker,
                reservoir: self.reservoir.name.clone(),
                layout,
            });
        }

        Ok(PreparationPlan {
            ticket: self.request.ticket.clone(),
            scenario: self.request.scenario,
            shape: self.request.shape(),
            number_aliquots: self.request.number_aliquots,
            isos_per_job: self.request.isos_per_job,
            aliquot_dilution_factor: self.aliquot_dilution_factor,
            processing_order: self.order,
            final_layout: self.final_layout,
            final_reservoir: self.reservoir.name.clone(),
            prep_plates,
            stock_racks,
            sector_groups: self.sector_groups,
            floating_stock_concentration: self.request.layout.floating_stock_concentration(),
            library: self.request.library.clone(),
        })
    }
}
