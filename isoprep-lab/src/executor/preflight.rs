//! Pre-flight shared by printing and execution
//!
//! Loads the entity with its job and ISOs, checks the ISO states against
//! the phase, verifies the racks and expands the worklists of the phase into
//! transfer jobs on concrete racks. A plate missing from the inventory enters
//! the plan as an unsaved empty rack; only the execution commit stores it.

use crate::context::Context;
use crate::diagnostics::Diagnostics;
use crate::error::{LabError, LabResult};
use crate::model::{
    Entity, Iso, IsoJob, IsoStatus, LayoutPosition, PlateRef, ProcessingOrder, Rack, RackPosition, RackShape,
    StockRack,
};
use crate::repository::{EntityRepository, RackRepository};
use crate::verifier::{self, ExpectedWell, VerificationReport};
use crate::worklists::{PlannedTransfer, Worklist};
use isoprep_common::labels::{EntityKind, EntityLabel, RackMarker, RackRole};
use isoprep_common::units;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Rack as named in instructions and worklist files
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RackRef {
    pub label: String,
    pub barcode: String,
}

impl RackRef {
    fn plate(plate: &PlateRef) -> Self {
        Self {
            label: plate.label.clone(),
            barcode: plate.barcode.clone(),
        }
    }

    fn stock(rack: &StockRack) -> Self {
        Self {
            label: rack.label.clone(),
            barcode: rack.barcode.clone(),
        }
    }
}

/// One worklist applied to one pair of racks
#[derive(Debug, Clone, PartialEq)]
pub struct TransferJob {
    pub worklist: Worklist,
    /// `None` for buffer worklists
    pub source: Option<RackRef>,
    pub target: RackRef,
}

impl TransferJob {
    pub fn is_buffer(&self) -> bool {
        self.worklist.is_buffer()
    }

    /// Position pairs of a rack transfer between two racks
    pub fn sector_pairs(
        source: &Rack,
        target: &Rack,
        source_sector: u8,
        target_sector: u8,
    ) -> Vec<(RackPosition, RackPosition)> {
        let to_source = |q: RackPosition| match source.shape {
            RackShape::Wells96 => q,
            RackShape::Wells384 => RackPosition::from_quadrant(q, source_sector),
        };
        let to_target = |q: RackPosition| match target.shape {
            RackShape::Wells96 => q,
            RackShape::Wells384 => RackPosition::from_quadrant(q, target_sector),
        };
        RackShape::Wells96
            .positions()
            .map(|q| (to_source(q), to_target(q)))
            .filter(|(s, _)| source.sample(*s).is_some())
            .collect()
    }
}

/// Everything one phase of one entity needs
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub entity: EntityLabel,
    pub phase: EntityKind,
    pub order: ProcessingOrder,
    pub job: IsoJob,
    /// ISOs moved by this phase
    pub isos: Vec<Iso>,
    /// Stock racks poured in this phase
    pub stock_racks: Vec<StockRack>,
    /// Current state of every rack involved, by barcode
    pub racks: BTreeMap<String, Rack>,
    /// Barcodes of plates not stored yet
    pub new_plates: BTreeSet<String>,
    /// Transfer jobs in execution order
    pub jobs: Vec<TransferJob>,
}

impl ExecutionPlan {
    /// Status the ISOs must have before this phase
    pub fn expected_status(&self) -> IsoStatus {
        expected_status(self.order, self.phase)
    }

    /// Status the ISOs get after this phase
    pub fn next_status(&self) -> IsoStatus {
        if self.order.is_last_phase(self.phase) {
            IsoStatus::Done
        } else {
            IsoStatus::InProgress
        }
    }

    /// Notes printed at the top of the instructions
    pub fn notes(&self) -> Vec<String> {
        let mut notes = Vec::new();
        match (self.order, self.phase) {
            (ProcessingOrder::JobFirst, EntityKind::Job) => {
                notes.push("Process the job first: the ISOs of this job are processed afterwards.".to_string())
            }
            (ProcessingOrder::JobFirst, EntityKind::Iso) => {
                notes.push("The job of this ISO must have been processed already.".to_string())
            }
            (ProcessingOrder::IsoFirst, EntityKind::Iso) => notes.push(
                "Process the ISOs first: the job completes the final plates afterwards.".to_string(),
            ),
            (ProcessingOrder::IsoFirst, EntityKind::Job) => {
                notes.push("All ISOs of this job must have been processed already.".to_string())
            }
            (ProcessingOrder::NoJob, _) => notes.push("No job processing required.".to_string()),
            (ProcessingOrder::NoIso, _) => notes.push(
                "Library plates: the job fills the final plates, no ISO processing required.".to_string(),
            ),
        }
        if self.isos.iter().any(|iso| !iso.library_plates.is_empty()) {
            let plates: Vec<String> = self
                .isos
                .iter()
                .flat_map(|iso| iso.library_plates.iter().map(|p| p.barcode.clone()))
                .collect();
            notes.push(format!("Library plates used as final plates: {}", plates.join(", ")));
        }
        notes
    }
}

fn expected_status(order: ProcessingOrder, phase: EntityKind) -> IsoStatus {
    match order.phase_index(phase) {
        Some(0) | None => IsoStatus::Queued,
        Some(_) => IsoStatus::InProgress,
    }
}

/// Racks a marker stands for, for one ISO
fn resolve(marker: RackMarker, job: &IsoJob, iso: &Iso, stock: &[StockRack]) -> Vec<RackRef> {
    match marker.role {
        RackRole::JobPrep => job
            .prep_plates
            .iter()
            .filter(|p| p.marker == marker)
            .map(RackRef::plate)
            .collect(),
        RackRole::IsoPrep => iso
            .prep_plates
            .iter()
            .filter(|p| p.marker == marker)
            .map(RackRef::plate)
            .collect(),
        RackRole::Final => iso
            .final_plates
            .iter()
            .filter(|p| p.marker.base() == marker.base())
            .map(RackRef::plate)
            .collect(),
        RackRole::Stock => stock
            .iter()
            .filter(|r| r.marker == marker)
            .map(RackRef::stock)
            .collect(),
    }
}

/// Expand one worklist over the ISOs of the phase
///
/// Final-to-final worklists pair each aliquot plate with itself; any other
/// worklist pours its single source into every target. A job preparation
/// plate shared by all ISOs is handled once.
fn expand(
    worklist: &Worklist,
    job: &IsoJob,
    isos: &[Iso],
    stock: &[StockRack],
    jobs: &mut Vec<TransferJob>,
) -> LabResult<()> {
    let mut seen: BTreeSet<(Option<String>, String)> = BTreeSet::new();
    for iso in isos {
        let targets = resolve(worklist.target, job, iso, stock);
        if targets.is_empty() {
            return Err(LabError::UnknownLabel(iso.label.rack_label(worklist.target)));
        }
        let pairs: Vec<(Option<RackRef>, RackRef)> = match worklist.source {
            None => targets.into_iter().map(|t| (None, t)).collect(),
            Some(source) => {
                let sources = resolve(source, job, iso, stock);
                if sources.is_empty() {
                    return Err(LabError::UnknownLabel(iso.label.rack_label(source)));
                }
                if source.role == RackRole::Final && worklist.target.role == RackRole::Final {
                    sources
                        .into_iter()
                        .zip(targets)
                        .map(|(s, t)| (Some(s), t))
                        .collect()
                } else {
                    targets
                        .into_iter()
                        .map(|t| (Some(sources[0].clone()), t))
                        .collect()
                }
            }
        };
        for (source, target) in pairs {
            if !seen.insert((source.as_ref().map(|s| s.barcode.clone()), target.barcode.clone())) {
                continue;
            }
            jobs.push(TransferJob {
                worklist: worklist.clone(),
                source,
                target,
            });
        }
    }
    Ok(())
}

/// Take-out per stock tube over all transfer jobs
fn stock_take_out(jobs: &[TransferJob], rack: &StockRack) -> BTreeMap<RackPosition, f64> {
    let mut required: BTreeMap<RackPosition, f64> = BTreeMap::new();
    for job in jobs {
        if job.source.as_ref().map(|s| s.barcode.as_str()) != Some(rack.barcode.as_str()) {
            continue;
        }
        for transfer in &job.worklist.transfers {
            match transfer {
                PlannedTransfer::SampleTransfer { source, volume, .. } => {
                    *required.entry(*source).or_default() += volume;
                }
                PlannedTransfer::RackSampleTransfer { volume, .. } => {
                    for position in rack.layout.rack_positions() {
                        *required.entry(position).or_default() += volume;
                    }
                }
                PlannedTransfer::SampleDilution { .. } => {}
            }
        }
    }
    required
}

/// Wells a final plate must show before this phase
fn final_plate_expectations(
    iso: &Iso,
    order: ProcessingOrder,
    phase: EntityKind,
    library: bool,
) -> (BTreeMap<RackPosition, ExpectedWell>, bool) {
    let first_phase = order.phase_index(phase) == Some(0);
    if first_phase {
        if !library {
            return (BTreeMap::new(), true);
        }
        let expected = iso
            .final_layout
            .positions()
            .filter(|p| p.content().is_sample() || p.content().is_mock())
            .map(|p| (p.rack_position(), ExpectedWell::Empty))
            .collect();
        return (expected, false);
    }
    let filled_by_job = order.phases().first() == Some(&EntityKind::Job);
    let expected = iso
        .final_layout
        .positions()
        .filter(|p| p.from_job == filled_by_job)
        .filter_map(|p| p.content().pool().map(|pool| (p.rack_position(), ExpectedWell::Sample { pool })))
        .collect();
    (expected, false)
}

/// Load the entity and prepare one phase
///
/// Reads only: nothing is written to the repository.
pub async fn prepare<R>(repo: &R, context: &Context, label: &EntityLabel) -> LabResult<ExecutionPlan>
where
    R: RackRepository + EntityRepository + ?Sized,
{
    // Step 1: entity, job and the ISOs of the phase
    let entity = repo
        .get_entity(label)
        .await?
        .ok_or_else(|| LabError::UnknownLabel(label.to_string()))?;
    let phase = entity.kind();
    let (job, isos) = match entity {
        Entity::Iso(iso) => {
            let job = repo
                .get_job(&iso.job)
                .await?
                .ok_or_else(|| LabError::UnknownLabel(iso.job.to_string()))?;
            (job, vec![iso])
        }
        Entity::Job(job) => {
            let mut isos = Vec::new();
            for iso_label in &job.isos {
                let iso = repo
                    .get_iso(iso_label)
                    .await?
                    .ok_or_else(|| LabError::UnknownLabel(iso_label.to_string()))?;
                if iso.status != IsoStatus::Canceled {
                    isos.push(iso);
                }
            }
            (job, isos)
        }
    };
    let order = job.plan.processing_order;
    if order.phase_index(phase).is_none() {
        return Err(LabError::InvalidRequest(format!(
            "{} has no {} phase (processing order {})",
            label, phase, order
        )));
    }

    // Step 2: ISO states
    let expected = expected_status(order, phase);
    let mut diagnostics = Diagnostics::new();
    for iso in &isos {
        if iso.status != expected {
            diagnostics.push(LabError::UnexpectedStatus {
                entity: iso.label.to_string(),
                found: iso.status,
                expected,
            });
        }
    }
    diagnostics.check()?;

    // Step 3: transfer jobs (buffers, stock racks, processing)
    let stock_racks: Vec<StockRack> = match phase {
        EntityKind::Job => job.stock_racks.clone(),
        EntityKind::Iso => isos.iter().flat_map(|iso| iso.stock_racks.iter().cloned()).collect(),
    };
    let mut jobs = Vec::new();
    for worklist in job.processing_series.for_phase(phase).filter(|w| w.is_buffer()) {
        expand(worklist, &job, &isos, &stock_racks, &mut jobs)?;
    }
    for rack in &stock_racks {
        let owners: Vec<Iso> = match phase {
            EntityKind::Job => isos.clone(),
            EntityKind::Iso => isos
                .iter()
                .filter(|iso| iso.stock_racks.iter().any(|r| r.barcode == rack.barcode))
                .cloned()
                .collect(),
        };
        let own = std::slice::from_ref(rack);
        for worklist in rack.series.iter() {
            expand(worklist, &job, &owners, own, &mut jobs)?;
        }
    }
    for worklist in job.processing_series.for_phase(phase).filter(|w| !w.is_buffer()) {
        expand(worklist, &job, &isos, &stock_racks, &mut jobs)?;
    }

    // Step 4: racks loaded, missing plates stand in empty
    let shape = job.plan.shape;
    let library_barcodes: BTreeSet<String> = isos
        .iter()
        .flat_map(|iso| iso.library_plates.iter().map(|p| p.barcode.clone()))
        .collect();
    let plates: Vec<PlateRef> = job
        .prep_plates
        .iter()
        .chain(isos.iter().flat_map(|iso| iso.plates()))
        .cloned()
        .collect();
    let mut racks: BTreeMap<String, Rack> = BTreeMap::new();
    let mut new_plates: BTreeSet<String> = BTreeSet::new();
    for plate in &plates {
        let rack = match repo.get_rack(&plate.barcode).await? {
            Some(rack) => rack,
            None if library_barcodes.contains(&plate.barcode) => {
                return Err(LabError::UnknownLabel(plate.barcode.clone()));
            }
            None => {
                let specs = context.reservoir(Some(&plate.reservoir), shape.number_rows(), shape.number_columns())?;
                debug!(barcode = %plate.barcode, label = %plate.label, "Plate not stored yet");
                new_plates.insert(plate.barcode.clone());
                Rack::plate(&plate.barcode, &plate.label, shape, specs.name)
            }
        };
        racks.insert(plate.barcode.clone(), rack);
    }
    for stock in &stock_racks {
        let rack = repo
            .get_rack(&stock.barcode)
            .await?
            .unwrap_or_else(|| Rack::tube_rack(&stock.barcode, &stock.label));
        racks.insert(stock.barcode.clone(), rack);
    }

    // Step 5: verification
    let mut reports: Vec<VerificationReport> = Vec::new();
    let dead_volume = context.constants.volumes.stock_dead_volume;
    for stock in &stock_racks {
        if let Some(rack) = racks.get(&stock.barcode) {
            let required = stock_take_out(&jobs, stock);
            reports.push(verifier::verify_stock_rack(rack, &stock.layout, &required, dead_volume));
        }
    }
    let first_phase = order.phase_index(phase) == Some(0);
    for iso in &isos {
        for plate in &iso.final_plates {
            let library = library_barcodes.contains(&plate.barcode);
            let Some(rack) = racks.get(&plate.barcode) else { continue };
            let (expected, strict) = final_plate_expectations(iso, order, phase, library);
            reports.push(verifier::verify_plate(rack, shape, &expected, strict));
        }
        if first_phase && phase == EntityKind::Iso {
            for plate in &iso.prep_plates {
                if let Some(rack) = racks.get(&plate.barcode) {
                    reports.push(verifier::verify_empty(rack, shape));
                }
            }
        }
    }
    if first_phase && phase == EntityKind::Job {
        for plate in job.prep_plates.iter().chain(isos.iter().flat_map(|iso| iso.prep_plates.iter())) {
            if let Some(rack) = racks.get(&plate.barcode) {
                reports.push(verifier::verify_empty(rack, shape));
            }
        }
    }
    let mut diagnostics = Diagnostics::new();
    for report in &reports {
        for error in report.errors() {
            diagnostics.push(error);
        }
    }
    diagnostics.check()?;

    debug!(
        entity = %label,
        jobs = jobs.len(),
        volume = units::round_volume(jobs.iter().map(|j| j.worklist.total_volume()).sum()),
        "Prepared transfer jobs"
    );
    info!(entity = %label, phase = %phase, order = %order, isos = isos.len(), "Pre-flight passed");
    Ok(ExecutionPlan {
        entity: label.clone(),
        phase,
        order,
        job,
        isos,
        stock_racks,
        racks,
        new_plates,
        jobs,
    })
}
