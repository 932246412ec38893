//! Stock rack assignment for an ISO job
//!
//! Starting wells are grouped by the stock rack marker the planner gave them.
//! Each `(stock rack, pool)` pair becomes one tube whose take-out covers
//! every target well times its copies. Regular racks hold their tubes in
//! pool order, column by column; a quadrant rack holds each tube at the
//! quadrant of its target wells so one CyBio step pours the whole rack into
//! its sector.

use crate::context::Context;
use crate::diagnostics::Diagnostics;
use crate::error::{LabError, LabResult};
use crate::model::{
    Iso, IsoJob, LabPosition, PoolId, PreparationPlan, RackLayout, RackPosition, RackShape, StockRack,
    StockRackLayout, StockRackPosition, TransferTarget, TubeCandidate, TubeOrigin,
};
use crate::planner::volumes::source_volume;
use crate::repository::{EntityRepository, TubeRepository};
use crate::worklists::stock_transfer_series;
use isoprep_common::labels::{EntityKind, EntityLabel, RackMarker, RackRole};
use isoprep_common::units;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Barcodes of the physical stock racks, keyed by rack label
pub type StockRackBarcodes = BTreeMap<String, String>;

/// Tube slot of one stock rack
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ContainerKey {
    marker: RackMarker,
    pool: PoolId,
    /// Quadrant of a quadrant stock rack
    quadrant: Option<RackPosition>,
}

#[derive(Debug, Clone, Default)]
struct TubeContainer {
    targets: Vec<TransferTarget>,
    /// Total take-out over all targets and copies (µl)
    required: f64,
    /// Tube recorded by an earlier assignment
    requested_tube: Option<String>,
}

/// Starting wells of one owner, collected into tube containers
#[derive(Debug, Default)]
struct ContainerSet {
    containers: BTreeMap<ContainerKey, TubeContainer>,
}

impl ContainerSet {
    /// Add the starting wells of a layout
    ///
    /// Only wells whose stock rack belongs to `owner` are taken; missing
    /// floatings have no pool and are skipped.
    fn collect<P: LabPosition>(
        &mut self,
        plan: &PreparationPlan,
        context: &Context,
        owner: EntityKind,
        plate: RackMarker,
        layout: &RackLayout<P>,
        copies: usize,
    ) -> LabResult<()> {
        for well in layout.starting_wells().map(|p| p.base()) {
            let Some(marker) = well.stock_rack_marker else { continue };
            let Some(rack) = plan.stock_rack(marker) else {
                return Err(LabError::LayoutInvariantViolation(format!(
                    "starting well {} refers to unknown stock rack {}",
                    well.position, marker
                )));
            };
            if rack.owner != owner {
                continue;
            }
            let (Some(pool), Some(key), Some(concentration)) =
                (well.content.pool(), well.content.reagent_key(), well.concentration)
            else {
                continue;
            };
            let stock = context.stock_concentration(key, plan.floating_stock_concentration)?;
            let take_out = source_volume(well.volume, concentration, stock);
            let quadrant = rack.sector.map(|_| well.position.quadrant());

            let container = self
                .containers
                .entry(ContainerKey { marker, pool, quadrant })
                .or_default();
            container.required += take_out * copies as f64;
            if container.requested_tube.is_none() {
                container.requested_tube = well.stock_tube_barcode.clone();
            }
            if !container
                .targets
                .iter()
                .any(|t| t.position == well.position && t.target_rack == Some(plate))
            {
                container
                    .targets
                    .push(TransferTarget::on_rack(well.position, take_out, plate));
            }
        }
        Ok(())
    }
}

/// Choose a tube for a container
///
/// The tube an earlier assignment recorded wins when it still qualifies;
/// otherwise the first candidate not yet used in this run. Qualifying tubes
/// that are all taken report [`LabError::TubeInUse`].
async fn choose_tube<R>(
    repo: &R,
    pool: PoolId,
    container: &TubeContainer,
    dead_volume: f64,
    used: &BTreeSet<String>,
) -> LabResult<TubeCandidate>
where
    R: TubeRepository + ?Sized,
{
    let required = units::round_volume(container.required + dead_volume);
    let candidates = repo.find_candidates(pool, required).await?;
    let preferred = container
        .requested_tube
        .as_ref()
        .and_then(|barcode| candidates.iter().find(|c| &c.tube_barcode == barcode));
    if let Some(tube) = preferred.or_else(|| candidates.iter().find(|c| !used.contains(&c.tube_barcode))) {
        return Ok(tube.clone());
    }
    if !candidates.is_empty() {
        return Err(LabError::TubeInUse {
            pool,
            tubes: candidates.into_iter().map(|c| c.tube_barcode).collect(),
        });
    }

    let all = repo.find_candidates(pool, 0.0).await?;
    match all.iter().map(|c| c.volume).reduce(f64::max) {
        None => Err(LabError::TubeNotFound { pool }),
        Some(available) => Err(LabError::InsufficientVolume {
            pool,
            required,
            available,
        }),
    }
}

/// Lay out the tubes of one stock rack
fn tube_positions(keys: &[ContainerKey]) -> LabResult<BTreeMap<ContainerKey, RackPosition>> {
    let mut slots = RackShape::Wells96.positions_by_column();
    let mut positions = BTreeMap::new();
    for key in keys {
        let position = match key.quadrant {
            Some(quadrant) => quadrant,
            None => slots.next().ok_or_else(|| {
                LabError::LayoutInvariantViolation(format!("stock rack {} holds more than 96 tubes", key.marker))
            })?,
        };
        positions.insert(*key, position);
    }
    Ok(positions)
}

/// Copy of a layout with the chosen tubes recorded on its starting wells
fn record_tubes<P>(
    layout: &RackLayout<P>,
    tubes: &BTreeMap<(RackMarker, PoolId), (String, String)>,
) -> LabResult<RackLayout<P>>
where
    P: LabPosition + Clone,
{
    let mut updated = RackLayout::new(layout.shape());
    for position in layout.positions() {
        let mut position = position.clone();
        let base = position.base_mut();
        if let (Some(marker), Some(pool)) = (base.stock_rack_marker, base.content.pool()) {
            if let Some((tube, rack)) = tubes.get(&(marker, pool)) {
                base.set_stock_tube(tube.clone(), rack.clone())?;
            }
        }
        updated.add(position)?;
    }
    if let Some(stock) = layout.floating_stock_concentration() {
        updated.set_floating_stock_concentration(stock)?;
    }
    updated.close();
    Ok(updated)
}

/// Build the stock racks of one owner from its containers
#[allow(clippy::too_many_arguments)]
async fn build_racks<R>(
    repo: &R,
    context: &Context,
    plan: &PreparationPlan,
    entity: &EntityLabel,
    set: ContainerSet,
    barcodes: &StockRackBarcodes,
    used: &mut BTreeSet<String>,
    diagnostics: &mut Diagnostics,
) -> LabResult<(Vec<StockRack>, BTreeMap<(RackMarker, PoolId), (String, String)>)>
where
    R: TubeRepository + ?Sized,
{
    let dead_volume = context.constants.volumes.stock_dead_volume;
    let mut by_rack: BTreeMap<RackMarker, Vec<(ContainerKey, TubeContainer)>> = BTreeMap::new();
    for (key, container) in set.containers {
        by_rack.entry(key.marker).or_default().push((key, container));
    }

    let mut racks = Vec::new();
    let mut tubes = BTreeMap::new();
    for (marker, containers) in by_rack {
        let label = entity.rack_label(marker);
        let Some(barcode) = barcodes.get(&label) else {
            diagnostics.push(LabError::MissingStockRackBarcode(label));
            continue;
        };
        let sector = plan.stock_rack(marker).and_then(|r| r.sector);
        let keys: Vec<ContainerKey> = containers.iter().map(|(k, _)| *k).collect();
        let positions = tube_positions(&keys)?;

        let mut layout = StockRackLayout::new(RackShape::Wells96);
        for (key, container) in &containers {
            let tube = match choose_tube(repo, key.pool, container, dead_volume, used).await {
                Ok(tube) => tube,
                Err(err) => {
                    diagnostics.push(err);
                    continue;
                }
            };
            used.insert(tube.tube_barcode.clone());
            debug!(
                rack = %label,
                pool = key.pool,
                tube = %tube.tube_barcode,
                take_out = units::round_volume(container.required),
                "Assigned stock tube"
            );

            let mut position = StockRackPosition::new(positions[key], key.pool, tube.tube_barcode.clone());
            position.transfer_targets = container.targets.clone();
            position.origin = Some(TubeOrigin {
                rack_barcode: tube.rack_barcode.clone(),
                position: tube.rack_position,
            });
            layout.add(position)?;
            tubes.insert((marker, key.pool), (tube.tube_barcode, barcode.clone()));
        }
        layout.close();

        let phase = plan.stock_rack_owner(marker).unwrap_or(EntityKind::Iso);
        let series = stock_transfer_series(&plan.ticket, marker, &layout, sector, phase);
        racks.push(StockRack {
            marker,
            label,
            barcode: barcode.clone(),
            sector,
            layout,
            series,
        });
    }
    Ok((racks, tubes))
}

/// Assign stock tubes and racks to a job and its ISOs
///
/// Earlier assignments are replaced. All tube and barcode problems are
/// collected before the run fails; nothing is stored on failure.
pub async fn assign_stock_racks<R>(
    repo: &R,
    context: &Context,
    job_label: &EntityLabel,
    barcodes: &StockRackBarcodes,
) -> LabResult<Vec<StockRack>>
where
    R: TubeRepository + EntityRepository + ?Sized,
{
    // Step 1: load the job and its ISOs
    let mut job: IsoJob = repo
        .get_job(job_label)
        .await?
        .ok_or_else(|| LabError::UnknownLabel(job_label.to_string()))?;
    let mut isos: Vec<Iso> = Vec::new();
    for label in &job.isos {
        let iso = repo
            .get_iso(label)
            .await?
            .ok_or_else(|| LabError::UnknownLabel(label.to_string()))?;
        isos.push(iso);
    }
    let plan = job.plan.clone();
    let iso_count = isos.len().max(1);
    let aliquots = plan.number_aliquots as usize;

    // Step 2: containers of the job (shared controls, poured into every ISO)
    let mut job_set = ContainerSet::default();
    for plate in plan.job_prep_plates() {
        job_set.collect(&plan, context, EntityKind::Job, plate.marker, &plate.layout, 1)?;
    }
    for plate in plan.iso_prep_plates() {
        job_set.collect(&plan, context, EntityKind::Job, plate.marker, &plate.layout, iso_count)?;
    }
    job_set.collect(
        &plan,
        context,
        EntityKind::Job,
        RackMarker::final_plate(),
        &plan.final_layout,
        aliquots * iso_count,
    )?;

    // Step 3: tubes and racks
    let mut diagnostics = Diagnostics::new();
    let mut used = BTreeSet::new();
    let (job_racks, tubes) =
        build_racks(repo, context, &plan, &job.label, job_set, barcodes, &mut used, &mut diagnostics).await?;

    let mut iso_racks = Vec::new();
    for iso in &isos {
        let mut set = ContainerSet::default();
        for plate in &iso.prep_layouts {
            set.collect(&plan, context, EntityKind::Iso, plate.marker, &plate.layout, 1)?;
        }
        set.collect(&plan, context, EntityKind::Iso, RackMarker::final_plate(), &iso.final_layout, aliquots)?;
        let (racks, iso_tubes) =
            build_racks(repo, context, &plan, &iso.label, set, barcodes, &mut used, &mut diagnostics).await?;
        iso_racks.push((racks, iso_tubes));
    }
    diagnostics.check()?;

    // Step 4: record the tubes on the starting wells and attach the racks
    for plate in job.plan.prep_plates.iter_mut().filter(|p| p.marker.role == RackRole::JobPrep) {
        plate.layout = record_tubes(&plate.layout, &tubes)?;
    }
    let mut assigned: Vec<StockRack> = job_racks.clone();
    job.replace_stock_racks(job_racks);
    for (iso, (racks, iso_tubes)) in isos.iter_mut().zip(iso_racks) {
        let mut all = iso_tubes;
        all.extend(tubes.iter().map(|(k, v)| (*k, v.clone())));
        iso.final_layout = record_tubes(&iso.final_layout, &all)?;
        for plate in iso.prep_layouts.iter_mut() {
            plate.layout = record_tubes(&plate.layout, &all)?;
        }
        assigned.extend(racks.iter().cloned());
        iso.replace_stock_racks(racks);
    }
    repo.save_job(&job, &isos).await?;

    for rack in &assigned {
        info!(
            rack = %rack.label,
            barcode = %rack.barcode,
            tubes = rack.layout.len(),
            sector = ?rack.sector,
            "Assigned stock rack"
        );
    }
    Ok(assigned)
}
