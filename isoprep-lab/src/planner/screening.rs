//! Quadrant-transfer planning for 384-well screening layouts
//!
//! The preparation plate mirrors the final plate sector by sector; one CyBio
//! step per sector moves the preparation into the final plate. When the
//! lowest root concentration cannot be reached from stock in one stock step,
//! the preparation runs at `k × final concentration` and the final plate is
//! diluted on arrival.

use super::volumes::{dead_volume, fit_volume, source_volume};
use super::wellwise::{plan_optimization, plan_wells};
use super::{EmptyPositionManager, PlanDraft, PlannedWell};
use crate::error::{LabError, LabResult};
use crate::model::{
    FinalPosition, LabIsoPosition, PrepPosition, RackLayout, RackPosition, RackShape, RequestPosition,
    TransferTarget, WellContent,
};
use crate::sectors::{associate, SectorAssociation};
use isoprep_common::labels::{EntityKind, RackMarker, RackRole};
use isoprep_common::units;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Volumes of one preparation sector
#[derive(Debug, Clone, Copy)]
struct SectorVolumes {
    /// Volume of every preparation well of the sector
    volume: f64,
    /// Quadrant transfer into the final plate
    transfer: f64,
    /// Volume received from the parent sector
    donation: Option<f64>,
}

pub(crate) fn plan_screening(draft: &mut PlanDraft<'_>) -> LabResult<()> {
    if draft.shape() != RackShape::Wells384 {
        draft.diagnostics.warn(format!(
            "{} screening layout has no sectors, planning well-wise",
            draft.shape()
        ));
        return plan_optimization(draft);
    }

    // Step 1: split the wells into the quadrant chain and job controls
    let prep_marker = RackMarker::new(RackRole::IsoPrep);
    let mut chain: Vec<PlannedWell> = Vec::new();
    let mut controls: Vec<PlannedWell> = Vec::new();
    for well in draft.requested_wells() {
        if well.content.is_sample() && draft.prep_marker_for(&well.content) != prep_marker {
            controls.push(well);
        } else {
            chain.push(well);
        }
    }
    let mut chain_layout = RackLayout::new(RackShape::Wells384);
    for well in &chain {
        let volume = Some(well.volume);
        chain_layout.add(RequestPosition::new(well.position, well.content.clone(), volume, well.concentration)?)?;
    }

    // Step 2: sector association and aliquot dilution factor
    let quadrant_specs = draft.quadrant_specs();
    let association = associate(&chain_layout, quadrant_specs.max_dilution_factor)?;
    let factor = aliquot_dilution_factor(draft, &association, &chain)?;
    draft.aliquot_dilution_factor = factor;
    draft.sector_groups = association.groups.clone();

    // Step 3: volumes, children before parents
    let volumes = sector_volumes(draft, &association, &chain, factor)?;

    // Step 4: preparation and final wells
    let grouped: BTreeSet<u8> = association.concentrations.keys().copied().collect();
    let chain_positions: BTreeSet<RackPosition> = chain
        .iter()
        .filter(|w| grouped.contains(&w.position.sector_index()))
        .map(|w| w.position)
        .collect();
    for well in &chain {
        let sector = well.position.sector_index();
        let Some(sector_volumes) = volumes.get(&sector) else {
            draft.add_final_buffer_well(well)?;
            continue;
        };
        let concentration = association.concentrations[&sector];
        let sample_concentration = well.content.is_sample().then_some(concentration);

        let mut base = LabIsoPosition::new(
            well.position,
            prep_content(&well.content),
            sector_volumes.volume,
            sample_concentration.map(|c| units::round_concentration(c * factor as f64)),
        )?;
        base.set_sector_index(sector)?;
        for child in association.children(sector) {
            let target = RackPosition::from_quadrant(well.position.quadrant(), child);
            let donation = volumes.get(&child).and_then(|v| v.donation);
            if let (true, Some(donation)) = (chain_positions.contains(&target), donation) {
                base.add_transfer_target(TransferTarget::new(target, donation))?;
            }
        }
        let mut prep = PrepPosition::new(base);
        prep.add_external_target(TransferTarget::on_rack(
            well.position,
            sector_volumes.transfer,
            RackMarker::final_plate(),
        ))?;
        draft.prep_layout(prep_marker).add(prep)?;

        if association.is_root(sector) && well.content.is_sample() {
            match &well.content {
                WellContent::Floating { .. } => {
                    draft.add_starting_well(prep_marker, well.position, EntityKind::Iso, Some(sector))
                }
                content => {
                    let owner = draft.owner(content);
                    draft.add_starting_well(prep_marker, well.position, owner, None)
                }
            }
        }

        let mut final_base = LabIsoPosition::new(well.position, well.content.clone(), well.volume, sample_concentration)?;
        final_base.set_sector_index(sector)?;
        draft.final_layout.add(FinalPosition::new(final_base, false))?;
    }

    // Step 5: controls processed by the job after the ISOs
    if !controls.is_empty() {
        let job_prep = RackMarker::new(RackRole::JobPrep);
        let mut manager = EmptyPositionManager::new(draft.shape(), draft.occupied_positions());
        plan_wells(draft, &controls, job_prep, false, &mut manager)?;
    }

    debug!(
        groups = ?association.groups,
        factor,
        controls = controls.len(),
        "Planned quadrant transfers"
    );
    Ok(())
}

/// Preparation wells hold the reagent, floatings stay unbound
fn prep_content(content: &WellContent) -> WellContent {
    match content {
        WellContent::Floating { placeholder, .. } => WellContent::Floating {
            placeholder: *placeholder,
            pool: None,
        },
        other => other.clone(),
    }
}

/// Smallest `k` that keeps every root sector within one stock step
fn aliquot_dilution_factor(
    draft: &PlanDraft<'_>,
    association: &SectorAssociation,
    chain: &[PlannedWell],
) -> LabResult<u32> {
    let stock_max = draft.stock_specs().max_dilution_factor;
    let quadrant_specs = draft.quadrant_specs();
    let mut factor = 1u32;
    let mut limiting: Option<(String, f64, f64)> = None;
    for root in association.roots() {
        let concentration = association.concentrations[&root];
        for well in chain.iter().filter(|w| w.position.sector_index() == root) {
            let Some(key) = well.key() else { continue };
            let stock = draft.stock_concentration(key)?;
            let needed = ((stock / (stock_max * concentration)) - units::TOLERANCE).ceil().max(1.0) as u32;
            if needed > factor {
                factor = needed;
                limiting = Some((key.to_string(), stock, concentration));
            }
        }
    }

    let unreachable = |reason_positions: Vec<String>| {
        let (pool, stock, concentration) = limiting.clone().unwrap_or_default();
        LabError::UnreachableDilution {
            pool,
            source_concentration: stock,
            target_concentration: concentration,
            max_steps: 1,
            positions: reason_positions,
        }
    };
    if units::is_larger_than(factor as f64, quadrant_specs.max_dilution_factor) {
        return Err(unreachable(Vec::new()));
    }
    for (&sector, &volume) in &association.volumes {
        if units::is_smaller_than(units::round_volume(volume / factor as f64), quadrant_specs.min_transfer_volume) {
            let positions = chain
                .iter()
                .filter(|w| w.position.sector_index() == sector)
                .map(|w| w.position.label())
                .collect();
            return Err(unreachable(positions));
        }
    }
    Ok(factor)
}

/// Required volume, transfer and donation per grouped sector
fn sector_volumes(
    draft: &PlanDraft<'_>,
    association: &SectorAssociation,
    chain: &[PlannedWell],
    factor: u32,
) -> LabResult<BTreeMap<u8, SectorVolumes>> {
    let quadrant_specs = draft.quadrant_specs();
    let stock_min = draft.stock_specs().min_transfer_volume;
    let buffer_min = draft.buffer_specs().min_transfer_volume;
    let copies = draft.copies_to_final(RackMarker::new(RackRole::IsoPrep));
    let dead = dead_volume(&draft.reservoir, &quadrant_specs, copies, draft.increment());
    let k = factor as f64;

    let mut result: BTreeMap<u8, SectorVolumes> = BTreeMap::new();
    for group in &association.groups {
        for &sector in group.iter().rev() {
            let transfer = units::round_volume(association.volumes[&sector] / k);
            let donated: f64 = association
                .children(sector)
                .iter()
                .filter_map(|child| result.get(child).and_then(|v| v.donation))
                .sum();
            let required = transfer * copies as f64 + donated + dead;
            let concentration = association.concentrations[&sector] * k;

            let (volume, donation) = match association.parents.get(&sector) {
                Some(parent) => {
                    let parent_concentration = association.concentrations[parent] * k;
                    let volume = fit_volume(
                        required,
                        concentration,
                        parent_concentration,
                        quadrant_specs.min_transfer_volume,
                        buffer_min,
                    );
                    (volume, Some(source_volume(volume, concentration, parent_concentration)))
                }
                None => {
                    let mut volume = units::ceil_volume(required);
                    for well in chain.iter().filter(|w| w.position.sector_index() == sector) {
                        let Some(key) = well.key() else { continue };
                        let stock = draft.stock_concentration(key)?;
                        volume = volume.max(fit_volume(required, concentration, stock, stock_min, buffer_min));
                    }
                    (volume, None)
                }
            };
            for well in chain.iter().filter(|w| w.position.sector_index() == sector) {
                draft.check_capacity(well.position, volume)?;
            }
            result.insert(
                sector,
                SectorVolumes {
                    volume,
                    transfer,
                    donation,
                },
            );
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Placeholder;

    #[test]
    fn test_prep_content_unbinds_floatings() {
        let placeholder = Placeholder(1);
        let bound = WellContent::Floating {
            placeholder,
            pool: Some(205201),
        };
        assert_eq!(prep_content(&bound), WellContent::Floating { placeholder, pool: None });
        assert_eq!(prep_content(&WellContent::Mock), WellContent::Mock);
    }
}
