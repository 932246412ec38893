//! Well-wise dilution series
//!
//! Every reagent gets a chain of preparation wells ordered by descending
//! concentration. A well takes its sample from the next higher well when the
//! step stays within the Biomek dilution factor, otherwise from stock, and
//! intermediate wells are inserted when even the stock step is too large.
//! Volumes are then computed bottom-up so every well holds what leaves it
//! plus its dead volume.

use super::volumes::{buffer_volume, dead_volume, fit_volume, source_volume};
use super::{EmptyPositionManager, PlanDraft, PlannedWell};
use crate::error::{LabError, LabResult};
use crate::model::{
    FinalPosition, LabIsoPosition, PrepPosition, RackPosition, ReagentKey, TransferTarget, WellContent,
};
use isoprep_common::labels::{EntityKind, RackMarker, RackRole};
use isoprep_common::units;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Upper bound for the intermediate search; real limits come from the constants
const MAX_SEARCH_STEPS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Source {
    Stock,
    Node(usize),
}

/// One well of a preparation chain
#[derive(Debug, Clone)]
struct PrepNode {
    position: RackPosition,
    concentration: f64,
    source: Source,
    /// Final wells fed by this node with the volume each receives
    finals: Vec<(RackPosition, f64)>,
    /// Chain wells on the same plate fed by this node
    children: Vec<(RackPosition, f64)>,
    volume: f64,
}

/// Optimization: every sample through the preparation plate of its owner
pub(crate) fn plan_optimization(draft: &mut PlanDraft<'_>) -> LabResult<()> {
    let wells = draft.requested_wells();
    let mut by_plate: BTreeMap<RackMarker, Vec<PlannedWell>> = BTreeMap::new();
    let mut mocks = Vec::new();
    for well in wells {
        if well.content.is_mock() {
            mocks.push(well);
        } else {
            by_plate
                .entry(draft.prep_marker_for(&well.content))
                .or_default()
                .push(well);
        }
    }

    for (marker, wells) in by_plate {
        let mut manager = EmptyPositionManager::new(draft.shape(), draft.occupied_positions());
        plan_wells(draft, &wells, marker, true, &mut manager)?;
    }
    for mock in &mocks {
        draft.add_final_buffer_well(mock)?;
    }
    Ok(())
}

/// Plan the chains of a set of sample wells on one preparation plate
///
/// With `intra_final` a final well may donate to a lower final well of the
/// same reagent. Errors are collected per reagent.
pub(crate) fn plan_wells(
    draft: &mut PlanDraft<'_>,
    wells: &[PlannedWell],
    prep_marker: RackMarker,
    intra_final: bool,
    manager: &mut EmptyPositionManager,
) -> LabResult<()> {
    let mut by_key: BTreeMap<ReagentKey, Vec<&PlannedWell>> = BTreeMap::new();
    for well in wells {
        if let Some(key) = well.key() {
            by_key.entry(key).or_default().push(well);
        }
    }
    for (key, wells) in &by_key {
        for well in wells.iter() {
            manager.register(*key, well.position);
        }
    }
    for (key, wells) in by_key {
        let result = plan_reagent(draft, key, &wells, prep_marker, intra_final, manager);
        draft.diagnostics.record(result);
    }
    draft.diagnostics.check()
}

/// Mock wells filled with buffer on a preparation plate, then transferred
pub(crate) fn plan_buffer_wells(
    draft: &mut PlanDraft<'_>,
    mocks: &[PlannedWell],
    prep_marker: RackMarker,
) -> LabResult<()> {
    let copies = draft.copies_to_final(prep_marker);
    let transfer_specs = draft.transfer_specs();
    let increment = draft.increment();
    for mock in mocks {
        let dead = dead_volume(&draft.reservoir, &transfer_specs, copies, increment);
        let volume = units::ceil_volume(mock.volume * copies as f64 + dead);
        draft.check_capacity(mock.position, volume)?;

        let mut prep = PrepPosition::new(LabIsoPosition::new(mock.position, WellContent::Mock, volume, None)?);
        prep.add_external_target(TransferTarget::on_rack(mock.position, mock.volume, RackMarker::final_plate()))?;
        draft.prep_layout(prep_marker).add(prep)?;

        let base = LabIsoPosition::new(mock.position, WellContent::Mock, mock.volume, None)?;
        let from_job = prep_marker.role == RackRole::JobPrep;
        draft.final_layout.add(FinalPosition::new(base, from_job))?;
    }
    Ok(())
}

/// Smallest number of intermediate wells bridging `factor`
///
/// The first step may span `first_max`, every further step `step_max`.
fn intermediate_steps(factor: f64, first_max: f64, step_max: f64) -> Option<u32> {
    (1..=MAX_SEARCH_STEPS).find(|&n| !units::is_larger_than(factor, first_max * step_max.powi(n as i32)))
}

/// Content of a preparation well for a reagent
fn prep_content(key: ReagentKey) -> WellContent {
    match key {
        ReagentKey::Pool(pool) => WellContent::Fixed { pool },
        ReagentKey::Floating(placeholder) => WellContent::Floating { placeholder, pool: None },
    }
}

fn plan_reagent(
    draft: &mut PlanDraft<'_>,
    key: ReagentKey,
    wells: &[&PlannedWell],
    prep_marker: RackMarker,
    intra_final: bool,
    manager: &mut EmptyPositionManager,
) -> LabResult<()> {
    let stock = draft.stock_concentration(key)?;
    let stock_specs = draft.stock_specs();
    let transfer_specs = draft.transfer_specs();
    let buffer_min = draft.buffer_specs().min_transfer_volume;
    let increment = draft.increment();
    let max_steps = draft.context.constants.volumes.max_intermediate_steps;
    let owner = draft.owner(&wells[0].content);

    let mut sorted: Vec<&PlannedWell> = wells.to_vec();
    sorted.sort_by(|a, b| {
        b.concentration()
            .partial_cmp(&a.concentration())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.position.cmp(&b.position))
    });

    // Step 1: donors inside the final plate
    let mut inflow: BTreeMap<RackPosition, f64> = sorted.iter().map(|w| (w.position, w.volume)).collect();
    let mut donations: BTreeMap<RackPosition, Vec<(RackPosition, f64)>> = BTreeMap::new();
    let mut recipients: BTreeSet<RackPosition> = BTreeSet::new();
    if intra_final {
        for (i, well) in sorted.iter().enumerate() {
            let c = well.concentration();
            let donor = sorted[..i]
                .iter()
                .filter(|d| !recipients.contains(&d.position))
                .filter(|d| units::is_larger_than(d.concentration(), c))
                .filter(|d| !units::is_larger_than(d.concentration() / c, transfer_specs.max_dilution_factor))
                .filter_map(|d| {
                    let donation = source_volume(well.volume, c, d.concentration());
                    let buffer = buffer_volume(well.volume, donation);
                    let pipettable = !units::is_smaller_than(donation, transfer_specs.min_transfer_volume)
                        && (units::are_equal(buffer, 0.0) || !units::is_smaller_than(buffer, buffer_min));
                    pipettable.then_some((d.position, donation))
                })
                .last();
            if let Some((donor, donation)) = donor {
                recipients.insert(well.position);
                donations.entry(donor).or_default().push((well.position, donation));
                *inflow.entry(donor).or_default() += donation;
            }
        }
    }

    // Step 2: straight from stock, or through the preparation plate
    let mut direct: Vec<&PlannedWell> = Vec::new();
    let mut prepared: Vec<&PlannedWell> = Vec::new();
    for well in sorted.iter().filter(|w| !recipients.contains(&w.position)) {
        let volume = inflow[&well.position];
        if units::are_equal(well.concentration(), stock)
            && !units::is_smaller_than(volume, stock_specs.min_transfer_volume)
        {
            direct.push(well);
        } else {
            if units::is_smaller_than(volume, transfer_specs.min_transfer_volume) {
                return Err(LabError::InvalidRequest(format!(
                    "{} µl for {} at {} is below the {} minimum of {} µl",
                    volume,
                    key,
                    well.position,
                    transfer_specs.pipettor,
                    transfer_specs.min_transfer_volume
                )));
            }
            prepared.push(well);
        }
    }

    // Step 3: one chain node per concentration
    let mut nodes: Vec<PrepNode> = Vec::new();
    let mut taken: Vec<RackPosition> = Vec::new();
    let mut previous: Option<usize> = None;
    let mut index = 0;
    while index < prepared.len() {
        let c = prepared[index].concentration();
        let level: Vec<&PlannedWell> = prepared[index..]
            .iter()
            .take_while(|w| units::are_equal(w.concentration(), c))
            .copied()
            .collect();
        index += level.len();
        let finals: Vec<(RackPosition, f64)> = level.iter().map(|w| (w.position, inflow[&w.position])).collect();
        let position = level.iter().map(|w| w.position).min().unwrap_or(level[0].position);

        let source = match previous {
            Some(p) if !units::is_larger_than(nodes[p].concentration / c, transfer_specs.max_dilution_factor) => {
                Source::Node(p)
            }
            _ if !units::is_larger_than(stock / c, stock_specs.max_dilution_factor) => Source::Stock,
            _ => {
                let (from, from_concentration, first_max) = match previous {
                    Some(p) => (Source::Node(p), nodes[p].concentration, transfer_specs.max_dilution_factor),
                    None => (Source::Stock, stock, stock_specs.max_dilution_factor),
                };
                let labels = || level.iter().map(|w| w.position.label()).collect::<Vec<_>>();
                let steps = intermediate_steps(from_concentration / c, first_max, transfer_specs.max_dilution_factor)
                    .filter(|&n| n <= max_steps);
                let Some(steps) = steps else {
                    release(manager, &taken);
                    return Err(LabError::UnreachableDilution {
                        pool: key.to_string(),
                        source_concentration: from_concentration,
                        target_concentration: c,
                        max_steps,
                        positions: labels(),
                    });
                };
                let mut source = from;
                for k in (1..=steps).rev() {
                    let Some(position) = manager.take_for(key) else {
                        release(manager, &taken);
                        return Err(LabError::NoRoomForIntermediate {
                            pool: key.to_string(),
                            positions: labels(),
                        });
                    };
                    taken.push(position);
                    nodes.push(PrepNode {
                        position,
                        concentration: units::round_concentration(c * transfer_specs.max_dilution_factor.powi(k as i32)),
                        source,
                        finals: Vec::new(),
                        children: Vec::new(),
                        volume: 0.0,
                    });
                    source = Source::Node(nodes.len() - 1);
                }
                source
            }
        };
        nodes.push(PrepNode {
            position,
            concentration: c,
            source,
            finals,
            children: Vec::new(),
            volume: 0.0,
        });
        previous = Some(nodes.len() - 1);
    }

    // Step 4: volumes from the lowest concentration up
    let copies = draft.copies_to_final(prep_marker);
    let mut ascending: Vec<usize> = (0..nodes.len()).collect();
    ascending.sort_by(|&a, &b| {
        nodes[a]
            .concentration
            .partial_cmp(&nodes[b].concentration)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for idx in ascending {
        let node = &nodes[idx];
        let outgoing: f64 = node.finals.iter().map(|(_, v)| v * copies as f64).sum::<f64>()
            + node.children.iter().map(|(_, v)| v).sum::<f64>();
        let target_count = node.finals.len() * copies + node.children.len();
        let dead = dead_volume(&draft.reservoir, &transfer_specs, target_count, increment);
        let (source_concentration, min_donation) = match node.source {
            Source::Stock => (stock, stock_specs.min_transfer_volume),
            Source::Node(p) => (nodes[p].concentration, transfer_specs.min_transfer_volume),
        };
        let volume = fit_volume(outgoing + dead, node.concentration, source_concentration, min_donation, buffer_min);
        if let Err(err) = draft.check_capacity(node.position, volume) {
            release(manager, &taken);
            return Err(err);
        }
        let (position, concentration, source) = (node.position, node.concentration, node.source);
        nodes[idx].volume = volume;
        if let Source::Node(p) = source {
            let donation = source_volume(volume, concentration, source_concentration);
            nodes[p].children.push((position, donation));
        }
    }

    // Step 5: write the preparation wells
    let content = prep_content(key);
    for node in &nodes {
        let mut base = LabIsoPosition::new(node.position, content.clone(), node.volume, Some(node.concentration))?;
        for &(child, donation) in &node.children {
            base.add_transfer_target(TransferTarget::new(child, donation))?;
        }
        let mut prep = PrepPosition::new(base);
        for &(target, volume) in &node.finals {
            prep.add_external_target(TransferTarget::on_rack(target, volume, RackMarker::final_plate()))?;
        }
        draft.prep_layout(prep_marker).add(prep)?;
        if node.source == Source::Stock {
            draft.add_starting_well(prep_marker, node.position, owner, None);
        }
    }

    // Step 6: write the final wells
    let from_prep_job = prep_marker.role == RackRole::JobPrep;
    for well in &sorted {
        let mut base = LabIsoPosition::new(
            well.position,
            well.content.clone(),
            inflow[&well.position],
            well.concentration,
        )?;
        for &(target, donation) in donations.get(&well.position).into_iter().flatten() {
            base.add_transfer_target(TransferTarget::new(target, donation))?;
        }
        let is_direct = direct.iter().any(|w| w.position == well.position);
        let from_job = if recipients.contains(&well.position) {
            draft.order.intra_final_phase() == EntityKind::Job
        } else if is_direct {
            owner == EntityKind::Job
        } else {
            from_prep_job
        };
        draft.final_layout.add(FinalPosition::new(base, from_job))?;
        if is_direct {
            draft.add_starting_well(RackMarker::final_plate(), well.position, owner, None);
        }
    }

    debug!(
        reagent = %key,
        plate = %prep_marker,
        chain = nodes.len(),
        direct = direct.len(),
        intra_final = recipients.len(),
        "Planned dilution chain"
    );
    Ok(())
}

fn release(manager: &mut EmptyPositionManager, taken: &[RackPosition]) {
    for &position in taken {
        manager.release(position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intermediate_steps() {
        // 50000 -> 10 needs 5000x: stock step 100 then one Biomek step 10 is 1000
        assert_eq!(intermediate_steps(5000.0, 100.0, 10.0), Some(2));
        assert_eq!(intermediate_steps(1000.0, 100.0, 10.0), Some(1));
        assert_eq!(intermediate_steps(50.0, 10.0, 10.0), Some(1));
        assert_eq!(intermediate_steps(1.0e30, 10.0, 1.0), None);
    }

    #[test]
    fn test_prep_content_of_floating_is_unbound() {
        let placeholder = crate::model::Placeholder(3);
        assert_eq!(
            prep_content(ReagentKey::Floating(placeholder)),
            WellContent::Floating { placeholder, pool: None }
        );
    }
}
