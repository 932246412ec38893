//! Scenarios without a dilution series of their own

use super::volumes::fit_volume;
use super::wellwise::{plan_buffer_wells, plan_wells};
use super::{EmptyPositionManager, PlanDraft, PlannedWell};
use crate::error::{LabError, LabResult};
use crate::model::{FinalPosition, LabIsoPosition};
use isoprep_common::labels::{EntityKind, RackMarker, RackRole};
use isoprep_common::units;
use tracing::debug;

/// Add a sample well filled straight from its stock tube
fn add_direct_well(draft: &mut PlanDraft<'_>, well: &PlannedWell, volume: f64, concentration: f64) -> LabResult<()> {
    draft.check_capacity(well.position, volume)?;
    let owner = draft.owner(&well.content);
    let base = LabIsoPosition::new(well.position, well.content.clone(), volume, Some(concentration))?;
    draft
        .final_layout
        .add(FinalPosition::new(base, owner == EntityKind::Job))?;
    draft.add_starting_well(RackMarker::final_plate(), well.position, owner, None);
    Ok(())
}

/// Order only: samples are delivered at stock concentration
pub(crate) fn order_only(draft: &mut PlanDraft<'_>) -> LabResult<()> {
    let stock_min = draft.stock_specs().min_transfer_volume;
    for well in draft.requested_wells() {
        if well.content.is_mock() {
            draft.add_final_buffer_well(&well)?;
            continue;
        }
        let Some(key) = well.key() else { continue };
        let stock = draft.stock_concentration(key)?;
        if !units::are_equal(well.concentration(), stock) {
            draft.diagnostics.warn(format!(
                "{} at {} is ordered at its stock concentration of {} instead of {}",
                key,
                well.position,
                units::format_concentration(stock),
                units::format_concentration(well.concentration()),
            ));
        }
        let volume = well.volume.max(stock_min);
        add_direct_well(draft, &well, volume, stock)?;
    }
    Ok(())
}

/// Manual: the request layout is the final layout
///
/// Starting wells are raised so the stock take-out and the buffer remain
/// pipettable; no dilution factor applies.
pub(crate) fn manual(draft: &mut PlanDraft<'_>) -> LabResult<()> {
    let stock_min = draft.stock_specs().min_transfer_volume;
    let buffer_min = draft.buffer_specs().min_transfer_volume;
    for well in draft.requested_wells() {
        if well.content.is_mock() {
            draft.add_final_buffer_well(&well)?;
            continue;
        }
        let Some(key) = well.key() else { continue };
        let stock = draft.stock_concentration(key)?;
        let volume = fit_volume(well.volume, well.concentration(), stock, stock_min, buffer_min);
        if units::is_larger_than(volume, well.volume) {
            debug!(position = %well.position, requested = well.volume, volume, "Raised manual starting well");
        }
        let result = add_direct_well(draft, &well, volume, well.concentration());
        draft.diagnostics.record(result);
    }
    draft.diagnostics.check()
}

/// Library: controls and mocks are prepared by the job and added to every
/// library plate
pub(crate) fn library(draft: &mut PlanDraft<'_>) -> LabResult<()> {
    if draft.request.library.is_none() {
        return Err(LabError::InvalidRequest("library scenario without library".to_string()));
    }
    let transfer = draft.context.constants.volumes.library_transfer_volume;
    let prep_marker = RackMarker::new(RackRole::JobPrep);

    let mut controls = Vec::new();
    let mut mocks = Vec::new();
    for mut well in draft.requested_wells() {
        if !units::are_equal(well.volume, transfer) {
            draft.diagnostics.warn(format!(
                "{} receives the library transfer volume of {} instead of {}",
                well.position,
                units::format_volume(transfer),
                units::format_volume(well.volume),
            ));
            well.volume = transfer;
        }
        if well.content.is_mock() {
            mocks.push(well);
        } else {
            controls.push(well);
        }
    }

    let mut manager = EmptyPositionManager::new(draft.shape(), draft.occupied_positions());
    plan_wells(draft, &controls, prep_marker, false, &mut manager)?;
    plan_buffer_wells(draft, &mocks, prep_marker)
}
