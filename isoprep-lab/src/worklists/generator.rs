//! Worklist generation from a preparation plan
//!
//! Processing series numbering: one slot per plate for its buffer worklist
//! (job preparation, ISO preparation, final plate), then one slot per
//! non-empty transfer worklist. Transfer worklists are ordered by target
//! plate in chain order; quadrant transfers into a plate come before
//! well-to-well transfers into the same plate. Empty buffer worklists keep
//! their slot but are not emitted, so a label number always names the same
//! step.

use super::types::{PlannedTransfer, TransferType, Worklist, WorklistSeries};
use crate::context::Context;
use crate::error::LabResult;
use crate::model::{
    LabIsoPosition, PreparationPlan, ProcessingOrder, RackPosition, RackShape, StockRackLayout, NUMBER_SECTORS,
};
use crate::planner::volumes::source_volume;
use isoprep_common::labels::{EntityKind, RackMarker, RackRole, WorklistLabel};
use isoprep_common::{units, Pipettor};
use std::collections::BTreeMap;
use tracing::debug;

/// Plate of the plan as the generator sees it
struct PlateView<'a> {
    marker: RackMarker,
    wells: Vec<&'a LabIsoPosition>,
    /// Targets on other plates: `(source, target plate, target, volume)`
    external: Vec<(RackPosition, RackMarker, RackPosition, f64)>,
}

impl<'a> PlateView<'a> {
    fn well(&self, position: RackPosition) -> Option<&'a LabIsoPosition> {
        self.wells.iter().copied().find(|w| w.position == position)
    }
}

fn plate_views(plan: &PreparationPlan) -> Vec<PlateView<'_>> {
    let mut views: Vec<PlateView<'_>> = plan
        .job_prep_plates()
        .chain(plan.iso_prep_plates())
        .map(|plate| PlateView {
            marker: plate.marker,
            wells: plate.layout.positions().map(|p| &p.base).collect(),
            external: plate
                .layout
                .positions()
                .flat_map(|p| {
                    p.external_targets.iter().filter_map(move |t| {
                        t.target_rack
                            .map(|marker| (p.base.position, marker.base(), t.position, t.volume))
                    })
                })
                .collect(),
        })
        .collect();
    views.push(PlateView {
        marker: RackMarker::final_plate(),
        wells: plan.final_layout.positions().map(|p| &p.base).collect(),
        external: Vec::new(),
    });
    views
}

/// Phase running transfers out of a plate
fn source_phase(order: ProcessingOrder, source: RackMarker) -> EntityKind {
    match source.role {
        RackRole::JobPrep => EntityKind::Job,
        RackRole::Final => order.intra_final_phase(),
        RackRole::IsoPrep | RackRole::Stock => EntityKind::Iso,
    }
}

/// Volume a starting well receives from its stock tube
fn stock_take_out(plan: &PreparationPlan, context: &Context, well: &LabIsoPosition) -> LabResult<f64> {
    let (Some(key), Some(concentration)) = (well.content.reagent_key(), well.concentration) else {
        return Ok(0.0);
    };
    let stock = context.stock_concentration(key, plan.floating_stock_concentration)?;
    Ok(source_volume(well.volume, concentration, stock))
}

/// One transfer of a pending worklist
#[derive(Debug, Clone, Copy)]
struct PendingTransfer {
    source: RackPosition,
    source_sector: Option<u8>,
    target: RackPosition,
    target_sector: Option<u8>,
    volume: f64,
}

/// Buffer, intra-plate and plate-to-plate worklists of a plan
pub fn generate_processing_series(plan: &PreparationPlan, context: &Context) -> LabResult<WorklistSeries> {
    let views = plate_views(plan);
    let order = plan.processing_order;

    // Step 1: volume arriving in every well
    let mut incoming: BTreeMap<(RackMarker, RackPosition), f64> = BTreeMap::new();
    for view in &views {
        for well in &view.wells {
            if well.is_starting_well() {
                *incoming.entry((view.marker, well.position)).or_default() += stock_take_out(plan, context, well)?;
            }
            for target in &well.transfer_targets {
                *incoming.entry((view.marker, target.position)).or_default() += target.volume;
            }
        }
        for &(_, marker, target, volume) in &view.external {
            *incoming.entry((marker, target)).or_default() += volume;
        }
    }

    // Step 2: transfers grouped by (source plate, target plate)
    let mut pending: BTreeMap<(RackMarker, RackMarker), Vec<PendingTransfer>> = BTreeMap::new();
    for view in &views {
        for well in &view.wells {
            for target in &well.transfer_targets {
                pending.entry((view.marker, view.marker)).or_default().push(PendingTransfer {
                    source: well.position,
                    source_sector: well.sector_index,
                    target: target.position,
                    target_sector: view.well(target.position).and_then(|w| w.sector_index),
                    volume: target.volume,
                });
            }
        }
        for &(source, marker, target, volume) in &view.external {
            let target_sector = views
                .iter()
                .find(|v| v.marker == marker)
                .and_then(|v| v.well(target))
                .and_then(|w| w.sector_index);
            pending.entry((view.marker, marker)).or_default().push(PendingTransfer {
                source,
                source_sector: view.well(source).and_then(|w| w.sector_index),
                target,
                target_sector,
                volume,
            });
        }
    }

    // Step 3: buffer worklists, one reserved slot per plate
    let buffer_specs = match plan.shape {
        RackShape::Wells384 => context.specs(Pipettor::CyBio),
        RackShape::Wells96 => context.specs(Pipettor::Biomek),
    };
    let mut series = WorklistSeries::new();
    let mut index = 0u32;
    for view in &views {
        let transfers: Vec<PlannedTransfer> = view
            .wells
            .iter()
            .filter(|w| w.content.is_sample() || w.content.is_mock())
            .filter_map(|w| {
                let arriving = incoming.get(&(view.marker, w.position)).copied().unwrap_or_default();
                let buffer = units::round_volume(w.volume - arriving);
                units::is_larger_than(buffer, 0.0).then(|| PlannedTransfer::dilution(w.position, buffer))
            })
            .collect();
        if !transfers.is_empty() {
            let phase = buffer_phase(plan, view.marker, pending.keys().copied(), &views);
            series.add(Worklist {
                label: WorklistLabel::buffer(&plan.ticket, index + 1, view.marker),
                index,
                pipettor: buffer_specs.pipettor,
                transfer_type: TransferType::SampleDilution,
                source: None,
                target: view.marker,
                phase,
                transfers,
            });
        }
        index += 1;
    }

    // Step 4: transfer worklists by target plate, quadrant transfers first
    let quadrant = plan.uses_sector_transfers();
    let mut ordered: Vec<((RackMarker, RackMarker), Vec<PendingTransfer>, bool)> = pending
        .into_iter()
        .filter(|(_, transfers)| !transfers.is_empty())
        .map(|(pair, transfers)| {
            let rack = quadrant
                && transfers
                    .iter()
                    .all(|t| t.source_sector.is_some() && t.target_sector.is_some());
            (pair, transfers, rack)
        })
        .collect();
    ordered.sort_by_key(|((source, target), _, rack)| (*target, !*rack, *source));

    for ((source, target), transfers, rack) in ordered {
        let (pipettor, transfer_type, transfers) = if rack {
            (Pipettor::CyBio, TransferType::RackSampleTransfer, rack_transfers(&transfers))
        } else {
            let mut transfers = transfers;
            transfers.sort_by_key(|t| (t.source, t.target));
            let planned = transfers
                .iter()
                .map(|t| PlannedTransfer::SampleTransfer {
                    source: t.source,
                    target: t.target,
                    volume: t.volume,
                })
                .collect();
            (Pipettor::Biomek, TransferType::SampleTransfer, planned)
        };
        series.add(Worklist {
            label: WorklistLabel::transfer(&plan.ticket, index + 1, source, target),
            index,
            pipettor,
            transfer_type,
            source: Some(source),
            target,
            phase: source_phase(order, source),
            transfers,
        });
        index += 1;
    }

    debug!(ticket = %plan.ticket, worklists = ?series.labels(), "Generated processing series");
    Ok(series)
}

/// Quadrant transfers, one per `(source sector, target sector, volume)`
fn rack_transfers(transfers: &[PendingTransfer]) -> Vec<PlannedTransfer> {
    let mut result: Vec<PlannedTransfer> = Vec::new();
    let mut keys: Vec<(u8, u8, f64)> = transfers
        .iter()
        .filter_map(|t| Some((t.source_sector?, t.target_sector?, t.volume)))
        .collect();
    keys.sort_by(|a, b| {
        (a.0, a.1)
            .cmp(&(b.0, b.1))
            .then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
    });
    for (source_sector, target_sector, volume) in keys {
        let duplicate = result.iter().any(|r| match r {
            PlannedTransfer::RackSampleTransfer {
                source_sector: s,
                target_sector: t,
                volume: v,
                ..
            } => *s == source_sector && *t == target_sector && units::are_equal(*v, volume),
            _ => false,
        });
        if !duplicate {
            result.push(PlannedTransfer::RackSampleTransfer {
                source_sector,
                target_sector,
                number_sectors: NUMBER_SECTORS,
                volume,
            });
        }
    }
    result
}

/// First phase in which anything arrives in a plate
fn buffer_phase(
    plan: &PreparationPlan,
    marker: RackMarker,
    pairs: impl Iterator<Item = (RackMarker, RackMarker)>,
    views: &[PlateView<'_>],
) -> EntityKind {
    let order = plan.processing_order;
    let mut phases: Vec<EntityKind> = pairs
        .filter(|(_, target)| *target == marker)
        .map(|(source, _)| source_phase(order, source))
        .collect();
    if let Some(view) = views.iter().find(|v| v.marker == marker) {
        phases.extend(
            view.wells
                .iter()
                .filter_map(|w| w.stock_rack_marker)
                .filter_map(|stock| plan.stock_rack_owner(stock)),
        );
    }
    phases.retain(|p| order.phase_index(*p).is_some());
    phases
        .into_iter()
        .min_by_key(|p| order.phase_index(*p))
        .unwrap_or_else(|| match marker.role {
            RackRole::JobPrep => EntityKind::Job,
            RackRole::IsoPrep => EntityKind::Iso,
            _ => order.phases().first().copied().unwrap_or(EntityKind::Iso),
        })
}

/// Stock transfer worklists of one stock rack, one per target plate
///
/// A quadrant stock rack pours its whole 96-well layout into one sector.
pub fn stock_transfer_series(
    ticket: &str,
    stock: RackMarker,
    layout: &StockRackLayout,
    sector: Option<u8>,
    phase: EntityKind,
) -> WorklistSeries {
    let mut by_target: BTreeMap<RackMarker, Vec<PendingTransfer>> = BTreeMap::new();
    for position in layout.positions() {
        for target in &position.transfer_targets {
            let Some(marker) = target.target_rack else { continue };
            by_target.entry(marker).or_default().push(PendingTransfer {
                source: position.position,
                source_sector: Some(0),
                target: target.position,
                target_sector: sector,
                volume: target.volume,
            });
        }
    }

    let mut series = WorklistSeries::new();
    for (index, (target, mut transfers)) in by_target.into_iter().enumerate() {
        let index = index as u32;
        let (pipettor, transfer_type, planned) = match sector {
            Some(_) => (Pipettor::CyBio, TransferType::RackSampleTransfer, rack_transfers(&transfers)),
            None => {
                transfers.sort_by_key(|t| (t.source, t.target));
                let planned = transfers
                    .iter()
                    .map(|t| PlannedTransfer::SampleTransfer {
                        source: t.source,
                        target: t.target,
                        volume: t.volume,
                    })
                    .collect();
                (Pipettor::BiomekStock, TransferType::SampleTransfer, planned)
            }
        };
        series.add(Worklist {
            label: WorklistLabel::transfer(ticket, index + 1, stock, target),
            index,
            pipettor,
            transfer_type,
            source: Some(stock),
            target,
            phase,
            transfers: planned,
        });
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StockRackPosition, TransferTarget};

    #[test]
    fn test_stock_series_one_worklist_per_target() {
        let mut layout = StockRackLayout::new(RackShape::Wells96);
        let mut tube = StockRackPosition::new(RackPosition::new(0, 0), 205201, "1000001");
        tube.transfer_targets = vec![
            TransferTarget::on_rack(RackPosition::new(1, 1), 1.4, RackMarker::new(RackRole::IsoPrep)),
            TransferTarget::on_rack(RackPosition::new(1, 3), 2.0, RackMarker::final_plate()),
        ];
        layout.add(tube).unwrap();

        let series = stock_transfer_series("T1", RackMarker::stock(1), &layout, None, EntityKind::Iso);
        assert_eq!(series.labels(), vec!["T1_1_s#1_to_p", "T1_2_s#1_to_a"]);
        assert!(series.iter().all(|w| w.pipettor == Pipettor::BiomekStock));
    }

    #[test]
    fn test_quadrant_stock_series_pours_into_sector() {
        let mut layout = StockRackLayout::new(RackShape::Wells96);
        for (column, pool) in [(0, 205201), (1, 330001)] {
            let mut tube = StockRackPosition::new(RackPosition::new(0, column), pool, format!("10{}", column));
            tube.transfer_targets = vec![TransferTarget::on_rack(
                RackPosition::from_quadrant(RackPosition::new(0, column), 1),
                1.0,
                RackMarker::new(RackRole::IsoPrep),
            )];
            layout.add(tube).unwrap();
        }

        let series = stock_transfer_series("T1", RackMarker::stock(3), &layout, Some(1), EntityKind::Iso);
        let worklist = series.get(0).unwrap();
        assert_eq!(worklist.pipettor, Pipettor::CyBio);
        assert_eq!(
            worklist.transfers,
            vec![PlannedTransfer::RackSampleTransfer {
                source_sector: 0,
                target_sector: 1,
                number_sectors: NUMBER_SECTORS,
                volume: 1.0
            }]
        );
    }

    #[test]
    fn test_rack_transfers_group_by_sector_and_volume() {
        let transfer = |sector: u8, volume: f64| PendingTransfer {
            source: RackPosition::new(0, 0),
            source_sector: Some(sector),
            target: RackPosition::new(0, 0),
            target_sector: Some(sector),
            volume,
        };
        let grouped = rack_transfers(&[transfer(0, 2.0), transfer(0, 2.0), transfer(2, 2.0)]);
        assert_eq!(grouped.len(), 2);
    }
}
