//! ISO and ISO-job creation from a plan
//!
//! Each ISO gets its own copy of the final and ISO preparation layouts with
//! floating placeholders bound to concrete pools. The job keeps the plan,
//! the job preparation plates and the processing worklist series.

use crate::context::Context;
use crate::error::{LabError, LabResult};
use crate::model::{
    Iso, IsoJob, IsoStatus, LabPosition, LibraryPlate, Placeholder, PlateRef, PoolId, PreparationPlan, PrepPlate,
    RackLayout, WellContent,
};
use crate::repository::{EntityRepository, RackRepository};
use crate::worklists::WorklistSeries;
use isoprep_common::labels::{EntityLabel, RackMarker, RackRole};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// What to create for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoBatch {
    pub job_number: u32,
    pub first_iso_number: u32,
    pub count: u32,
    /// Create a last ISO even when the floating pools run short
    pub allow_incomplete: bool,
}

impl Default for IsoBatch {
    fn default() -> Self {
        Self {
            job_number: 1,
            first_iso_number: 1,
            count: 1,
            allow_incomplete: false,
        }
    }
}

/// Job and ISOs ready to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct IsoDraft {
    pub job: IsoJob,
    pub isos: Vec<Iso>,
}

/// Copy a layout with floating placeholders bound, closed
fn bind_layout<P>(
    layout: &RackLayout<P>,
    bindings: &BTreeMap<Placeholder, Option<PoolId>>,
    floating_stock: Option<f64>,
) -> LabResult<RackLayout<P>>
where
    P: LabPosition + Clone,
{
    let mut bound = RackLayout::new(layout.shape());
    for position in layout.positions() {
        let mut position = position.clone();
        if let WellContent::Floating { placeholder, pool } = &mut position.base_mut().content {
            *pool = bindings.get(placeholder).copied().flatten();
        }
        bound.add(position)?;
    }
    if let Some(stock) = floating_stock {
        bound.set_floating_stock_concentration(stock)?;
    }
    bound.close();
    Ok(bound)
}

/// Final plate markers: `a` for one aliquot, `a#1..a#n` otherwise
fn final_markers(number_aliquots: u32) -> Vec<RackMarker> {
    if number_aliquots <= 1 {
        vec![RackMarker::final_plate()]
    } else {
        (1..=number_aliquots as u16)
            .map(|n| RackMarker::numbered(RackRole::Final, n))
            .collect()
    }
}

fn plate_ref(entity: &EntityLabel, marker: RackMarker, reservoir: &str) -> PlateRef {
    let label = entity.rack_label(marker);
    PlateRef {
        marker,
        barcode: label.clone(),
        label,
        reservoir: reservoir.to_string(),
    }
}

/// Library plates grouped by layout number, racks ascending
fn library_groups(plan: &PreparationPlan) -> Vec<Vec<LibraryPlate>> {
    let mut groups: BTreeMap<u32, Vec<LibraryPlate>> = BTreeMap::new();
    for plate in plan.library.iter().flat_map(|l| l.plates.iter()) {
        groups.entry(plate.layout_number).or_default().push(plate.clone());
    }
    groups
        .into_values()
        .map(|mut plates| {
            plates.sort_by_key(|p| p.rack_number);
            plates
        })
        .collect()
}

/// Create ISOs and their job for a plan
///
/// Floating placeholders are bound in placeholder order from the pool set
/// in ascending pool id, skipping pools in `used`.
pub fn build_isos(
    plan: &PreparationPlan,
    series: WorklistSeries,
    pool_set: &[PoolId],
    used: &BTreeSet<PoolId>,
    batch: &IsoBatch,
) -> LabResult<IsoDraft> {
    if batch.count == 0 {
        return Err(LabError::InvalidRequest("at least one ISO is required".to_string()));
    }
    let job_label = EntityLabel::job(&plan.ticket, batch.job_number);

    let placeholders: BTreeSet<Placeholder> = plan
        .final_layout
        .positions()
        .filter_map(|p| p.base.content.placeholder())
        .collect();
    let mut available: Vec<PoolId> = pool_set
        .iter()
        .copied()
        .filter(|id| !used.contains(id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    available.reverse();
    let total_available = available.len();
    let required = placeholders.len() * batch.count as usize;
    if !batch.allow_incomplete && required > total_available {
        return Err(LabError::FloatingPoolsExhausted {
            required,
            available: total_available,
        });
    }

    let mut libraries = library_groups(plan);
    if plan.library.is_some() && libraries.len() < batch.count as usize {
        return Err(LabError::LibraryPlatesExhausted {
            required: batch.count as usize,
            available: libraries.len(),
        });
    }
    libraries.reverse();

    let mut isos = Vec::new();
    for n in 0..batch.count {
        // Step 1: bind placeholders
        let bindings: BTreeMap<Placeholder, Option<PoolId>> =
            placeholders.iter().map(|&p| (p, available.pop())).collect();
        if !placeholders.is_empty() && bindings.values().all(Option::is_none) {
            if isos.is_empty() {
                return Err(LabError::FloatingPoolsExhausted {
                    required,
                    available: total_available,
                });
            }
            break;
        }

        // Step 2: layouts and plates
        let label = EntityLabel::iso(&plan.ticket, batch.first_iso_number + n);
        let final_layout = bind_layout(&plan.final_layout, &bindings, plan.floating_stock_concentration)?;
        let mut prep_layouts = Vec::new();
        let mut prep_plates = Vec::new();
        for plate in plan.iso_prep_plates() {
            prep_layouts.push(PrepPlate {
                marker: plate.marker,
                reservoir: plate.reservoir.clone(),
                layout: bind_layout(&plate.layout, &bindings, plan.floating_stock_concentration)?,
            });
            prep_plates.push(plate_ref(&label, plate.marker, &plate.reservoir));
        }
        let (final_plates, library_plates) = match libraries.pop() {
            Some(group) => {
                let markers = final_markers(group.len() as u32);
                let plates = group
                    .iter()
                    .zip(markers)
                    .map(|(plate, marker)| PlateRef {
                        marker,
                        label: plate.label.clone(),
                        barcode: plate.barcode.clone(),
                        reservoir: plan.final_reservoir.clone(),
                    })
                    .collect();
                (plates, group)
            }
            None => (
                final_markers(plan.number_aliquots)
                    .into_iter()
                    .map(|marker| plate_ref(&label, marker, &plan.final_reservoir))
                    .collect(),
                Vec::new(),
            ),
        };

        isos.push(Iso {
            label,
            status: IsoStatus::Queued,
            job: job_label.clone(),
            floating_bindings: bindings,
            final_layout,
            prep_layouts,
            final_plates,
            prep_plates,
            stock_racks: Vec::new(),
            library_plates,
        });
    }

    let job = IsoJob {
        label: job_label.clone(),
        plan: plan.clone(),
        isos: isos.iter().map(|iso| iso.label.clone()).collect(),
        prep_plates: plan
            .job_prep_plates()
            .map(|plate| plate_ref(&job_label, plate.marker, &plate.reservoir))
            .collect(),
        stock_racks: Vec::new(),
        processing_series: series,
    };
    Ok(IsoDraft { job, isos })
}

/// Register the plates of a draft and store job and ISOs
pub async fn register_job<R>(repo: &R, context: &Context, draft: &IsoDraft) -> LabResult<()>
where
    R: RackRepository + EntityRepository + ?Sized,
{
    let shape = draft.job.plan.shape;
    let mut plates: Vec<&PlateRef> = draft.job.prep_plates.iter().collect();
    for iso in &draft.isos {
        plates.extend(iso.prep_plates.iter());
        if iso.library_plates.is_empty() {
            plates.extend(iso.final_plates.iter());
        }
    }
    for plate in plates {
        let specs = context.reservoir(Some(&plate.reservoir), shape.number_rows(), shape.number_columns())?;
        repo.create_plate(&specs, shape, &plate.label, &plate.barcode).await?;
    }
    repo.save_job(&draft.job, &draft.isos).await?;
    info!(
        job = %draft.job.label,
        isos = draft.isos.len(),
        "Registered ISO job"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_markers() {
        assert_eq!(final_markers(1), vec![RackMarker::final_plate()]);
        assert_eq!(
            final_markers(2),
            vec![
                RackMarker::numbered(RackRole::Final, 1),
                RackMarker::numbered(RackRole::Final, 2)
            ]
        );
    }

    #[test]
    fn test_plate_ref_uses_rack_label_as_barcode() {
        let iso = EntityLabel::iso("T1", 1);
        let plate = plate_ref(&iso, RackMarker::new(RackRole::IsoPrep), "standard 96");
        assert_eq!(plate.label, "T1_iso_01_p");
        assert_eq!(plate.barcode, plate.label);
    }
}
