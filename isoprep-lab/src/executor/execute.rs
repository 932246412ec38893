//! Execution of one phase against the stored sample state

use super::preflight::{prepare, ExecutionPlan, TransferJob};
use crate::context::Context;
use crate::error::{LabError, LabResult};
use crate::model::{IsoStatus, Rack, RackPosition, Sample};
use crate::repository::{EntityRepository, ExecutedWorklist, ExecutionChangeSet, RackRepository};
use crate::worklists::PlannedTransfer;
use chrono::Utc;
use isoprep_common::labels::{EntityKind, EntityLabel};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Summary of an executed phase
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub entity: EntityLabel,
    pub phase: EntityKind,
    /// Worklist labels in execution order, one per transfer job
    pub worklists: Vec<String>,
    pub status: IsoStatus,
}

fn rack_mut<'a>(racks: &'a mut BTreeMap<String, Rack>, barcode: &str) -> LabResult<&'a mut Rack> {
    racks
        .get_mut(barcode)
        .ok_or_else(|| LabError::UnknownLabel(barcode.to_string()))
}

/// Move `volume` from one well or tube into another
fn move_liquid(
    racks: &mut BTreeMap<String, Rack>,
    source: &str,
    from: RackPosition,
    target: &str,
    to: RackPosition,
    volume: f64,
) -> LabResult<()> {
    let portion = {
        let rack = rack_mut(racks, source)?;
        let Some(sample) = rack.sample_mut(from).as_mut() else {
            return Err(LabError::RackVerificationFailed {
                rack: source.to_string(),
                discrepancies: vec![format!("{}: no sample to transfer", from)],
            });
        };
        sample.withdraw(volume)?
    };
    let slot = rack_mut(racks, target)?.sample_mut(to);
    match slot {
        Some(sample) => sample.mix(&portion, to),
        None => {
            *slot = Some(portion);
            Ok(())
        }
    }
}

/// Apply one transfer job to the rack states
fn apply(racks: &mut BTreeMap<String, Rack>, job: &TransferJob) -> LabResult<()> {
    let target = job.target.barcode.as_str();
    for transfer in &job.worklist.transfers {
        match transfer {
            PlannedTransfer::SampleDilution { target: position, volume, .. } => {
                let slot = rack_mut(racks, target)?.sample_mut(*position);
                match slot {
                    Some(sample) => sample.add_buffer(*volume),
                    None => *slot = Some(Sample::buffer(*volume)),
                }
            }
            PlannedTransfer::SampleTransfer {
                source,
                target: position,
                volume,
            } => {
                let from = job
                    .source
                    .as_ref()
                    .ok_or_else(|| LabError::UnknownLabel(job.worklist.label.to_string()))?;
                move_liquid(racks, &from.barcode, *source, target, *position, *volume)?;
            }
            PlannedTransfer::RackSampleTransfer {
                source_sector,
                target_sector,
                volume,
                ..
            } => {
                let from = job
                    .source
                    .as_ref()
                    .ok_or_else(|| LabError::UnknownLabel(job.worklist.label.to_string()))?;
                let pairs = {
                    let source_rack = racks
                        .get(&from.barcode)
                        .ok_or_else(|| LabError::UnknownLabel(from.barcode.clone()))?;
                    let target_rack = racks
                        .get(target)
                        .ok_or_else(|| LabError::UnknownLabel(target.to_string()))?;
                    TransferJob::sector_pairs(source_rack, target_rack, *source_sector, *target_sector)
                };
                for (s, t) in pairs {
                    move_liquid(racks, &from.barcode, s, target, t, *volume)?;
                }
            }
        }
    }
    Ok(())
}

/// Run the transfer jobs of a prepared phase and move the ISOs on
///
/// Nothing is written unless every job succeeded, plates new to the
/// inventory included; the token is checked between jobs.
pub async fn run<R>(
    repo: &R,
    plan: ExecutionPlan,
    user: &str,
    cancel: &CancellationToken,
) -> LabResult<ExecutionReport>
where
    R: EntityRepository + ?Sized,
{
    let next = plan.next_status();
    let ExecutionPlan {
        entity,
        phase,
        mut racks,
        new_plates,
        jobs,
        mut isos,
        ..
    } = plan;

    let mut executed = Vec::new();
    for job in &jobs {
        if cancel.is_cancelled() {
            info!(entity = %entity, done = executed.len(), "Execution cancelled");
            return Err(LabError::Cancelled);
        }
        apply(&mut racks, job)?;
        debug!(
            entity = %entity,
            worklist = %job.worklist.label,
            target = %job.target.barcode,
            transfers = job.worklist.transfers.len(),
            "Executed worklist"
        );
        executed.push(ExecutedWorklist {
            entity_label: entity.to_string(),
            worklist_label: job.worklist.label.to_string(),
            target_rack: job.target.barcode.clone(),
            user: user.to_string(),
            executed_at: Utc::now(),
        });
    }
    if cancel.is_cancelled() {
        return Err(LabError::Cancelled);
    }

    for iso in isos.iter_mut() {
        let previous = iso.status;
        iso.set_status(next)?;
        info!(iso = %iso.label, from = %previous, to = %next, "ISO status changed");
    }

    if !new_plates.is_empty() {
        info!(entity = %entity, plates = new_plates.len(), "Storing plates created by this execution");
    }
    let worklists = executed.iter().map(|e| e.worklist_label.clone()).collect();
    repo.commit_execution(ExecutionChangeSet {
        racks: racks.into_values().collect(),
        isos,
        executed,
    })
    .await?;

    Ok(ExecutionReport {
        entity,
        phase,
        worklists,
        status: next,
    })
}

/// Execute the current phase of an ISO or ISO job
pub async fn execute<R>(
    repo: &R,
    context: &Context,
    label: &EntityLabel,
    user: &str,
    cancel: &CancellationToken,
) -> LabResult<ExecutionReport>
where
    R: RackRepository + EntityRepository + ?Sized,
{
    let user = user.trim();
    if user.is_empty() {
        return Err(LabError::MissingUser);
    }
    let plan = prepare(repo, context, label).await?;
    let report = run(repo, plan, user, cancel).await?;
    info!(
        entity = %report.entity,
        phase = %report.phase,
        worklists = report.worklists.len(),
        status = %report.status,
        user = %user,
        "Execution committed"
    );
    Ok(report)
}
