//! Worklist files and instructions for one phase
//!
//! Bundle members:
//! - `<entity>_instructions.txt`: notes, steps, racks and the tube picking list
//! - `<entity>_cybio_steps.txt`: rack transfers (only if there are any)
//! - `<entity>_buffer.csv`: all buffer worklists in one file
//! - `<entity>_<worklist suffix>.csv`: one per well-to-well worklist

use super::preflight::{prepare, ExecutionPlan, TransferJob};
use crate::context::Context;
use crate::error::{LabError, LabResult};
use crate::repository::{EntityRepository, RackRepository};
use crate::worklists::PlannedTransfer;
use isoprep_common::labels::EntityLabel;
use isoprep_common::units;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

const BUFFER_HEADER: [&str; 5] = [
    "Worklist",
    "DestinationPlateBarcode",
    "DestinationPlateWell",
    "TransferVolume",
    "Diluent",
];

const TRANSFER_HEADER: [&str; 5] = [
    "SourcePlateBarcode",
    "SourcePlateWell",
    "DestinationPlateBarcode",
    "DestinationPlateWell",
    "TransferVolume",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleMember {
    pub name: String,
    pub content: String,
}

/// Files produced for one phase of one entity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrintBundle {
    pub members: Vec<BundleMember>,
}

impl PrintBundle {
    pub fn names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn member(&self, name: &str) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.content.as_str())
    }

    /// Write every member into `dir` (created if missing)
    pub async fn write_to(&self, dir: &Path) -> LabResult<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;
        let mut written = Vec::new();
        for member in &self.members {
            let path = dir.join(&member.name);
            tokio::fs::write(&path, member.content.as_bytes()).await?;
            written.push(path);
        }
        Ok(written)
    }
}

fn finish_csv(writer: csv::Writer<Vec<u8>>) -> LabResult<String> {
    let bytes = writer.into_inner().map_err(|e| LabError::from(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| LabError::Common(isoprep_common::Error::Internal(e.to_string())))
}

fn buffer_csv(jobs: &[&TransferJob]) -> LabResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(BUFFER_HEADER)?;
    for job in jobs {
        for transfer in &job.worklist.transfers {
            if let PlannedTransfer::SampleDilution { target, volume, diluent } = transfer {
                writer.write_record([
                    job.worklist.label.to_string(),
                    job.target.barcode.clone(),
                    target.label(),
                    units::format_volume(*volume),
                    diluent.clone(),
                ])?;
            }
        }
    }
    finish_csv(writer)
}

fn transfer_csv(jobs: &[&TransferJob]) -> LabResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(TRANSFER_HEADER)?;
    for job in jobs {
        let source = job.source.as_ref().map(|s| s.barcode.clone()).unwrap_or_default();
        for transfer in &job.worklist.transfers {
            if let PlannedTransfer::SampleTransfer { source: from, target, volume } = transfer {
                writer.write_record([
                    source.clone(),
                    from.label(),
                    job.target.barcode.clone(),
                    target.label(),
                    units::format_volume(*volume),
                ])?;
            }
        }
    }
    finish_csv(writer)
}

fn cybio_steps(jobs: &[&TransferJob]) -> LabResult<String> {
    let mut text = String::new();
    for (step, job) in jobs.iter().enumerate() {
        let source = job.source.as_ref().map(|s| s.label.as_str()).unwrap_or("-");
        for transfer in &job.worklist.transfers {
            if let PlannedTransfer::RackSampleTransfer {
                source_sector,
                target_sector,
                volume,
                ..
            } = transfer
            {
                writeln!(
                    text,
                    "{}. {}: {} sector {} -> {} sector {}, {} µl",
                    step + 1,
                    job.worklist.label,
                    source,
                    source_sector + 1,
                    job.target.label,
                    target_sector + 1,
                    units::format_volume(*volume)
                )?;
            }
        }
    }
    Ok(text)
}

fn instructions(plan: &ExecutionPlan) -> LabResult<String> {
    let mut text = String::new();
    writeln!(text, "{} ({} processing, order {})", plan.entity, plan.phase, plan.order)?;
    writeln!(text)?;

    let notes = plan.notes();
    if !notes.is_empty() {
        writeln!(text, "Notes:")?;
        for note in notes {
            writeln!(text, "- {}", note)?;
        }
        writeln!(text)?;
    }

    writeln!(text, "Steps:")?;
    for (step, job) in plan.jobs.iter().enumerate() {
        let source = match &job.source {
            Some(source) => format!("{} ({}) -> ", source.label, source.barcode),
            None => String::from("buffer -> "),
        };
        writeln!(
            text,
            "{}. {} [{}, {}]: {}{} ({}), {} µl",
            step + 1,
            job.worklist.label,
            job.worklist.pipettor,
            job.worklist.transfer_type,
            source,
            job.target.label,
            job.target.barcode,
            units::format_volume(job.worklist.total_volume())
        )?;
    }
    writeln!(text)?;

    writeln!(text, "Racks:")?;
    let mut racks: BTreeMap<&str, &str> = BTreeMap::new();
    for job in &plan.jobs {
        if let Some(source) = &job.source {
            racks.insert(&source.barcode, &source.label);
        }
        racks.insert(&job.target.barcode, &job.target.label);
    }
    for (barcode, label) in racks {
        writeln!(text, "- {}: {}", barcode, label)?;
    }

    let picks: Vec<String> = plan
        .stock_racks
        .iter()
        .flat_map(|rack| {
            rack.layout.positions().filter_map(move |p| {
                p.origin.as_ref().map(|origin| {
                    format!(
                        "- tube {} (pool {}): {} {} -> {} {}",
                        p.tube_barcode,
                        p.pool(),
                        origin.rack_barcode,
                        origin.position,
                        rack.barcode,
                        p.position
                    )
                })
            })
        })
        .collect();
    if !picks.is_empty() {
        writeln!(text)?;
        writeln!(text, "Tube picking:")?;
        for line in picks {
            writeln!(text, "{}", line)?;
        }
    }
    Ok(text)
}

/// Render the bundle of a prepared phase
pub fn render(plan: &ExecutionPlan) -> LabResult<PrintBundle> {
    let entity = &plan.entity;
    let mut bundle = PrintBundle::default();
    bundle.members.push(BundleMember {
        name: format!("{}_instructions.txt", entity),
        content: instructions(plan)?,
    });

    let rack_jobs: Vec<&TransferJob> = plan
        .jobs
        .iter()
        .filter(|j| {
            j.worklist
                .transfers
                .iter()
                .any(|t| matches!(t, PlannedTransfer::RackSampleTransfer { .. }))
        })
        .collect();
    if !rack_jobs.is_empty() {
        bundle.members.push(BundleMember {
            name: format!("{}_cybio_steps.txt", entity),
            content: cybio_steps(&rack_jobs)?,
        });
    }

    let buffer_jobs: Vec<&TransferJob> = plan.jobs.iter().filter(|j| j.is_buffer()).collect();
    if !buffer_jobs.is_empty() {
        bundle.members.push(BundleMember {
            name: format!("{}_buffer.csv", entity),
            content: buffer_csv(&buffer_jobs)?,
        });
    }

    // Expanded copies of one worklist share its file
    let mut by_label: Vec<(String, Vec<&TransferJob>)> = Vec::new();
    for job in plan.jobs.iter().filter(|j| {
        j.worklist
            .transfers
            .iter()
            .any(|t| matches!(t, PlannedTransfer::SampleTransfer { .. }))
    }) {
        let label = job.worklist.label.to_string();
        match by_label.iter_mut().find(|(l, _)| *l == label) {
            Some((_, jobs)) => jobs.push(job),
            None => by_label.push((label, vec![job])),
        }
    }
    for (_, jobs) in by_label {
        let suffix = jobs[0].worklist.label.suffix();
        bundle.members.push(BundleMember {
            name: format!("{}_{}.csv", entity, suffix),
            content: transfer_csv(&jobs)?,
        });
    }
    Ok(bundle)
}

/// Pre-flight and render the bundle of an entity's current phase
pub async fn print_worklists<R>(repo: &R, context: &Context, label: &EntityLabel) -> LabResult<PrintBundle>
where
    R: RackRepository + EntityRepository + ?Sized,
{
    let plan = prepare(repo, context, label).await?;
    let bundle = render(&plan)?;
    info!(entity = %label, files = bundle.members.len(), "Rendered worklist bundle");
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::preflight::RackRef;
    use crate::model::RackPosition;
    use crate::worklists::{TransferType, Worklist};
    use isoprep_common::labels::{EntityKind, RackMarker, RackRole, WorklistLabel};
    use isoprep_common::Pipettor;

    fn buffer_job() -> TransferJob {
        let target = RackMarker::new(RackRole::IsoPrep);
        TransferJob {
            worklist: Worklist {
                label: WorklistLabel::buffer("T1", 1, target),
                index: 0,
                pipettor: Pipettor::Biomek,
                transfer_type: TransferType::SampleDilution,
                source: None,
                target,
                phase: EntityKind::Iso,
                transfers: vec![PlannedTransfer::dilution(RackPosition::new(3, 1), 8.0)],
            },
            source: None,
            target: RackRef {
                label: "T1_iso_01_p".to_string(),
                barcode: "09000001".to_string(),
            },
        }
    }

    #[test]
    fn test_buffer_csv_layout() {
        let job = buffer_job();
        let text = buffer_csv(&[&job]).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Worklist,DestinationPlateBarcode,DestinationPlateWell,TransferVolume,Diluent"
        );
        assert_eq!(lines[1], "T1_1_p_buffer,09000001,D2,8.0,annealing buffer");
    }

    #[test]
    fn test_cybio_steps_number_sectors_from_one() {
        let source = RackMarker::stock(1);
        let target = RackMarker::new(RackRole::IsoPrep);
        let job = TransferJob {
            worklist: Worklist {
                label: WorklistLabel::transfer("T1", 2, source, target),
                index: 1,
                pipettor: Pipettor::CyBio,
                transfer_type: TransferType::RackSampleTransfer,
                source: Some(source),
                target,
                phase: EntityKind::Iso,
                transfers: vec![PlannedTransfer::RackSampleTransfer {
                    source_sector: 0,
                    target_sector: 2,
                    number_sectors: 4,
                    volume: 2.0,
                }],
            },
            source: Some(RackRef {
                label: "T1_iso_01_s#1".to_string(),
                barcode: "02000001".to_string(),
            }),
            target: RackRef {
                label: "T1_iso_01_p".to_string(),
                barcode: "09000001".to_string(),
            },
        };
        let text = cybio_steps(&[&job]).unwrap();
        assert_eq!(
            text,
            format!(
                "1. {}: T1_iso_01_s#1 sector 1 -> T1_iso_01_p sector 3, 2.0 µl\n",
                job.worklist.label
            )
        );
    }

    #[tokio::test]
    async fn test_bundle_written_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = PrintBundle {
            members: vec![BundleMember {
                name: "T1_iso_01_buffer.csv".to_string(),
                content: "Worklist\n".to_string(),
            }],
        };
        let written = bundle.write_to(&dir.path().join("out")).await.unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(std::fs::read_to_string(&written[0]).unwrap(), "Worklist\n");
    }
}
