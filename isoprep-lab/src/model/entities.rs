//! ISOs, ISO jobs, plates and stock racks attached to them

use crate::error::{LabError, LabResult};
use crate::model::lab::{FinalLayout, PreparationPlan, PrepPlate};
use crate::model::pool::{Placeholder, PoolId};
use crate::model::request::LibraryPlate;
use crate::model::stock::StockRackLayout;
use crate::worklists::WorklistSeries;
use isoprep_common::labels::{EntityKind, EntityLabel, RackMarker};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// ISO status machine
///
/// `queued → in_progress → done`, `done → reopened → queued`, and any
/// non-terminal status may be canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsoStatus {
    Queued,
    InProgress,
    Done,
    Reopened,
    Canceled,
}

impl IsoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IsoStatus::Queued => "queued",
            IsoStatus::InProgress => "in_progress",
            IsoStatus::Done => "done",
            IsoStatus::Reopened => "reopened",
            IsoStatus::Canceled => "canceled",
        }
    }

    pub fn can_transition_to(self, next: IsoStatus) -> bool {
        use IsoStatus::*;
        matches!(
            (self, next),
            (Queued, InProgress)
                | (Queued, Done)
                | (InProgress, Done)
                | (Done, Reopened)
                | (Reopened, Queued)
                | (Queued, Canceled)
                | (InProgress, Canceled)
                | (Reopened, Canceled)
        )
    }
}

impl fmt::Display for IsoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsoStatus {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(IsoStatus::Queued),
            "in_progress" => Ok(IsoStatus::InProgress),
            "done" => Ok(IsoStatus::Done),
            "reopened" => Ok(IsoStatus::Reopened),
            "canceled" => Ok(IsoStatus::Canceled),
            other => Err(LabError::InvalidRequest(format!("Unknown ISO status '{}'", other))),
        }
    }
}

/// Plate reference held by an entity (racks are shared inventory)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateRef {
    pub marker: RackMarker,
    pub label: String,
    pub barcode: String,
    pub reservoir: String,
}

/// Stock rack assigned to an ISO or job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockRack {
    pub marker: RackMarker,
    pub label: String,
    pub barcode: String,
    #[serde(default)]
    pub sector: Option<u8>,
    pub layout: StockRackLayout,
    pub series: WorklistSeries,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iso {
    pub label: EntityLabel,
    pub status: IsoStatus,
    pub job: EntityLabel,
    /// Pool bound to each floating placeholder (`None` = missing floating)
    #[serde(default)]
    pub floating_bindings: BTreeMap<Placeholder, Option<PoolId>>,
    pub final_layout: FinalLayout,
    #[serde(default)]
    pub prep_layouts: Vec<PrepPlate>,
    /// One plate per aliquot
    pub final_plates: Vec<PlateRef>,
    #[serde(default)]
    pub prep_plates: Vec<PlateRef>,
    #[serde(default)]
    pub stock_racks: Vec<StockRack>,
    #[serde(default)]
    pub library_plates: Vec<LibraryPlate>,
}

impl Iso {
    pub fn set_status(&mut self, next: IsoStatus) -> LabResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(LabError::UnexpectedStatus {
                entity: self.label.to_string(),
                found: self.status,
                expected: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn prep_layout(&self, marker: RackMarker) -> Option<&PrepPlate> {
        self.prep_layouts.iter().find(|p| p.marker == marker)
    }

    pub fn plates(&self) -> impl Iterator<Item = &PlateRef> {
        self.prep_plates.iter().chain(self.final_plates.iter())
    }

    pub fn replace_stock_racks(&mut self, racks: Vec<StockRack>) {
        self.stock_racks = racks;
    }
}

/// Group of ISOs processed together; owns the shared plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsoJob {
    pub label: EntityLabel,
    pub plan: PreparationPlan,
    pub isos: Vec<EntityLabel>,
    /// Job preparation plates
    #[serde(default)]
    pub prep_plates: Vec<PlateRef>,
    #[serde(default)]
    pub stock_racks: Vec<StockRack>,
    /// Processing worklists (buffer and plate-to-plate)
    pub processing_series: WorklistSeries,
}

impl IsoJob {
    pub fn replace_stock_racks(&mut self, racks: Vec<StockRack>) {
        self.stock_racks = racks;
    }
}

/// ISO or job as addressed by the executor
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Iso(Iso),
    Job(IsoJob),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Iso(_) => EntityKind::Iso,
            Entity::Job(_) => EntityKind::Job,
        }
    }

    pub fn label(&self) -> &EntityLabel {
        match self {
            Entity::Iso(iso) => &iso.label,
            Entity::Job(job) => &job.label,
        }
    }

    pub fn stock_racks(&self) -> &[StockRack] {
        match self {
            Entity::Iso(iso) => &iso.stock_racks,
            Entity::Job(job) => &job.stock_racks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(IsoStatus::Queued.can_transition_to(IsoStatus::InProgress));
        assert!(IsoStatus::Queued.can_transition_to(IsoStatus::Done));
        assert!(IsoStatus::InProgress.can_transition_to(IsoStatus::Done));
        assert!(IsoStatus::Reopened.can_transition_to(IsoStatus::Queued));
        assert!(!IsoStatus::Reopened.can_transition_to(IsoStatus::InProgress));
        assert!(!IsoStatus::Canceled.can_transition_to(IsoStatus::Queued));
        assert!(!IsoStatus::Done.can_transition_to(IsoStatus::InProgress));
    }

    #[test]
    fn test_status_text_round_trip() {
        for status in [
            IsoStatus::Queued,
            IsoStatus::InProgress,
            IsoStatus::Done,
            IsoStatus::Reopened,
            IsoStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<IsoStatus>().unwrap(), status);
        }
    }
}
