//! Preparation plan: final and preparation layouts produced by the planner

use crate::model::layout::RackLayout;
use crate::model::position::{FinalPosition, PrepPosition};
use crate::model::rack::RackShape;
use crate::model::request::{LibraryReference, Scenario};
use isoprep_common::labels::{EntityKind, RackMarker, RackRole};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type FinalLayout = RackLayout<FinalPosition>;
pub type PrepLayout = RackLayout<PrepPosition>;

/// Order in which job and ISO processing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOrder {
    /// Only ISO processing
    NoJob,
    JobFirst,
    IsoFirst,
    /// Only job processing (library plates)
    NoIso,
}

impl ProcessingOrder {
    /// Phases in execution order
    pub fn phases(self) -> Vec<EntityKind> {
        match self {
            ProcessingOrder::NoJob => vec![EntityKind::Iso],
            ProcessingOrder::NoIso => vec![EntityKind::Job],
            ProcessingOrder::JobFirst => vec![EntityKind::Job, EntityKind::Iso],
            ProcessingOrder::IsoFirst => vec![EntityKind::Iso, EntityKind::Job],
        }
    }

    /// Zero-based position of a phase, `None` if the phase does not run
    pub fn phase_index(self, phase: EntityKind) -> Option<usize> {
        self.phases().iter().position(|&p| p == phase)
    }

    pub fn is_last_phase(self, phase: EntityKind) -> bool {
        self.phases().last() == Some(&phase)
    }

    /// Phase that runs plate-internal transfers of the final plate
    pub fn intra_final_phase(self) -> EntityKind {
        match self {
            ProcessingOrder::IsoFirst | ProcessingOrder::NoIso => EntityKind::Job,
            ProcessingOrder::JobFirst | ProcessingOrder::NoJob => EntityKind::Iso,
        }
    }
}

impl fmt::Display for ProcessingOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessingOrder::NoJob => "NO_JOB",
            ProcessingOrder::JobFirst => "JOB_FIRST",
            ProcessingOrder::IsoFirst => "ISO_FIRST",
            ProcessingOrder::NoIso => "NO_ISO",
        };
        f.write_str(name)
    }
}

/// Preparation plate of the plan (`jp` owned by the job, `p` by each ISO)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepPlate {
    pub marker: RackMarker,
    pub reservoir: String,
    pub layout: PrepLayout,
}

impl PrepPlate {
    pub fn owner(&self) -> EntityKind {
        match self.marker.role {
            RackRole::JobPrep => EntityKind::Job,
            _ => EntityKind::Iso,
        }
    }
}

/// Stock rack slot reserved by the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRackPlan {
    pub marker: RackMarker,
    pub owner: EntityKind,
    /// Target sector of a quadrant stock rack
    #[serde(default)]
    pub sector: Option<u8>,
}

/// Output of the preparation-chain builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparationPlan {
    pub ticket: String,
    pub scenario: Scenario,
    pub shape: RackShape,
    pub number_aliquots: u32,
    pub isos_per_job: u32,
    /// Prep concentration = factor × final concentration (screening)
    pub aliquot_dilution_factor: u32,
    pub processing_order: ProcessingOrder,
    pub final_layout: FinalLayout,
    pub final_reservoir: String,
    pub prep_plates: Vec<PrepPlate>,
    pub stock_racks: Vec<StockRackPlan>,
    /// Associated sector groups (empty for well-wise plans)
    #[serde(default)]
    pub sector_groups: Vec<Vec<u8>>,
    #[serde(default)]
    pub floating_stock_concentration: Option<f64>,
    #[serde(default)]
    pub library: Option<LibraryReference>,
}

impl PreparationPlan {
    pub fn uses_sector_transfers(&self) -> bool {
        !self.sector_groups.is_empty()
    }

    pub fn prep_plate(&self, marker: RackMarker) -> Option<&PrepPlate> {
        self.prep_plates.iter().find(|p| p.marker == marker)
    }

    pub fn job_prep_plates(&self) -> impl Iterator<Item = &PrepPlate> {
        self.prep_plates.iter().filter(|p| p.owner() == EntityKind::Job)
    }

    pub fn iso_prep_plates(&self) -> impl Iterator<Item = &PrepPlate> {
        self.prep_plates.iter().filter(|p| p.owner() == EntityKind::Iso)
    }

    pub fn stock_rack(&self, marker: RackMarker) -> Option<&StockRackPlan> {
        self.stock_racks.iter().find(|s| s.marker == marker)
    }

    /// Owner of the stock rack a starting well is filled from
    pub fn stock_rack_owner(&self, marker: RackMarker) -> Option<EntityKind> {
        self.stock_rack(marker).map(|s| s.owner)
    }
}
