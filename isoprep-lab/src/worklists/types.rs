//! Worklist and transfer types

use crate::model::RackPosition;
use isoprep_common::labels::{EntityKind, RackMarker, WorklistLabel};
use isoprep_common::Pipettor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Diluent used for every buffer addition
pub const DILUENT: &str = "annealing buffer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    SampleDilution,
    SampleTransfer,
    RackSampleTransfer,
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferType::SampleDilution => "sample dilution",
            TransferType::SampleTransfer => "sample transfer",
            TransferType::RackSampleTransfer => "rack sample transfer",
        };
        f.write_str(name)
    }
}

/// One planned liquid transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlannedTransfer {
    SampleDilution {
        target: RackPosition,
        volume: f64,
        diluent: String,
    },
    SampleTransfer {
        source: RackPosition,
        target: RackPosition,
        volume: f64,
    },
    /// Quadrant transfer: the whole source sector into the target sector
    RackSampleTransfer {
        source_sector: u8,
        target_sector: u8,
        number_sectors: u8,
        volume: f64,
    },
}

impl PlannedTransfer {
    pub fn dilution(target: RackPosition, volume: f64) -> Self {
        PlannedTransfer::SampleDilution {
            target,
            volume,
            diluent: DILUENT.to_string(),
        }
    }

    pub fn transfer_type(&self) -> TransferType {
        match self {
            PlannedTransfer::SampleDilution { .. } => TransferType::SampleDilution,
            PlannedTransfer::SampleTransfer { .. } => TransferType::SampleTransfer,
            PlannedTransfer::RackSampleTransfer { .. } => TransferType::RackSampleTransfer,
        }
    }

    pub fn volume(&self) -> f64 {
        match self {
            PlannedTransfer::SampleDilution { volume, .. }
            | PlannedTransfer::SampleTransfer { volume, .. }
            | PlannedTransfer::RackSampleTransfer { volume, .. } => *volume,
        }
    }
}

/// Ordered set of transfers between two rack roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worklist {
    pub label: WorklistLabel,
    /// Zero-based execution index; the label number is `index + 1`
    pub index: u32,
    pub pipettor: Pipettor,
    pub transfer_type: TransferType,
    /// Source marker (`None` for buffer worklists)
    #[serde(default)]
    pub source: Option<RackMarker>,
    pub target: RackMarker,
    /// Phase the worklist runs in
    pub phase: EntityKind,
    pub transfers: Vec<PlannedTransfer>,
}

impl Worklist {
    pub fn is_buffer(&self) -> bool {
        self.transfer_type == TransferType::SampleDilution
    }

    pub fn total_volume(&self) -> f64 {
        self.transfers.iter().map(|t| t.volume()).sum()
    }
}

/// Worklists ordered by index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorklistSeries {
    worklists: Vec<Worklist>,
}

impl WorklistSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping index order
    pub fn add(&mut self, worklist: Worklist) {
        let at = self
            .worklists
            .iter()
            .position(|w| w.index > worklist.index)
            .unwrap_or(self.worklists.len());
        self.worklists.insert(at, worklist);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worklist> {
        self.worklists.iter()
    }

    pub fn get(&self, index: u32) -> Option<&Worklist> {
        self.worklists.iter().find(|w| w.index == index)
    }

    pub fn len(&self) -> usize {
        self.worklists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.worklists.is_empty()
    }

    pub fn for_phase(&self, phase: EntityKind) -> impl Iterator<Item = &Worklist> {
        self.worklists.iter().filter(move |w| w.phase == phase)
    }

    pub fn labels(&self) -> Vec<String> {
        self.worklists.iter().map(|w| w.label.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isoprep_common::labels::RackRole;

    fn buffer_worklist(index: u32) -> Worklist {
        let target = RackMarker::new(RackRole::IsoPrep);
        Worklist {
            label: WorklistLabel::buffer("7", index + 1, target),
            index,
            pipettor: Pipettor::Biomek,
            transfer_type: TransferType::SampleDilution,
            source: None,
            target,
            phase: EntityKind::Iso,
            transfers: vec![PlannedTransfer::dilution(RackPosition::new(0, 0), 5.6)],
        }
    }

    #[test]
    fn test_series_keeps_index_order() {
        let mut series = WorklistSeries::new();
        series.add(buffer_worklist(2));
        series.add(buffer_worklist(0));
        series.add(buffer_worklist(1));
        let indices: Vec<u32> = series.iter().map(|w| w.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(series.get(1).unwrap().label.to_string(), "7_2_p_buffer");
    }

    #[test]
    fn test_dilution_uses_annealing_buffer() {
        match PlannedTransfer::dilution(RackPosition::new(0, 0), 3.0) {
            PlannedTransfer::SampleDilution { diluent, .. } => assert_eq!(diluent, DILUENT),
            other => panic!("unexpected transfer {:?}", other),
        }
    }
}
