//! ISO request: the validated input of the planner

use crate::converter::RackLayoutRecord;
use crate::error::{LabError, LabResult};
use crate::model::layout::RackLayout;
use crate::model::pool::PoolId;
use crate::model::position::{LayoutPosition, RequestPosition, WellContent};
use crate::model::rack::RackShape;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Experiment scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Stock concentration straight into the final plate
    OrderOnly,
    /// The request layout is the final layout
    Manual,
    /// 96-well dilution series
    Optimization,
    /// 384-well quadrant-based preparation
    Screening,
    /// Controls added to pre-existing library plates
    Library,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scenario::OrderOnly => "order only",
            Scenario::Manual => "manual",
            Scenario::Optimization => "optimization",
            Scenario::Screening => "screening",
            Scenario::Library => "library",
        };
        f.write_str(name)
    }
}

/// Pre-existing library plate (`<library>_l<layout>_r<rack>`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryPlate {
    pub barcode: String,
    pub label: String,
    pub layout_number: u32,
    pub rack_number: u32,
}

impl LibraryPlate {
    /// Parse layout and rack number from the plate label
    pub fn from_label(barcode: impl Into<String>, label: &str) -> LabResult<Self> {
        let invalid = || LabError::InvalidRequest(format!("Invalid library plate label '{}'", label));
        let mut parts = label.rsplitn(3, '_');
        let rack = parts.next().and_then(|p| p.strip_prefix('r')).ok_or_else(invalid)?;
        let layout = parts.next().and_then(|p| p.strip_prefix('l')).ok_or_else(invalid)?;
        if parts.next().map(str::is_empty).unwrap_or(true) {
            return Err(invalid());
        }
        Ok(Self {
            barcode: barcode.into(),
            label: label.to_string(),
            layout_number: layout.parse().map_err(|_| invalid())?,
            rack_number: rack.parse().map_err(|_| invalid())?,
        })
    }
}

/// Library used by a library-scenario request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryReference {
    pub name: String,
    pub plates: Vec<LibraryPlate>,
}

fn default_one() -> u32 {
    1
}

/// Validated request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsoRequest {
    pub ticket: String,
    pub scenario: Scenario,
    pub layout: RackLayout<RequestPosition>,
    pub number_aliquots: u32,
    #[serde(default)]
    pub process_job_first: bool,
    /// Pools bound to floating placeholders
    #[serde(default)]
    pub pool_set: Vec<PoolId>,
    #[serde(default)]
    pub library: Option<LibraryReference>,
    /// ISOs sharing one job (multiplies job-prep volumes)
    #[serde(default = "default_one")]
    pub isos_per_job: u32,
    /// Plate type name; defaults to the standard plate of the shape
    #[serde(default)]
    pub reservoir: Option<String>,
}

impl IsoRequest {
    pub fn shape(&self) -> RackShape {
        self.layout.shape()
    }

    pub fn has_floatings(&self) -> bool {
        self.layout.floating_positions().next().is_some()
    }

    /// Check request-level parameters
    pub fn validate(&self) -> LabResult<()> {
        if self.ticket.is_empty() || self.ticket.contains(char::is_whitespace) {
            return Err(LabError::InvalidRequest(format!("Invalid ticket '{}'", self.ticket)));
        }
        if self.number_aliquots == 0 {
            return Err(LabError::InvalidRequest("number of aliquots must be at least 1".to_string()));
        }
        if self.isos_per_job == 0 {
            return Err(LabError::InvalidRequest("ISOs per job must be at least 1".to_string()));
        }
        if self.layout.positions().all(|p| p.is_empty() || p.content().is_untreated()) {
            return Err(LabError::InvalidRequest("request layout has no samples".to_string()));
        }
        match self.scenario {
            Scenario::Library => {
                if self.library.is_none() {
                    return Err(LabError::InvalidRequest(
                        "library scenario requires a library reference".to_string(),
                    ));
                }
                if self.has_floatings() {
                    return Err(LabError::InvalidRequest(
                        "library requests must not contain floating positions".to_string(),
                    ));
                }
            }
            _ => {
                if self
                    .layout
                    .positions()
                    .any(|p| matches!(p.content(), WellContent::Library { .. }))
                {
                    return Err(LabError::InvalidRequest(format!(
                        "library positions are not allowed in the {} scenario",
                        self.scenario
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Persisted request as read from a request file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsoRequestRecord {
    pub ticket: String,
    pub scenario: Scenario,
    pub layout: RackLayoutRecord,
    pub number_aliquots: u32,
    #[serde(default)]
    pub process_job_first: bool,
    #[serde(default)]
    pub pool_set: Vec<PoolId>,
    #[serde(default)]
    pub library: Option<LibraryReference>,
    #[serde(default = "default_one")]
    pub isos_per_job: u32,
    #[serde(default)]
    pub reservoir: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_plate_label() {
        let plate = LibraryPlate::from_label("08880001", "testlib_l1_r2").unwrap();
        assert_eq!(plate.layout_number, 1);
        assert_eq!(plate.rack_number, 2);
        assert!(LibraryPlate::from_label("x", "l1_r2").is_err());
        assert!(LibraryPlate::from_label("x", "testlib_1_2").is_err());
    }
}
