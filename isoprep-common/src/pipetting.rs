//! Pipetting specs and reservoir (plate) specs
//!
//! Machine constants for the liquid handlers and plate types. The values
//! here are the built-in defaults; [`crate::config`] overlays TOML overrides.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Liquid handling device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pipettor {
    /// Biomek configured for stock tube transfers
    BiomekStock,
    /// Biomek for plate-to-plate well transfers and 96-well buffer additions
    Biomek,
    /// CyBio for quadrant (rack sector) transfers and 384-well buffer additions
    CyBio,
    /// Hand pipetting
    Manual,
}

impl Pipettor {
    pub const ALL: [Pipettor; 4] = [
        Pipettor::BiomekStock,
        Pipettor::Biomek,
        Pipettor::CyBio,
        Pipettor::Manual,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Pipettor::BiomekStock => "BiomekStock",
            Pipettor::Biomek => "Biomek",
            Pipettor::CyBio => "CyBio",
            Pipettor::Manual => "manual",
        }
    }
}

impl fmt::Display for Pipettor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Volume and dilution limits of one pipettor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipettingSpecs {
    pub pipettor: Pipettor,
    /// Smallest volume the device can transfer (µl)
    pub min_transfer_volume: f64,
    /// Largest volume the device can transfer in one step (µl)
    pub max_transfer_volume: f64,
    /// Largest source/target concentration ratio for one step
    pub max_dilution_factor: f64,
    /// Dead volume of source wells grows with the number of target wells
    pub dynamic_dead_volume: bool,
}

impl PipettingSpecs {
    /// Built-in defaults
    pub fn default_for(pipettor: Pipettor) -> Self {
        match pipettor {
            Pipettor::BiomekStock => Self {
                pipettor,
                min_transfer_volume: 1.0,
                max_transfer_volume: 50.0,
                max_dilution_factor: 100.0,
                dynamic_dead_volume: false,
            },
            Pipettor::Biomek => Self {
                pipettor,
                min_transfer_volume: 2.0,
                max_transfer_volume: 250.0,
                max_dilution_factor: 10.0,
                dynamic_dead_volume: true,
            },
            Pipettor::CyBio => Self {
                pipettor,
                min_transfer_volume: 1.0,
                max_transfer_volume: 100.0,
                max_dilution_factor: 10.0,
                dynamic_dead_volume: false,
            },
            Pipettor::Manual => Self {
                pipettor,
                min_transfer_volume: 1.0,
                max_transfer_volume: 500.0,
                max_dilution_factor: 10.0,
                dynamic_dead_volume: false,
            },
        }
    }
}

/// Plate type used for preparation and final plates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservoirSpecs {
    pub name: String,
    pub number_rows: u8,
    pub number_columns: u8,
    /// Maximum well volume (µl)
    pub max_volume: f64,
    /// Dead volume for a well with a single target (µl)
    pub min_dead_volume: f64,
    /// Upper bound for the dynamic dead volume (µl)
    pub max_dead_volume: f64,
}

impl ReservoirSpecs {
    pub fn standard_96() -> Self {
        Self {
            name: "standard 96".to_string(),
            number_rows: 8,
            number_columns: 12,
            max_volume: 300.0,
            min_dead_volume: 5.0,
            max_dead_volume: 10.0,
        }
    }

    pub fn standard_384() -> Self {
        Self {
            name: "standard 384".to_string(),
            number_rows: 16,
            number_columns: 24,
            max_volume: 100.0,
            min_dead_volume: 5.0,
            max_dead_volume: 8.0,
        }
    }

    pub fn deep_96() -> Self {
        Self {
            name: "deep 96".to_string(),
            number_rows: 8,
            number_columns: 12,
            max_volume: 1000.0,
            min_dead_volume: 8.0,
            max_dead_volume: 30.0,
        }
    }

    /// Dead volume of a source well that serves `target_count` targets
    ///
    /// Static devices always leave the minimum dead volume. Dynamic devices
    /// add `increment` per additional target, capped at the maximum.
    pub fn dead_volume(&self, target_count: usize, specs: &PipettingSpecs, increment: f64) -> f64 {
        if !specs.dynamic_dead_volume || target_count <= 1 {
            return self.min_dead_volume;
        }
        let extra = (target_count - 1) as f64 * increment;
        (self.min_dead_volume + extra).min(self.max_dead_volume)
    }
}
