//! Physical racks, containers and samples

use crate::error::{LabError, LabResult};
use crate::model::pool::PoolId;
use crate::model::rack::{RackPosition, RackShape};
use isoprep_common::units;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Liquid in a container: a single pool (or buffer only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub pool: Option<PoolId>,
    /// Volume (µl)
    pub volume: f64,
    /// Concentration of the pool (nM)
    #[serde(default)]
    pub concentration: Option<f64>,
}

impl Sample {
    pub fn new(pool: PoolId, volume: f64, concentration: f64) -> Self {
        Self {
            pool: Some(pool),
            volume,
            concentration: Some(concentration),
        }
    }

    pub fn buffer(volume: f64) -> Self {
        Self {
            pool: None,
            volume,
            concentration: None,
        }
    }

    /// Dilute with buffer
    pub fn add_buffer(&mut self, volume: f64) {
        let total = self.volume + volume;
        if let Some(concentration) = self.concentration {
            self.concentration = Some(concentration * self.volume / total);
        }
        self.volume = units::round_volume(total);
    }

    /// Split off `volume`; the remainder keeps the concentration
    pub fn withdraw(&mut self, volume: f64) -> LabResult<Sample> {
        if units::is_larger_than(volume, self.volume) {
            return Err(LabError::InsufficientVolume {
                pool: self.pool.unwrap_or_default(),
                required: volume,
                available: self.volume,
            });
        }
        self.volume = units::round_volume((self.volume - volume).max(0.0));
        Ok(Sample {
            pool: self.pool,
            volume,
            concentration: self.concentration,
        })
    }

    /// Mix an incoming sample into this one
    pub fn mix(&mut self, incoming: &Sample, position: RackPosition) -> LabResult<()> {
        let pool = match (self.pool, incoming.pool) {
            (Some(a), Some(b)) if a != b => {
                return Err(LabError::InvalidPosition {
                    position: position.label(),
                    reason: format!("cannot mix pool {} into pool {}", b, a),
                })
            }
            (a, b) => a.or(b),
        };
        let total = self.volume + incoming.volume;
        let amount = self.concentration.unwrap_or(0.0) * self.volume
            + incoming.concentration.unwrap_or(0.0) * incoming.volume;
        self.concentration = if pool.is_some() && total > 0.0 {
            Some(amount / total)
        } else {
            None
        };
        self.pool = pool;
        self.volume = units::round_volume(total);
        Ok(())
    }
}

/// Well or tube slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub tube_barcode: Option<String>,
    #[serde(default)]
    pub sample: Option<Sample>,
}

impl Container {
    pub fn is_empty(&self) -> bool {
        self.sample.as_ref().map(|s| s.volume <= 0.0).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RackKind {
    Plate,
    TubeRack,
}

impl RackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RackKind::Plate => "plate",
            RackKind::TubeRack => "tube_rack",
        }
    }
}

/// Physical rack with its containers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rack {
    pub barcode: String,
    #[serde(default)]
    pub label: String,
    pub kind: RackKind,
    pub shape: RackShape,
    /// Plate type name (plates only)
    #[serde(default)]
    pub reservoir: Option<String>,
    #[serde(default)]
    pub containers: BTreeMap<RackPosition, Container>,
}

impl Rack {
    pub fn plate(barcode: impl Into<String>, label: impl Into<String>, shape: RackShape, reservoir: impl Into<String>) -> Self {
        Self {
            barcode: barcode.into(),
            label: label.into(),
            kind: RackKind::Plate,
            shape,
            reservoir: Some(reservoir.into()),
            containers: BTreeMap::new(),
        }
    }

    pub fn tube_rack(barcode: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            barcode: barcode.into(),
            label: label.into(),
            kind: RackKind::TubeRack,
            shape: RackShape::Wells96,
            reservoir: None,
            containers: BTreeMap::new(),
        }
    }

    pub fn sample(&self, position: RackPosition) -> Option<&Sample> {
        self.containers
            .get(&position)
            .and_then(|c| c.sample.as_ref())
            .filter(|s| s.volume > 0.0)
    }

    /// Place a tube (tube racks)
    pub fn put_tube(&mut self, position: RackPosition, tube_barcode: impl Into<String>, sample: Sample) {
        self.containers.insert(
            position,
            Container {
                tube_barcode: Some(tube_barcode.into()),
                sample: Some(sample),
            },
        );
    }

    /// Take a tube out of the rack
    pub fn remove_tube(&mut self, position: RackPosition) -> Option<Container> {
        self.containers.remove(&position)
    }

    pub fn tube_position(&self, tube_barcode: &str) -> Option<RackPosition> {
        self.containers
            .iter()
            .find(|(_, c)| c.tube_barcode.as_deref() == Some(tube_barcode))
            .map(|(p, _)| *p)
    }

    /// Sample slot of a position, created on demand
    pub fn sample_mut(&mut self, position: RackPosition) -> &mut Option<Sample> {
        &mut self.containers.entry(position).or_default().sample
    }

    pub fn is_empty(&self) -> bool {
        self.containers.values().all(|c| c.is_empty())
    }
}

/// Stock tube offered by the tube repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TubeCandidate {
    pub tube_barcode: String,
    pub pool: PoolId,
    pub rack_barcode: String,
    pub rack_position: RackPosition,
    pub volume: f64,
    pub concentration: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a1() -> RackPosition {
        RackPosition::new(0, 0)
    }

    #[test]
    fn test_buffer_dilutes() {
        let mut sample = Sample::new(1, 2.0, 50000.0);
        sample.add_buffer(8.0);
        assert_eq!(sample.volume, 10.0);
        assert!(units::are_equal(sample.concentration.unwrap(), 10000.0));
    }

    #[test]
    fn test_mix_into_buffer() {
        let mut well = Sample::buffer(5.6);
        well.mix(&Sample::new(1, 1.4, 50000.0), a1()).unwrap();
        assert_eq!(well.pool, Some(1));
        assert_eq!(well.volume, 7.0);
        assert!(units::are_equal(well.concentration.unwrap(), 10000.0));
    }

    #[test]
    fn test_mix_rejects_second_pool() {
        let mut well = Sample::new(1, 2.0, 10.0);
        assert!(well.mix(&Sample::new(2, 2.0, 10.0), a1()).is_err());
    }

    #[test]
    fn test_withdraw_checks_volume() {
        let mut tube = Sample::new(1, 10.0, 50000.0);
        let taken = tube.withdraw(4.0).unwrap();
        assert_eq!(taken.volume, 4.0);
        assert_eq!(tube.volume, 6.0);
        assert!(matches!(
            tube.withdraw(7.0),
            Err(LabError::InsufficientVolume { .. })
        ));
    }
}
