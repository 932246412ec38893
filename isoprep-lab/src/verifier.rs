//! Rack verification
//!
//! Compares a physical rack with what a layout expects. The verifier never
//! mutates; it lists every discrepancy it finds and leaves the decision to
//! the caller.

use crate::diagnostics::Diagnostics;
use crate::error::{LabError, LabResult};
use crate::model::{PoolId, Rack, RackPosition, RackShape, StockRackLayout};
use isoprep_common::units;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Expected content of one position
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpectedWell {
    /// A sample of this pool
    Sample { pool: PoolId },
    /// Buffer or anything without a pool (mock wells)
    Liquid,
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Discrepancy {
    ShapeMismatch {
        expected: RackShape,
        found: RackShape,
    },
    Missing {
        position: RackPosition,
        pool: Option<PoolId>,
    },
    Extra {
        position: RackPosition,
    },
    Mismatch {
        position: RackPosition,
        expected: PoolId,
        found: Option<PoolId>,
    },
    InsufficientVolume {
        position: RackPosition,
        pool: PoolId,
        required: f64,
        available: f64,
    },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::ShapeMismatch { expected, found } => {
                write!(f, "rack shape {} (expected {})", found, expected)
            }
            Discrepancy::Missing { position, pool: Some(pool) } => write!(f, "{}: pool {} missing", position, pool),
            Discrepancy::Missing { position, pool: None } => write!(f, "{}: sample missing", position),
            Discrepancy::Extra { position } => write!(f, "{}: unexpected sample", position),
            Discrepancy::Mismatch {
                position,
                expected,
                found,
            } => match found {
                Some(found) => write!(f, "{}: pool {} instead of {}", position, found, expected),
                None => write!(f, "{}: buffer instead of pool {}", position, expected),
            },
            Discrepancy::InsufficientVolume {
                position,
                pool,
                required,
                available,
            } => write!(
                f,
                "{}: {} µl of pool {} available, {} µl required",
                position,
                units::format_volume(*available),
                pool,
                units::format_volume(*required)
            ),
        }
    }
}

/// Outcome of one rack check
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub rack: String,
    pub discrepancies: Vec<Discrepancy>,
}

impl VerificationReport {
    fn new(rack: &Rack) -> Self {
        Self {
            rack: rack.barcode.clone(),
            discrepancies: Vec::new(),
        }
    }

    fn push(&mut self, discrepancy: Discrepancy) {
        warn!(rack = %self.rack, "{}", discrepancy);
        self.discrepancies.push(discrepancy);
    }

    pub fn is_ok(&self) -> bool {
        self.discrepancies.is_empty()
    }

    /// Errors for the discrepancies
    ///
    /// A missing stock tube and a short tube keep their own kinds so the
    /// report names the pool; everything else is one verification failure.
    pub fn errors(&self) -> Vec<LabError> {
        let mut errors = Vec::new();
        let mut other = Vec::new();
        for discrepancy in &self.discrepancies {
            match discrepancy {
                Discrepancy::Missing { pool: Some(pool), .. } => errors.push(LabError::TubeNotFound { pool: *pool }),
                Discrepancy::InsufficientVolume {
                    pool,
                    required,
                    available,
                    ..
                } => errors.push(LabError::InsufficientVolume {
                    pool: *pool,
                    required: *required,
                    available: *available,
                }),
                other_discrepancy => other.push(other_discrepancy.to_string()),
            }
        }
        if !other.is_empty() {
            errors.push(LabError::RackVerificationFailed {
                rack: self.rack.clone(),
                discrepancies: other,
            });
        }
        errors
    }

    pub fn into_result(self) -> LabResult<()> {
        let mut diagnostics = Diagnostics::new();
        for error in self.errors() {
            diagnostics.push(error);
        }
        diagnostics.into_result(())
    }
}

fn check_shape(report: &mut VerificationReport, rack: &Rack, shape: RackShape) -> bool {
    if rack.shape != shape {
        report.push(Discrepancy::ShapeMismatch {
            expected: shape,
            found: rack.shape,
        });
        return false;
    }
    true
}

/// Check a plate against the expected wells
///
/// With `strict`, samples at positions outside `expected` are reported too.
pub fn verify_plate(
    rack: &Rack,
    shape: RackShape,
    expected: &BTreeMap<RackPosition, ExpectedWell>,
    strict: bool,
) -> VerificationReport {
    let mut report = VerificationReport::new(rack);
    if !check_shape(&mut report, rack, shape) {
        return report;
    }
    for (&position, well) in expected {
        let sample = rack.sample(position);
        match (well, sample) {
            (ExpectedWell::Sample { pool }, None) => report.push(Discrepancy::Missing {
                position,
                pool: Some(*pool),
            }),
            (ExpectedWell::Sample { pool }, Some(sample)) if sample.pool != Some(*pool) => {
                report.push(Discrepancy::Mismatch {
                    position,
                    expected: *pool,
                    found: sample.pool,
                })
            }
            (ExpectedWell::Liquid, None) => report.push(Discrepancy::Missing { position, pool: None }),
            (ExpectedWell::Empty, Some(_)) => report.push(Discrepancy::Extra { position }),
            _ => {}
        }
    }
    if strict {
        let extra: Vec<RackPosition> = rack
            .containers
            .keys()
            .copied()
            .filter(|p| !expected.contains_key(p) && rack.sample(*p).is_some())
            .collect();
        for position in extra {
            report.push(Discrepancy::Extra { position });
        }
    }
    report
}

/// Check that a plate holds nothing yet
pub fn verify_empty(rack: &Rack, shape: RackShape) -> VerificationReport {
    verify_plate(rack, shape, &BTreeMap::new(), true)
}

/// Check a stock rack: every tube holds its pool and enough volume
///
/// `required` is the take-out per rack position over all copies; the tube
/// must hold that plus `dead_volume`.
pub fn verify_stock_rack(
    rack: &Rack,
    layout: &StockRackLayout,
    required: &BTreeMap<RackPosition, f64>,
    dead_volume: f64,
) -> VerificationReport {
    let mut report = VerificationReport::new(rack);
    if !check_shape(&mut report, rack, layout.shape()) {
        return report;
    }
    for position in layout.positions() {
        let pool = position.pool();
        match rack.sample(position.position) {
            None => report.push(Discrepancy::Missing {
                position: position.position,
                pool: Some(pool),
            }),
            Some(sample) if sample.pool != Some(pool) => report.push(Discrepancy::Mismatch {
                position: position.position,
                expected: pool,
                found: sample.pool,
            }),
            Some(sample) => {
                let needed = units::round_volume(required.get(&position.position).copied().unwrap_or_default() + dead_volume);
                if units::is_smaller_than(sample.volume, needed) {
                    report.push(Discrepancy::InsufficientVolume {
                        position: position.position,
                        pool,
                        required: needed,
                        available: sample.volume,
                    });
                }
            }
        }
    }
    let extra: Vec<RackPosition> = rack
        .containers
        .keys()
        .copied()
        .filter(|p| layout.get(*p).is_none() && rack.sample(*p).is_some())
        .collect();
    for position in extra {
        report.push(Discrepancy::Extra { position });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Sample, StockRackPosition};

    fn stock_layout() -> StockRackLayout {
        let mut layout = StockRackLayout::new(RackShape::Wells96);
        layout
            .add(StockRackPosition::new(RackPosition::new(0, 0), 205201, "1000001"))
            .unwrap();
        layout
            .add(StockRackPosition::new(RackPosition::new(1, 0), 330001, "1000002"))
            .unwrap();
        layout
    }

    #[test]
    fn test_missing_tube_names_pool() {
        let mut rack = Rack::tube_rack("02000001", "T1_iso_01_s#1");
        rack.put_tube(RackPosition::new(0, 0), "1000001", Sample::new(205201, 100.0, 50000.0));

        let report = verify_stock_rack(&rack, &stock_layout(), &BTreeMap::new(), 5.0);
        assert!(!report.is_ok());
        assert!(matches!(
            report.into_result(),
            Err(LabError::TubeNotFound { pool: 330001 })
        ));
    }

    #[test]
    fn test_short_tube_is_insufficient() {
        let mut rack = Rack::tube_rack("02000001", "T1_iso_01_s#1");
        rack.put_tube(RackPosition::new(0, 0), "1000001", Sample::new(205201, 6.0, 50000.0));
        rack.put_tube(RackPosition::new(1, 0), "1000002", Sample::new(330001, 100.0, 50000.0));
        let required = BTreeMap::from([(RackPosition::new(0, 0), 2.0)]);

        let report = verify_stock_rack(&rack, &stock_layout(), &required, 5.0);
        assert_eq!(report.discrepancies.len(), 1);
        assert!(matches!(
            report.errors().as_slice(),
            [LabError::InsufficientVolume { pool: 205201, .. }]
        ));
    }

    #[test]
    fn test_plate_must_be_empty() {
        let mut plate = Rack::plate("T1_iso_01_a", "T1_iso_01_a", RackShape::Wells96, "standard 96");
        assert!(verify_empty(&plate, RackShape::Wells96).is_ok());

        *plate.sample_mut(RackPosition::new(1, 1)) = Some(Sample::buffer(5.0));
        let report = verify_empty(&plate, RackShape::Wells96);
        assert_eq!(
            report.discrepancies,
            vec![Discrepancy::Extra {
                position: RackPosition::new(1, 1)
            }]
        );
    }

    #[test]
    fn test_shape_mismatch_stops_early() {
        let plate = Rack::plate("P1", "P1", RackShape::Wells384, "standard 384");
        let report = verify_plate(&plate, RackShape::Wells96, &BTreeMap::new(), true);
        assert!(matches!(
            report.discrepancies.as_slice(),
            [Discrepancy::ShapeMismatch { .. }]
        ));
    }
}
