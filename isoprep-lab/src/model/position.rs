//! Typed well contents and layout positions
//!
//! Position kinds are a closed sum type ([`WellContent`]). Attributes shared
//! by every plate position live in [`LabIsoPosition`]; final and preparation
//! positions compose it and add their own attribute (`from_job`,
//! `external_targets`). Each constructor validates the attributes allowed for
//! the content type and fails with [`LabError::InvalidPosition`].

use crate::error::{LabError, LabResult};
use crate::model::pool::{Placeholder, PoolId};
use crate::model::rack::{RackPosition, NUMBER_SECTORS};
use isoprep_common::labels::{RackMarker, RackRole};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed enumeration of position types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionType {
    Fixed,
    Floating,
    Library,
    Mock,
    Empty,
    Untreated,
}

impl PositionType {
    pub fn name(self) -> &'static str {
        match self {
            PositionType::Fixed => "fixed",
            PositionType::Floating => "floating",
            PositionType::Library => "library",
            PositionType::Mock => "mock",
            PositionType::Empty => "empty",
            PositionType::Untreated => "untreated",
        }
    }
}

impl fmt::Display for PositionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PositionType {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(PositionType::Fixed),
            "floating" => Ok(PositionType::Floating),
            "library" => Ok(PositionType::Library),
            "mock" => Ok(PositionType::Mock),
            "empty" => Ok(PositionType::Empty),
            "untreated" => Ok(PositionType::Untreated),
            other => Err(LabError::InvalidRequest(format!("Unknown position type '{}'", other))),
        }
    }
}

/// Content of a well
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WellContent {
    /// Known pool ordered from stock
    Fixed { pool: PoolId },
    /// Placeholder bound to a concrete pool per ISO (`None` until bound, or missing)
    Floating {
        placeholder: Placeholder,
        #[serde(default)]
        pool: Option<PoolId>,
    },
    /// Sample already present on a library plate
    Library {
        #[serde(default)]
        pool: Option<PoolId>,
    },
    /// Buffer only
    Mock,
    /// Empty for planning, marked for the scientist
    Untreated,
    Empty,
}

impl WellContent {
    pub fn position_type(&self) -> PositionType {
        match self {
            WellContent::Fixed { .. } => PositionType::Fixed,
            WellContent::Floating { .. } => PositionType::Floating,
            WellContent::Library { .. } => PositionType::Library,
            WellContent::Mock => PositionType::Mock,
            WellContent::Untreated => PositionType::Untreated,
            WellContent::Empty => PositionType::Empty,
        }
    }

    /// Concrete pool, if known
    pub fn pool(&self) -> Option<PoolId> {
        match self {
            WellContent::Fixed { pool } => Some(*pool),
            WellContent::Floating { pool, .. } | WellContent::Library { pool } => *pool,
            _ => None,
        }
    }

    pub fn placeholder(&self) -> Option<Placeholder> {
        match self {
            WellContent::Floating { placeholder, .. } => Some(*placeholder),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, WellContent::Empty)
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, WellContent::Mock)
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, WellContent::Floating { .. })
    }

    pub fn is_untreated(&self) -> bool {
        matches!(self, WellContent::Untreated)
    }

    /// Fixed or floating: content that is ordered from stock
    pub fn is_sample(&self) -> bool {
        matches!(self, WellContent::Fixed { .. } | WellContent::Floating { .. })
    }

    /// Identity used to group wells of one reagent during planning
    ///
    /// Floating positions are grouped by placeholder so the plan is valid for
    /// every binding.
    pub fn reagent_key(&self) -> Option<ReagentKey> {
        match self {
            WellContent::Fixed { pool } => Some(ReagentKey::Pool(*pool)),
            WellContent::Floating { placeholder, .. } => Some(ReagentKey::Floating(*placeholder)),
            _ => None,
        }
    }
}

/// Planning identity of a stock reagent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReagentKey {
    Pool(PoolId),
    Floating(Placeholder),
}

impl fmt::Display for ReagentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReagentKey::Pool(id) => write!(f, "pool {}", id),
            ReagentKey::Floating(placeholder) => write!(f, "{}", placeholder),
        }
    }
}

/// Target of a transfer: `(position, volume, optional target rack marker)`
///
/// Targets with the same position and target marker are duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTarget {
    pub position: RackPosition,
    /// Volume per transfer (µl)
    pub volume: f64,
    #[serde(default)]
    pub target_rack: Option<RackMarker>,
}

impl TransferTarget {
    pub fn new(position: RackPosition, volume: f64) -> Self {
        Self {
            position,
            volume,
            target_rack: None,
        }
    }

    pub fn on_rack(position: RackPosition, volume: f64, target_rack: RackMarker) -> Self {
        Self {
            position,
            volume,
            target_rack: Some(target_rack),
        }
    }

    fn key(&self) -> (RackPosition, Option<RackMarker>) {
        (self.position, self.target_rack)
    }
}

/// Persisted form: `D2:2.5` or `D2:2.5:a`
impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.position, self.volume)?;
        if let Some(marker) = self.target_rack {
            write!(f, ":{}", marker)?;
        }
        Ok(())
    }
}

impl FromStr for TransferTarget {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LabError::InvalidRequest(format!("Invalid transfer target '{}'", s));
        let mut parts = s.split(':');
        let position: RackPosition = parts.next().ok_or_else(invalid)?.parse()?;
        let volume: f64 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
        let target_rack = match parts.next() {
            Some(marker) => Some(marker.parse::<RackMarker>()?),
            None => None,
        };
        if parts.next().is_some() || volume <= 0.0 {
            return Err(invalid());
        }
        Ok(Self {
            position,
            volume,
            target_rack,
        })
    }
}

/// Add a target, rejecting duplicates
pub fn add_transfer_target(owner: RackPosition, targets: &mut Vec<TransferTarget>, target: TransferTarget) -> LabResult<()> {
    if targets.iter().any(|t| t.key() == target.key()) {
        return Err(LabError::DuplicateTransferTarget {
            position: owner.label(),
            target: target.to_string(),
        });
    }
    targets.push(target);
    Ok(())
}

fn invalid(position: RackPosition, reason: impl Into<String>) -> LabError {
    LabError::InvalidPosition {
        position: position.label(),
        reason: reason.into(),
    }
}

fn check_positive(position: RackPosition, what: &str, value: Option<f64>) -> LabResult<f64> {
    match value {
        Some(v) if v > 0.0 && v.is_finite() => Ok(v),
        Some(v) => Err(invalid(position, format!("{} must be positive (got {})", what, v))),
        None => Err(invalid(position, format!("{} is required", what))),
    }
}

/// Common interface of everything a [`crate::model::RackLayout`] can hold
pub trait LayoutPosition {
    fn rack_position(&self) -> RackPosition;
    fn content(&self) -> &WellContent;

    fn is_empty(&self) -> bool {
        self.content().is_empty()
    }
}

/// Position of a request layout (what the scientist asked for)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPosition {
    pub position: RackPosition,
    pub content: WellContent,
    /// Volume per final plate well (µl)
    #[serde(default)]
    pub volume: Option<f64>,
    /// Final concentration (nM)
    #[serde(default)]
    pub concentration: Option<f64>,
}

impl RequestPosition {
    pub fn new(
        position: RackPosition,
        content: WellContent,
        volume: Option<f64>,
        concentration: Option<f64>,
    ) -> LabResult<Self> {
        match &content {
            WellContent::Empty | WellContent::Untreated => {
                if volume.is_some() || concentration.is_some() {
                    return Err(invalid(
                        position,
                        format!("{} positions carry neither volume nor concentration", content.position_type()),
                    ));
                }
            }
            WellContent::Mock => {
                check_positive(position, "volume", volume)?;
                if concentration.is_some() {
                    return Err(invalid(position, "mock positions must not have a concentration"));
                }
            }
            WellContent::Fixed { .. } | WellContent::Floating { .. } => {
                check_positive(position, "volume", volume)?;
                check_positive(position, "concentration", concentration)?;
            }
            WellContent::Library { .. } => {
                if volume.is_some() {
                    check_positive(position, "volume", volume)?;
                }
                if concentration.is_some() {
                    check_positive(position, "concentration", concentration)?;
                }
            }
        }
        Ok(Self {
            position,
            content,
            volume,
            concentration,
        })
    }

    pub fn empty(position: RackPosition) -> Self {
        Self {
            position,
            content: WellContent::Empty,
            volume: None,
            concentration: None,
        }
    }
}

impl LayoutPosition for RequestPosition {
    fn rack_position(&self) -> RackPosition {
        self.position
    }

    fn content(&self) -> &WellContent {
        &self.content
    }
}

/// Attributes shared by preparation and final plate positions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabIsoPosition {
    pub position: RackPosition,
    pub content: WellContent,
    /// Volume the well holds once filled (µl)
    pub volume: f64,
    /// Concentration (nM); absent for mock, empty and untreated wells
    #[serde(default)]
    pub concentration: Option<f64>,
    /// Targets on the same plate
    #[serde(default)]
    pub transfer_targets: Vec<TransferTarget>,
    #[serde(default)]
    pub sector_index: Option<u8>,
    /// Stock rack this well is filled from (marks a starting well)
    #[serde(default)]
    pub stock_rack_marker: Option<RackMarker>,
    #[serde(default)]
    pub stock_tube_barcode: Option<String>,
    #[serde(default)]
    pub stock_rack_barcode: Option<String>,
}

impl LabIsoPosition {
    pub fn new(
        position: RackPosition,
        content: WellContent,
        volume: f64,
        concentration: Option<f64>,
    ) -> LabResult<Self> {
        match &content {
            WellContent::Empty | WellContent::Untreated => {
                if volume != 0.0 || concentration.is_some() {
                    return Err(invalid(
                        position,
                        format!("{} positions carry neither volume nor concentration", content.position_type()),
                    ));
                }
            }
            WellContent::Mock => {
                check_positive(position, "volume", Some(volume))?;
                if concentration.is_some() {
                    return Err(invalid(position, "mock positions must not have a concentration"));
                }
            }
            WellContent::Fixed { .. } | WellContent::Floating { .. } => {
                check_positive(position, "volume", Some(volume))?;
                check_positive(position, "concentration", concentration)?;
            }
            WellContent::Library { .. } => {
                if volume < 0.0 {
                    return Err(invalid(position, "volume must not be negative"));
                }
                if concentration.is_some() {
                    check_positive(position, "concentration", concentration)?;
                }
            }
        }
        Ok(Self {
            position,
            content,
            volume,
            concentration,
            transfer_targets: Vec::new(),
            sector_index: None,
            stock_rack_marker: None,
            stock_tube_barcode: None,
            stock_rack_barcode: None,
        })
    }

    pub fn empty(position: RackPosition) -> Self {
        Self {
            position,
            content: WellContent::Empty,
            volume: 0.0,
            concentration: None,
            transfer_targets: Vec::new(),
            sector_index: None,
            stock_rack_marker: None,
            stock_tube_barcode: None,
            stock_rack_barcode: None,
        }
    }

    /// Filled directly from a stock tube
    pub fn is_starting_well(&self) -> bool {
        self.stock_rack_marker.is_some()
    }

    pub fn set_stock_rack_marker(&mut self, marker: RackMarker) -> LabResult<()> {
        if marker.role != RackRole::Stock {
            return Err(invalid(self.position, format!("'{}' is not a stock rack marker", marker)));
        }
        if !self.content.is_sample() {
            return Err(invalid(
                self.position,
                format!("{} positions must not carry stock data", self.content.position_type()),
            ));
        }
        self.stock_rack_marker = Some(marker);
        Ok(())
    }

    /// Record the tube chosen by the stock-rack assigner
    pub fn set_stock_tube(&mut self, tube_barcode: String, rack_barcode: String) -> LabResult<()> {
        if !self.content.is_sample() || self.stock_rack_marker.is_none() {
            return Err(invalid(self.position, "only starting wells carry stock tube data"));
        }
        self.stock_tube_barcode = Some(tube_barcode);
        self.stock_rack_barcode = Some(rack_barcode);
        Ok(())
    }

    pub fn set_sector_index(&mut self, sector_index: u8) -> LabResult<()> {
        if sector_index >= NUMBER_SECTORS {
            return Err(invalid(self.position, format!("sector index {} out of range", sector_index)));
        }
        self.sector_index = Some(sector_index);
        Ok(())
    }

    pub fn add_transfer_target(&mut self, target: TransferTarget) -> LabResult<()> {
        if target.target_rack.is_some() {
            return Err(invalid(self.position, "plate-internal targets carry no rack marker"));
        }
        add_transfer_target(self.position, &mut self.transfer_targets, target)
    }
}

/// Access to the shared plate attributes
pub trait LabPosition: LayoutPosition {
    fn base(&self) -> &LabIsoPosition;
    fn base_mut(&mut self) -> &mut LabIsoPosition;
}

/// Position of a final (aliquot) plate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalPosition {
    pub base: LabIsoPosition,
    /// Filled by the job phase rather than the ISO phase
    #[serde(default)]
    pub from_job: bool,
}

impl FinalPosition {
    pub fn new(base: LabIsoPosition, from_job: bool) -> Self {
        Self { base, from_job }
    }
}

impl LayoutPosition for FinalPosition {
    fn rack_position(&self) -> RackPosition {
        self.base.position
    }

    fn content(&self) -> &WellContent {
        &self.base.content
    }
}

impl LabPosition for FinalPosition {
    fn base(&self) -> &LabIsoPosition {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LabIsoPosition {
        &mut self.base
    }
}

/// Position of a preparation (intermediate) plate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepPosition {
    pub base: LabIsoPosition,
    /// Targets on other plates (always carry a rack marker)
    #[serde(default)]
    pub external_targets: Vec<TransferTarget>,
}

impl PrepPosition {
    pub fn new(base: LabIsoPosition) -> Self {
        Self {
            base,
            external_targets: Vec::new(),
        }
    }

    pub fn add_external_target(&mut self, target: TransferTarget) -> LabResult<()> {
        match target.target_rack {
            Some(marker) if marker.role.is_plate() => {}
            _ => {
                return Err(invalid(
                    self.base.position,
                    "external targets need a plate marker",
                ))
            }
        }
        add_transfer_target(self.base.position, &mut self.external_targets, target)
    }

    /// Volume leaving the well per preparation (µl), without copies
    pub fn outgoing_volume(&self) -> f64 {
        self.base
            .transfer_targets
            .iter()
            .chain(self.external_targets.iter())
            .map(|t| t.volume)
            .sum()
    }
}

impl LayoutPosition for PrepPosition {
    fn rack_position(&self) -> RackPosition {
        self.base.position
    }

    fn content(&self) -> &WellContent {
        &self.base.content
    }
}

impl LabPosition for PrepPosition {
    fn base(&self) -> &LabIsoPosition {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LabIsoPosition {
        &mut self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b2() -> RackPosition {
        RackPosition::new(1, 1)
    }

    #[test]
    fn test_mock_rejects_concentration() {
        let result = LabIsoPosition::new(b2(), WellContent::Mock, 10.0, Some(50.0));
        assert!(matches!(result, Err(LabError::InvalidPosition { .. })));
        assert!(LabIsoPosition::new(b2(), WellContent::Mock, 10.0, None).is_ok());
    }

    #[test]
    fn test_fixed_requires_concentration() {
        let result = LabIsoPosition::new(b2(), WellContent::Fixed { pool: 205201 }, 2.0, None);
        assert!(matches!(result, Err(LabError::InvalidPosition { .. })));
    }

    #[test]
    fn test_mock_rejects_stock_data() {
        let mut mock = LabIsoPosition::new(b2(), WellContent::Mock, 10.0, None).unwrap();
        assert!(mock.set_stock_rack_marker(RackMarker::stock(1)).is_err());

        let mut fixed = LabIsoPosition::new(b2(), WellContent::Fixed { pool: 1 }, 2.0, Some(50.0)).unwrap();
        assert!(fixed.set_stock_rack_marker(RackMarker::final_plate()).is_err());
        fixed.set_stock_rack_marker(RackMarker::stock(1)).unwrap();
        assert!(fixed.is_starting_well());
    }

    #[test]
    fn test_duplicate_transfer_targets_rejected() {
        let mut prep = PrepPosition::new(
            LabIsoPosition::new(b2(), WellContent::Fixed { pool: 1 }, 20.0, Some(500.0)).unwrap(),
        );
        let d2 = RackPosition::new(3, 1);
        prep.add_external_target(TransferTarget::on_rack(d2, 2.0, RackMarker::final_plate()))
            .unwrap();
        let duplicate = prep.add_external_target(TransferTarget::on_rack(d2, 3.0, RackMarker::final_plate()));
        assert!(matches!(duplicate, Err(LabError::DuplicateTransferTarget { .. })));

        // Same position on another plate is a different target
        let other_plate = RackMarker::numbered(RackRole::Final, 2);
        prep.add_external_target(TransferTarget::on_rack(d2, 2.0, other_plate))
            .unwrap();
        assert!(prep.add_external_target(TransferTarget::new(d2, 2.0)).is_err());
        assert_eq!(prep.outgoing_volume(), 4.0);
    }

    #[test]
    fn test_transfer_target_text_form() {
        let target = TransferTarget::on_rack(RackPosition::new(3, 1), 2.5, RackMarker::final_plate());
        assert_eq!(target.to_string(), "D2:2.5:a");
        assert_eq!("D2:2.5:a".parse::<TransferTarget>().unwrap(), target);
        assert_eq!("D2:2".parse::<TransferTarget>().unwrap(), TransferTarget::new(RackPosition::new(3, 1), 2.0));
        assert!("D2:-1".parse::<TransferTarget>().is_err());
    }

    #[test]
    fn test_request_position_validation() {
        assert!(RequestPosition::new(b2(), WellContent::Untreated, None, None).is_ok());
        assert!(RequestPosition::new(b2(), WellContent::Untreated, Some(1.0), None).is_err());
        assert!(RequestPosition::new(
            b2(),
            WellContent::Floating {
                placeholder: Placeholder(1),
                pool: None
            },
            Some(10.0),
            Some(50.0)
        )
        .is_ok());
    }
}
