//! Rack layouts: partial mappings from rack position to typed position
//!
//! Invariants:
//! - at most one position per rack position
//! - positions lie within the declared rack shape
//! - a closed layout is immutable and holds no empty positions
//!   (untreated positions are kept)
//! - floating positions share one floating stock concentration

use crate::error::{LabError, LabResult};
use crate::model::position::{LabPosition, LayoutPosition};
use crate::model::rack::{RackPosition, RackShape};
use isoprep_common::units;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RackLayout<P> {
    shape: RackShape,
    positions: BTreeMap<RackPosition, P>,
    #[serde(default)]
    closed: bool,
    #[serde(default)]
    floating_stock_concentration: Option<f64>,
}

/// Structural equality: shape and mapping
impl<P: PartialEq> PartialEq for RackLayout<P> {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.positions == other.positions
    }
}

impl<P: LayoutPosition> RackLayout<P> {
    pub fn new(shape: RackShape) -> Self {
        Self {
            shape,
            positions: BTreeMap::new(),
            closed: false,
            floating_stock_concentration: None,
        }
    }

    pub fn shape(&self) -> RackShape {
        self.shape
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> LabResult<()> {
        if self.closed {
            return Err(LabError::LayoutInvariantViolation("layout is closed".to_string()));
        }
        Ok(())
    }

    /// Add a position; the rack position must be free and inside the shape
    pub fn add(&mut self, position: P) -> LabResult<()> {
        self.check_open()?;
        let rack_position = position.rack_position();
        if !self.shape.contains(rack_position) {
            return Err(LabError::LayoutInvariantViolation(format!(
                "position {} is outside the {} rack shape",
                rack_position, self.shape
            )));
        }
        if self.positions.contains_key(&rack_position) {
            return Err(LabError::LayoutInvariantViolation(format!(
                "position {} is already occupied",
                rack_position
            )));
        }
        self.positions.insert(rack_position, position);
        Ok(())
    }

    pub fn remove(&mut self, rack_position: RackPosition) -> LabResult<Option<P>> {
        self.check_open()?;
        Ok(self.positions.remove(&rack_position))
    }

    pub fn get(&self, rack_position: RackPosition) -> Option<&P> {
        self.positions.get(&rack_position)
    }

    /// Mutable access (open layouts only)
    pub fn get_mut(&mut self, rack_position: RackPosition) -> LabResult<Option<&mut P>> {
        self.check_open()?;
        Ok(self.positions.get_mut(&rack_position))
    }

    /// Positions in canonical row-first order
    pub fn positions(&self) -> impl Iterator<Item = &P> {
        self.positions.values()
    }

    pub fn rack_positions(&self) -> impl Iterator<Item = RackPosition> + '_ {
        self.positions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.values().all(|p| p.is_empty())
    }

    pub fn floating_positions(&self) -> impl Iterator<Item = &P> {
        self.positions.values().filter(|p| p.content().is_floating())
    }

    /// Rack positions without content (explicit empties or unset), in column order
    pub fn empty_rack_positions(&self) -> Vec<RackPosition> {
        self.shape
            .positions_by_column()
            .filter(|rp| self.positions.get(rp).map(|p| p.is_empty()).unwrap_or(true))
            .collect()
    }

    /// Positions grouped by the sector of their rack position
    pub fn sector_map(&self) -> BTreeMap<u8, Vec<&P>> {
        let mut map: BTreeMap<u8, Vec<&P>> = BTreeMap::new();
        for (rack_position, position) in &self.positions {
            map.entry(rack_position.sector_index()).or_default().push(position);
        }
        map
    }

    pub fn floating_stock_concentration(&self) -> Option<f64> {
        self.floating_stock_concentration
    }

    /// Declare the stock concentration shared by all floating positions
    pub fn set_floating_stock_concentration(&mut self, concentration: f64) -> LabResult<()> {
        match self.floating_stock_concentration {
            Some(existing) if !units::are_equal(existing, concentration) => {
                Err(LabError::LayoutInvariantViolation(format!(
                    "floating positions have different stock concentrations ({} and {})",
                    existing, concentration
                )))
            }
            _ => {
                self.floating_stock_concentration = Some(concentration);
                Ok(())
            }
        }
    }

    /// Drop empty positions and freeze the layout (idempotent)
    pub fn close(&mut self) {
        self.positions.retain(|_, p| !p.is_empty());
        self.closed = true;
    }

    /// Closed copy of this layout
    pub fn closed_copy(&self) -> Self
    where
        P: Clone,
    {
        let mut copy = self.clone();
        copy.close();
        copy
    }
}

impl<P: LabPosition> RackLayout<P> {
    /// Wells filled directly from stock
    pub fn starting_wells(&self) -> impl Iterator<Item = &P> {
        self.positions.values().filter(|p| p.base().is_starting_well())
    }
}
