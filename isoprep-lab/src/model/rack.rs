//! Rack shapes, rack positions and the 384-well sector geometry

use crate::error::LabError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Number of sectors (quadrants) of a 384-well plate
pub const NUMBER_SECTORS: u8 = 4;

/// Rack geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RackShape {
    /// 8 rows × 12 columns
    Wells96,
    /// 16 rows × 24 columns
    Wells384,
}

impl RackShape {
    pub fn number_rows(self) -> u8 {
        match self {
            RackShape::Wells96 => 8,
            RackShape::Wells384 => 16,
        }
    }

    pub fn number_columns(self) -> u8 {
        match self {
            RackShape::Wells96 => 12,
            RackShape::Wells384 => 24,
        }
    }

    pub fn from_dimensions(number_rows: u8, number_columns: u8) -> Option<Self> {
        match (number_rows, number_columns) {
            (8, 12) => Some(RackShape::Wells96),
            (16, 24) => Some(RackShape::Wells384),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RackShape::Wells96 => "8x12",
            RackShape::Wells384 => "16x24",
        }
    }

    pub fn contains(self, position: RackPosition) -> bool {
        position.row < self.number_rows() && position.column < self.number_columns()
    }

    /// All positions in canonical (row-first) order
    pub fn positions(self) -> impl Iterator<Item = RackPosition> {
        let columns = self.number_columns();
        (0..self.number_rows()).flat_map(move |row| (0..columns).map(move |column| RackPosition { row, column }))
    }

    /// All positions column by column (A1, B1, …, A2, …)
    pub fn positions_by_column(self) -> impl Iterator<Item = RackPosition> {
        let rows = self.number_rows();
        (0..self.number_columns()).flat_map(move |column| (0..rows).map(move |row| RackPosition { row, column }))
    }
}

impl fmt::Display for RackShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RackShape {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "8x12" => Ok(RackShape::Wells96),
            "16x24" => Ok(RackShape::Wells384),
            other => Err(LabError::InvalidRequest(format!("Unknown rack shape '{}'", other))),
        }
    }
}

impl Serialize for RackShape {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for RackShape {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Zero-based (row, column) position within a rack
///
/// Ordering is row-first (A1, A2, …, B1, …), the canonical traversal order
/// for every output derived from a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RackPosition {
    pub row: u8,
    pub column: u8,
}

impl RackPosition {
    pub fn new(row: u8, column: u8) -> Self {
        Self { row, column }
    }

    /// Label such as `B2` (row letter, one-based column)
    pub fn label(self) -> String {
        format!("{}{}", (b'A' + self.row) as char, self.column as u32 + 1)
    }

    /// Sector of a 384-well position: `(row mod 2) * 2 + (column mod 2)`
    pub fn sector_index(self) -> u8 {
        (self.row % 2) * 2 + self.column % 2
    }

    /// Position of the enclosing quadrant (the matching 96-well position)
    pub fn quadrant(self) -> RackPosition {
        RackPosition::new(self.row / 2, self.column / 2)
    }

    /// Position of `sector` within the quadrant at `quadrant`
    pub fn from_quadrant(quadrant: RackPosition, sector: u8) -> RackPosition {
        RackPosition::new(quadrant.row * 2 + sector / 2, quadrant.column * 2 + sector % 2)
    }
}

impl fmt::Display for RackPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for RackPosition {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LabError::InvalidRequest(format!("Invalid rack position label '{}'", s));
        let mut chars = s.chars();
        let letter = chars.next().ok_or_else(invalid)?;
        if !letter.is_ascii_uppercase() {
            return Err(invalid());
        }
        let column: u32 = chars.as_str().parse().map_err(|_| invalid())?;
        if column == 0 || column > u8::MAX as u32 {
            return Err(invalid());
        }
        Ok(RackPosition::new(letter as u8 - b'A', (column - 1) as u8))
    }
}

impl Serialize for RackPosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for RackPosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
