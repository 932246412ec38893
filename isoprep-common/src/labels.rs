//! Label grammar for racks, ISOs, ISO jobs and worklists
//!
//! Labels are a stable external contract. Fields are joined by `_`:
//!
//! | Entity | Grammar |
//! |--------|---------|
//! | ISO | `<ticket>_iso_<NN>` (optional `_copy`) |
//! | ISO job | `<ticket>_job_<NN>` |
//! | Rack | `<entity_label>_<rack_marker>` |
//! | Rack marker | `<role>[#<n>]`, role ∈ `a`, `p`, `jp`, `s` |
//! | Transfer worklist | `<ticket>_<n>_<src_marker>_to_<tgt_marker>` |
//! | Buffer worklist | `<ticket>_<n>_<tgt_marker>_buffer` |
//!
//! Entity numbers are zero-padded to width 2. Worklist numbers and marker
//! indices are printed as plain integers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Label parsing failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    #[error("Unknown label: '{0}'")]
    UnknownLabel(String),

    #[error("Unknown rack marker: '{0}'")]
    UnknownMarker(String),
}

/// Role of a rack within an ISO preparation
///
/// Variant order is the chain order used for every deterministic sort:
/// stock racks feed job preparation plates, which feed ISO preparation
/// plates, which feed the final (aliquot) plates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RackRole {
    Stock,
    JobPrep,
    IsoPrep,
    Final,
}

impl RackRole {
    /// Marker token used in labels
    pub fn token(self) -> &'static str {
        match self {
            RackRole::Stock => "s",
            RackRole::JobPrep => "jp",
            RackRole::IsoPrep => "p",
            RackRole::Final => "a",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "s" => Some(RackRole::Stock),
            "jp" => Some(RackRole::JobPrep),
            "p" => Some(RackRole::IsoPrep),
            "a" => Some(RackRole::Final),
            _ => None,
        }
    }

    /// True for plates that are processed by pipetting robots (everything but stock racks)
    pub fn is_plate(self) -> bool {
        !matches!(self, RackRole::Stock)
    }
}

/// Typed rack marker (`a`, `p`, `jp`, `s`, optionally suffixed `#<n>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RackMarker {
    pub role: RackRole,
    pub index: Option<u16>,
}

impl RackMarker {
    pub fn new(role: RackRole) -> Self {
        Self { role, index: None }
    }

    pub fn numbered(role: RackRole, index: u16) -> Self {
        Self {
            role,
            index: Some(index),
        }
    }

    /// The final plate marker `a`
    pub fn final_plate() -> Self {
        Self::new(RackRole::Final)
    }

    /// Stock rack marker `s#<n>`
    pub fn stock(index: u16) -> Self {
        Self::numbered(RackRole::Stock, index)
    }

    /// Marker with the index dropped (`a#2` → `a`)
    pub fn base(self) -> Self {
        Self::new(self.role)
    }
}

impl fmt::Display for RackMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}#{}", self.role.token(), index),
            None => write!(f, "{}", self.role.token()),
        }
    }
}

impl FromStr for RackMarker {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || LabelError::UnknownMarker(s.to_string());
        let (token, index) = match s.split_once('#') {
            Some((token, number)) => {
                let index: u16 = number.parse().map_err(|_| unknown())?;
                (token, Some(index))
            }
            None => (s, None),
        };
        let role = RackRole::from_token(token).ok_or_else(unknown)?;
        Ok(Self { role, index })
    }
}

impl Serialize for RackMarker {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RackMarker {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of entity that owns racks and worklists
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Iso,
    Job,
}

impl EntityKind {
    fn token(self) -> &'static str {
        match self {
            EntityKind::Iso => "iso",
            EntityKind::Job => "job",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Parsed ISO or ISO-job label
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityLabel {
    pub ticket: String,
    pub kind: EntityKind,
    pub number: u32,
    pub copy: bool,
}

impl EntityLabel {
    pub fn iso(ticket: impl Into<String>, number: u32) -> Self {
        Self {
            ticket: ticket.into(),
            kind: EntityKind::Iso,
            number,
            copy: false,
        }
    }

    pub fn job(ticket: impl Into<String>, number: u32) -> Self {
        Self {
            ticket: ticket.into(),
            kind: EntityKind::Job,
            number,
            copy: false,
        }
    }

    /// Label of a rack owned by this entity
    pub fn rack_label(&self, marker: RackMarker) -> String {
        format!("{}_{}", self, marker)
    }
}

impl fmt::Display for EntityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{:02}", self.ticket, self.kind.token(), self.number)?;
        if self.copy {
            write!(f, "_copy")?;
        }
        Ok(())
    }
}

impl FromStr for EntityLabel {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || LabelError::UnknownLabel(s.to_string());
        let mut parts: Vec<&str> = s.split('_').collect();
        let copy = parts.last() == Some(&"copy");
        if copy {
            parts.pop();
        }
        if parts.len() < 3 {
            return Err(unknown());
        }
        let number_text = parts.pop().ok_or_else(unknown)?;
        let kind = match parts.pop() {
            Some("iso") => EntityKind::Iso,
            Some("job") => EntityKind::Job,
            _ => return Err(unknown()),
        };
        if number_text.len() < 2 {
            return Err(unknown());
        }
        let number: u32 = number_text.parse().map_err(|_| unknown())?;
        let ticket = parts.join("_");
        if ticket.is_empty() {
            return Err(unknown());
        }
        Ok(Self {
            ticket,
            kind,
            number,
            copy,
        })
    }
}

/// Parsed rack label (`<entity_label>_<rack_marker>`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RackLabel {
    pub entity: EntityLabel,
    pub marker: RackMarker,
}

impl fmt::Display for RackLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity.rack_label(self.marker))
    }
}

impl FromStr for RackLabel {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity, marker) = s
            .rsplit_once('_')
            .ok_or_else(|| LabelError::UnknownLabel(s.to_string()))?;
        let marker: RackMarker = marker
            .parse()
            .map_err(|_| LabelError::UnknownLabel(s.to_string()))?;
        let entity: EntityLabel = entity.parse()?;
        Ok(Self { entity, marker })
    }
}

/// Kind part of a worklist label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorklistLabelKind {
    Transfer { source: RackMarker, target: RackMarker },
    Buffer { target: RackMarker },
}

/// Parsed worklist label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorklistLabel {
    pub ticket: String,
    pub number: u32,
    pub kind: WorklistLabelKind,
}

impl WorklistLabel {
    pub fn transfer(ticket: impl Into<String>, number: u32, source: RackMarker, target: RackMarker) -> Self {
        Self {
            ticket: ticket.into(),
            number,
            kind: WorklistLabelKind::Transfer { source, target },
        }
    }

    pub fn buffer(ticket: impl Into<String>, number: u32, target: RackMarker) -> Self {
        Self {
            ticket: ticket.into(),
            number,
            kind: WorklistLabelKind::Buffer { target },
        }
    }

    /// Label without the ticket prefix (used for bundle member names)
    pub fn suffix(&self) -> String {
        let full = self.to_string();
        full[self.ticket.len() + 1..].to_string()
    }
}

impl fmt::Display for WorklistLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WorklistLabelKind::Transfer { source, target } => {
                write!(f, "{}_{}_{}_to_{}", self.ticket, self.number, source, target)
            }
            WorklistLabelKind::Buffer { target } => {
                write!(f, "{}_{}_{}_buffer", self.ticket, self.number, target)
            }
        }
    }
}

impl FromStr for WorklistLabel {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || LabelError::UnknownLabel(s.to_string());
        let mut parts: Vec<&str> = s.split('_').collect();
        let kind = match parts.last() {
            Some(&"buffer") => {
                parts.pop();
                let target: RackMarker = parts.pop().ok_or_else(unknown)?.parse().map_err(|_| unknown())?;
                WorklistLabelKind::Buffer { target }
            }
            Some(_) => {
                let target: RackMarker = parts.pop().ok_or_else(unknown)?.parse().map_err(|_| unknown())?;
                if parts.pop() != Some("to") {
                    return Err(unknown());
                }
                let source: RackMarker = parts.pop().ok_or_else(unknown)?.parse().map_err(|_| unknown())?;
                WorklistLabelKind::Transfer { source, target }
            }
            None => return Err(unknown()),
        };
        let number: u32 = parts.pop().ok_or_else(unknown)?.parse().map_err(|_| unknown())?;
        let ticket = parts.join("_");
        if ticket.is_empty() {
            return Err(unknown());
        }
        Ok(Self {
            ticket,
            number,
            kind,
        })
    }
}

/// Serialize a label through its `Display`/`FromStr` grammar
macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(EntityLabel);
string_serde!(WorklistLabel);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_round_trip() {
        for text in ["a", "p", "jp", "s#1", "a#2", "jp#10"] {
            let marker: RackMarker = text.parse().unwrap();
            assert_eq!(marker.to_string(), text);
        }
    }

    #[test]
    fn test_marker_rejects_unknown_roles() {
        assert!("x".parse::<RackMarker>().is_err());
        assert!("s#".parse::<RackMarker>().is_err());
        assert!("s#one".parse::<RackMarker>().is_err());
        assert!("".parse::<RackMarker>().is_err());
    }

    #[test]
    fn test_marker_order_follows_chain() {
        let mut markers: Vec<RackMarker> = ["a", "s#2", "p", "jp", "s#1"]
            .iter()
            .map(|m| m.parse().unwrap())
            .collect();
        markers.sort();
        let printed: Vec<String> = markers.iter().map(|m| m.to_string()).collect();
        assert_eq!(printed, vec!["s#1", "s#2", "jp", "p", "a"]);
    }

    #[test]
    fn test_entity_labels_are_zero_padded() {
        assert_eq!(EntityLabel::iso("123", 1).to_string(), "123_iso_01");
        assert_eq!(EntityLabel::job("123", 12).to_string(), "123_job_12");
        let mut copy = EntityLabel::iso("123", 3);
        copy.copy = true;
        assert_eq!(copy.to_string(), "123_iso_03_copy");
    }

    #[test]
    fn test_entity_label_parse() {
        let label: EntityLabel = "123_iso_07_copy".parse().unwrap();
        assert_eq!(label.ticket, "123");
        assert_eq!(label.kind, EntityKind::Iso);
        assert_eq!(label.number, 7);
        assert!(label.copy);
        assert!("123_iso_7".parse::<EntityLabel>().is_err());
        assert!("123_plate_07".parse::<EntityLabel>().is_err());
    }

    #[test]
    fn test_rack_label_round_trip() {
        let label: RackLabel = "5501_job_01_s#1".parse().unwrap();
        assert_eq!(label.entity, EntityLabel::job("5501", 1));
        assert_eq!(label.marker, RackMarker::stock(1));
        assert_eq!(label.to_string(), "5501_job_01_s#1");
    }

    #[test]
    fn test_worklist_labels() {
        let transfer = WorklistLabel::transfer("77", 1, RackMarker::stock(1), RackMarker::final_plate());
        assert_eq!(transfer.to_string(), "77_1_s#1_to_a");
        assert_eq!(transfer.suffix(), "1_s#1_to_a");

        let buffer = WorklistLabel::buffer("77", 2, RackMarker::new(RackRole::IsoPrep));
        assert_eq!(buffer.to_string(), "77_2_p_buffer");

        assert_eq!("77_1_s#1_to_a".parse::<WorklistLabel>().unwrap(), transfer);
        assert_eq!("77_2_p_buffer".parse::<WorklistLabel>().unwrap(), buffer);
    }

    #[test]
    fn test_worklist_label_rejects_garbage() {
        assert!("77_x_p_buffer".parse::<WorklistLabel>().is_err());
        assert!("77_1_p_from_a".parse::<WorklistLabel>().is_err());
        assert!("1_p_buffer".parse::<WorklistLabel>().is_err());
    }

    #[test]
    fn test_labels_serialize_as_strings() {
        let label = EntityLabel::job("5501", 2);
        let json = serde_json::to_string(&label).unwrap();
        assert_eq!(json, "\"5501_job_02\"");
        let back: EntityLabel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, label);
    }
}
