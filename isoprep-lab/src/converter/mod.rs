//! Layout converter
//!
//! Layouts are persisted as tagged rack-position sets: every tag
//! (`domain:predicate=value`) is stored once together with the set of rack
//! positions it applies to, and tags sharing the same position set are
//! grouped. Decoding reads every attribute of every position, runs the rule
//! functions of the layout type and reports all defects at once; a layout
//! with any defect is rejected as a whole.
//!
//! Converter family:
//! - [`request`]: request layouts (content, ISO volume and concentration)
//! - [`lab`]: final and preparation plate layouts (shared base rules plus
//!   `from_job` and `external_targets`)
//! - [`stock`]: stock rack layouts

mod content;
pub mod lab;
pub mod request;
pub mod stock;

pub use lab::{decode_final_layout, decode_prep_layout};
pub use request::{decode_request, decode_request_layout};
pub use stock::decode_stock_rack_layout;

use crate::error::{LabError, LabResult};
use crate::model::{LayoutPosition, PoolId, RackLayout, RackPosition, RackShape};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Attribute names shared by the converters
pub mod predicates {
    pub const POSITION_TYPE: &str = "position_type";
    pub const POOL_ID: &str = "pool_id";
    pub const PLACEHOLDER: &str = "placeholder";
    pub const VOLUME: &str = "volume";
    pub const CONCENTRATION: &str = "concentration";
    pub const TRANSFER_TARGETS: &str = "transfer_targets";
    pub const SECTOR_INDEX: &str = "sector_index";
    pub const STOCK_RACK_MARKER: &str = "stock_rack_marker";
    pub const STOCK_TUBE_BARCODE: &str = "stock_tube_barcode";
    pub const STOCK_RACK_BARCODE: &str = "stock_rack_barcode";
    pub const FROM_JOB: &str = "from_job";
    pub const EXTERNAL_TARGETS: &str = "external_targets";
    pub const TUBE_BARCODE: &str = "tube_barcode";
    pub const ORIGIN: &str = "origin";
}

/// Separator between transfer targets in one tag value
pub const TARGET_SEPARATOR: char = '-';

/// `domain:predicate=value`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub domain: String,
    pub predicate: String,
    pub value: String,
}

impl Tag {
    pub fn new(domain: &str, predicate: &str, value: impl Into<String>) -> Self {
        Self {
            domain: domain.to_string(),
            predicate: predicate.to_string(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}={}", self.domain, self.predicate, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedPositionSet {
    pub tags: BTreeSet<Tag>,
    pub positions: BTreeSet<RackPosition>,
}

/// Persisted form of a layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RackLayoutRecord {
    pub shape: RackShape,
    pub tagged_sets: Vec<TaggedPositionSet>,
}

impl RackLayoutRecord {
    /// Pool ids named by pool tags (the missing-floating marker is skipped)
    pub fn pool_ids(&self) -> BTreeSet<PoolId> {
        self.tagged_sets
            .iter()
            .flat_map(|set| set.tags.iter())
            .filter(|tag| tag.predicate == predicates::POOL_ID)
            .filter_map(|tag| tag.value.parse().ok())
            .collect()
    }
}

/// One problem found while decoding a record
#[derive(Debug, Clone, PartialEq)]
pub enum Defect {
    UnknownPool { position: String, value: String },
    InvalidPositionType { position: String, value: String },
    InvalidValue { position: String, attribute: String, value: String },
    MissingAttribute { position: String, attribute: String },
    ForbiddenAttribute { position: String, position_type: String, attribute: String },
    UnknownAttribute { position: String, attribute: String },
    InvalidFloatingPool { position: String, value: String },
    InvalidTransferTargets { position: String, value: String },
    DuplicateTransferTarget { position: String, target: String },
    ConflictingValues { position: String, attribute: String, values: Vec<String> },
    PositionOutsideShape { position: String },
    ForeignDomain { tag: String },
    Rejected { position: String, reason: String },
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Defect::UnknownPool { position, value } => write!(f, "{}: unknown pool '{}'", position, value),
            Defect::InvalidPositionType { position, value } => {
                write!(f, "{}: invalid position type '{}'", position, value)
            }
            Defect::InvalidValue {
                position,
                attribute,
                value,
            } => write!(f, "{}: invalid {} '{}'", position, attribute, value),
            Defect::MissingAttribute { position, attribute } => write!(f, "{}: {} is missing", position, attribute),
            Defect::ForbiddenAttribute {
                position,
                position_type,
                attribute,
            } => write!(f, "{}: {} positions must not have a {}", position, position_type, attribute),
            Defect::UnknownAttribute { position, attribute } => {
                write!(f, "{}: unknown attribute '{}'", position, attribute)
            }
            Defect::InvalidFloatingPool { position, value } => write!(
                f,
                "{}: floating pool '{}' is neither a pool id nor the missing-floating marker",
                position, value
            ),
            Defect::InvalidTransferTargets { position, value } => {
                write!(f, "{}: invalid transfer targets '{}'", position, value)
            }
            Defect::DuplicateTransferTarget { position, target } => {
                write!(f, "{}: duplicate transfer target {}", position, target)
            }
            Defect::ConflictingValues {
                position,
                attribute,
                values,
            } => write!(f, "{}: conflicting {} values {}", position, attribute, values.join(", ")),
            Defect::PositionOutsideShape { position } => write!(f, "{}: outside the rack shape", position),
            Defect::ForeignDomain { tag } => write!(f, "tag '{}' belongs to another layout type", tag),
            Defect::Rejected { position, reason } => write!(f, "{}: {}", position, reason),
        }
    }
}

/// Positions that can be written as tags
pub trait TagEncode: LayoutPosition {
    /// `(predicate, value)` pairs of this position
    fn tag_values(&self) -> Vec<(&'static str, String)>;
}

/// Persisted form of a layout: closed, grouped by identical position sets
pub fn to_persisted_form<P>(layout: &RackLayout<P>, domain: &str) -> RackLayoutRecord
where
    P: TagEncode,
{
    // Step 1: every tag with the positions it applies to
    let mut tag_positions: BTreeMap<Tag, BTreeSet<RackPosition>> = BTreeMap::new();
    for position in layout.positions().filter(|p| !p.is_empty()) {
        for (predicate, value) in position.tag_values() {
            tag_positions
                .entry(Tag::new(domain, predicate, value))
                .or_default()
                .insert(position.rack_position());
        }
    }

    // Step 2: group tags that share a position set
    let mut grouped: BTreeMap<BTreeSet<RackPosition>, BTreeSet<Tag>> = BTreeMap::new();
    for (tag, positions) in tag_positions {
        grouped.entry(positions).or_default().insert(tag);
    }

    RackLayoutRecord {
        shape: layout.shape(),
        tagged_sets: grouped
            .into_iter()
            .map(|(positions, tags)| TaggedPositionSet { tags, positions })
            .collect(),
    }
}

/// Attribute values of one position as read from a record
pub struct PositionReader<'a> {
    position: RackPosition,
    values: &'a BTreeMap<String, String>,
    used: BTreeSet<String>,
    defects: Vec<Defect>,
}

impl<'a> PositionReader<'a> {
    fn new(position: RackPosition, values: &'a BTreeMap<String, String>) -> Self {
        Self {
            position,
            values,
            used: BTreeSet::new(),
            defects: Vec::new(),
        }
    }

    pub fn position(&self) -> RackPosition {
        self.position
    }

    pub fn label(&self) -> String {
        self.position.label()
    }

    pub fn defect(&mut self, defect: Defect) {
        self.defects.push(defect);
    }

    pub fn has_defects(&self) -> bool {
        !self.defects.is_empty()
    }

    /// Raw value (marks the attribute as consumed)
    pub fn take(&mut self, attribute: &str) -> Option<&'a str> {
        self.used.insert(attribute.to_string());
        self.values.get(attribute).map(String::as_str)
    }

    pub fn require(&mut self, attribute: &str) -> Option<&'a str> {
        let value = self.take(attribute);
        if value.is_none() {
            let position = self.label();
            self.defect(Defect::MissingAttribute {
                position,
                attribute: attribute.to_string(),
            });
        }
        value
    }

    /// The attribute must not be present for this position type
    pub fn forbid(&mut self, attribute: &str, position_type: &str) {
        if self.take(attribute).is_some() {
            let position = self.label();
            self.defect(Defect::ForbiddenAttribute {
                position,
                position_type: position_type.to_string(),
                attribute: attribute.to_string(),
            });
        }
    }

    /// Parse an optional attribute; unparsable values are reported
    pub fn parse<T: std::str::FromStr>(&mut self, attribute: &str) -> Option<T> {
        let value = self.take(attribute)?;
        match value.parse::<T>() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                self.invalid(attribute, value);
                None
            }
        }
    }

    /// Optional positive number
    pub fn positive(&mut self, attribute: &str) -> Option<f64> {
        let value = self.take(attribute)?;
        match value.parse::<f64>() {
            Ok(number) if number > 0.0 && number.is_finite() => Some(number),
            _ => {
                self.invalid(attribute, value);
                None
            }
        }
    }

    /// Required positive number
    pub fn required_positive(&mut self, attribute: &str) -> Option<f64> {
        self.require(attribute)?;
        self.positive(attribute)
    }

    pub fn invalid(&mut self, attribute: &str, value: &str) {
        let position = self.label();
        self.defect(Defect::InvalidValue {
            position,
            attribute: attribute.to_string(),
            value: value.to_string(),
        });
    }

    /// Collected defects; unread attributes count only for otherwise valid positions
    fn finish(self) -> Vec<Defect> {
        let mut defects = self.defects;
        if !defects.is_empty() {
            return defects;
        }
        for attribute in self.values.keys().filter(|a| !self.used.contains(*a)) {
            defects.push(Defect::UnknownAttribute {
                position: self.position.label(),
                attribute: attribute.clone(),
            });
        }
        defects
    }
}

/// Attribute map per position; foreign tags and conflicting values become defects
fn collect_attributes(
    record: &RackLayoutRecord,
    domain: &str,
    defects: &mut Vec<Defect>,
) -> BTreeMap<RackPosition, BTreeMap<String, String>> {
    let mut seen: BTreeMap<RackPosition, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();
    for set in &record.tagged_sets {
        for tag in &set.tags {
            if tag.domain != domain {
                defects.push(Defect::ForeignDomain { tag: tag.to_string() });
                continue;
            }
            for &position in &set.positions {
                seen.entry(position)
                    .or_default()
                    .entry(tag.predicate.clone())
                    .or_default()
                    .insert(tag.value.clone());
            }
        }
    }

    let mut attributes = BTreeMap::new();
    for (position, values) in seen {
        let mut single = BTreeMap::new();
        for (predicate, candidates) in values {
            if candidates.len() > 1 {
                defects.push(Defect::ConflictingValues {
                    position: position.label(),
                    attribute: predicate,
                    values: candidates.into_iter().collect(),
                });
                continue;
            }
            if let Some(value) = candidates.into_iter().next() {
                single.insert(predicate, value);
            }
        }
        attributes.insert(position, single);
    }
    attributes
}

/// Decode a record: runs `build` for every position and fails with all defects
pub fn decode<P, F>(record: &RackLayoutRecord, domain: &str, layout_name: &str, mut build: F) -> LabResult<RackLayout<P>>
where
    P: LayoutPosition,
    F: FnMut(&mut PositionReader<'_>) -> Option<P>,
{
    let mut defects = Vec::new();
    let attributes = collect_attributes(record, domain, &mut defects);
    let mut layout = RackLayout::new(record.shape);

    for (position, values) in &attributes {
        if !record.shape.contains(*position) {
            defects.push(Defect::PositionOutsideShape {
                position: position.label(),
            });
            continue;
        }
        let mut reader = PositionReader::new(*position, values);
        let built = build(&mut reader);
        defects.extend(reader.finish());
        if let Some(built) = built {
            if let Err(err) = layout.add(built) {
                defects.push(Defect::Rejected {
                    position: position.label(),
                    reason: err.to_string(),
                });
            }
        }
    }

    if !defects.is_empty() {
        return Err(LabError::ConversionFailed {
            layout: layout_name.to_string(),
            defects,
        });
    }
    layout.close();
    Ok(layout)
}

/// `A1:2-B1:2:a` → targets; each target must parse and be unique
pub fn parse_targets(
    reader: &mut PositionReader<'_>,
    attribute: &str,
) -> Option<Vec<crate::model::TransferTarget>> {
    let value = reader.take(attribute)?;
    let mut targets: Vec<crate::model::TransferTarget> = Vec::new();
    for part in value.split(TARGET_SEPARATOR) {
        match part.parse::<crate::model::TransferTarget>() {
            Ok(target) => {
                if targets
                    .iter()
                    .any(|t| t.position == target.position && t.target_rack == target.target_rack)
                {
                    let position = reader.label();
                    reader.defect(Defect::DuplicateTransferTarget {
                        position,
                        target: target.to_string(),
                    });
                } else {
                    targets.push(target);
                }
            }
            Err(_) => {
                let position = reader.label();
                reader.defect(Defect::InvalidTransferTargets {
                    position,
                    value: value.to_string(),
                });
                return None;
            }
        }
    }
    Some(targets)
}

/// Tag value of a target list
pub fn format_targets(targets: &[crate::model::TransferTarget]) -> String {
    targets
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(&TARGET_SEPARATOR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RequestPosition, WellContent};

    #[test]
    fn test_tags_sharing_positions_are_grouped() {
        let mut layout = RackLayout::new(RackShape::Wells96);
        for column in [1, 3] {
            layout
                .add(
                    RequestPosition::new(
                        RackPosition::new(1, column),
                        WellContent::Fixed { pool: 205201 },
                        Some(2.0),
                        Some(50.0),
                    )
                    .unwrap(),
                )
                .unwrap();
        }
        layout
            .add(RequestPosition::new(RackPosition::new(3, 1), WellContent::Mock, Some(2.0), None).unwrap())
            .unwrap();

        let record = to_persisted_form(&layout, request::DOMAIN);
        // {B2,B4}: fixed/pool/conc, {B2,B4,D2}: volume, {D2}: mock
        assert_eq!(record.tagged_sets.len(), 3);
        let all = record
            .tagged_sets
            .iter()
            .find(|s| s.positions.len() == 3)
            .unwrap();
        assert_eq!(all.tags.len(), 1);
        assert_eq!(all.tags.iter().next().unwrap().predicate, predicates::VOLUME);
    }

    #[test]
    fn test_conflicting_and_foreign_tags_are_reported_together() {
        let b2 = RackPosition::new(1, 1);
        let record = RackLayoutRecord {
            shape: RackShape::Wells96,
            tagged_sets: vec![
                TaggedPositionSet {
                    tags: [
                        Tag::new(request::DOMAIN, predicates::POSITION_TYPE, "mock"),
                        Tag::new(request::DOMAIN, predicates::VOLUME, "2"),
                        Tag::new("other", predicates::VOLUME, "2"),
                    ]
                    .into_iter()
                    .collect(),
                    positions: [b2].into_iter().collect(),
                },
                TaggedPositionSet {
                    tags: [Tag::new(request::DOMAIN, predicates::VOLUME, "3")].into_iter().collect(),
                    positions: [b2].into_iter().collect(),
                },
            ],
        };

        let err = decode_request_layout(&record, &crate::context::Context::default()).unwrap_err();
        match err {
            LabError::ConversionFailed { defects, .. } => {
                assert!(defects.iter().any(|d| matches!(d, Defect::ForeignDomain { .. })));
                assert!(defects.iter().any(|d| matches!(d, Defect::ConflictingValues { .. })));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
