//! Final and preparation plate layouts
//!
//! Both share the base rules of [`LabIsoPosition`]; the final converter adds
//! `from_job`, the preparation converter adds `external_targets`.

use super::content::{content_tag_values, read_content, FloatingPools};
use super::predicates::*;
use super::{decode, format_targets, parse_targets, to_persisted_form, Defect, PositionReader, RackLayoutRecord, TagEncode};
use crate::context::Context;
use crate::error::LabResult;
use crate::model::{
    FinalLayout, FinalPosition, LabIsoPosition, PositionType, PrepLayout, PrepPosition, TransferTarget, NUMBER_SECTORS,
};
use isoprep_common::labels::{RackMarker, RackRole};

pub const FINAL_DOMAIN: &str = "final_layout";
pub const PREP_DOMAIN: &str = "prep_layout";

fn base_tag_values(base: &LabIsoPosition) -> Vec<(&'static str, String)> {
    let mut values = content_tag_values(&base.content);
    if !matches!(base.content.position_type(), PositionType::Empty | PositionType::Untreated) {
        values.push((VOLUME, base.volume.to_string()));
    }
    if let Some(concentration) = base.concentration {
        values.push((CONCENTRATION, concentration.to_string()));
    }
    if !base.transfer_targets.is_empty() {
        values.push((TRANSFER_TARGETS, format_targets(&base.transfer_targets)));
    }
    if let Some(sector) = base.sector_index {
        values.push((SECTOR_INDEX, sector.to_string()));
    }
    if let Some(marker) = base.stock_rack_marker {
        values.push((STOCK_RACK_MARKER, marker.to_string()));
    }
    if let Some(tube) = &base.stock_tube_barcode {
        values.push((STOCK_TUBE_BARCODE, tube.clone()));
    }
    if let Some(rack) = &base.stock_rack_barcode {
        values.push((STOCK_RACK_BARCODE, rack.clone()));
    }
    values
}

impl TagEncode for FinalPosition {
    fn tag_values(&self) -> Vec<(&'static str, String)> {
        let mut values = base_tag_values(&self.base);
        if self.from_job {
            values.push((FROM_JOB, "true".to_string()));
        }
        values
    }
}

impl TagEncode for PrepPosition {
    fn tag_values(&self) -> Vec<(&'static str, String)> {
        let mut values = base_tag_values(&self.base);
        if !self.external_targets.is_empty() {
            values.push((EXTERNAL_TARGETS, format_targets(&self.external_targets)));
        }
        values
    }
}

fn reject(reader: &mut PositionReader<'_>, reason: String) {
    let position = reader.label();
    reader.defect(Defect::Rejected { position, reason });
}

/// Base rules shared by final and preparation positions
fn read_base(reader: &mut PositionReader<'_>, context: &Context) -> Option<LabIsoPosition> {
    let content = read_content(reader, context, FloatingPools::Bound)?;
    let position_type = content.position_type();
    let name = position_type.name();

    // Step 1: volume and concentration per type
    let (volume, concentration) = match position_type {
        PositionType::Fixed | PositionType::Floating => {
            let volume = reader.required_positive(VOLUME);
            (volume, reader.required_positive(CONCENTRATION))
        }
        PositionType::Mock => {
            reader.forbid(CONCENTRATION, name);
            (reader.required_positive(VOLUME), None)
        }
        PositionType::Library => {
            let volume = match reader.take(VOLUME) {
                Some(text) => match text.parse::<f64>() {
                    Ok(v) if v >= 0.0 => Some(v),
                    _ => {
                        reader.invalid(VOLUME, text);
                        None
                    }
                },
                None => Some(0.0),
            };
            (volume, reader.positive(CONCENTRATION))
        }
        PositionType::Empty | PositionType::Untreated => {
            reader.forbid(VOLUME, name);
            reader.forbid(CONCENTRATION, name);
            (Some(0.0), None)
        }
    };

    // Step 2: transfer data (samples and mocks only)
    let mut targets = Vec::new();
    if matches!(position_type, PositionType::Fixed | PositionType::Floating | PositionType::Mock) {
        if let Some(parsed) = parse_targets(reader, TRANSFER_TARGETS) {
            if parsed.iter().any(|t| t.target_rack.is_some()) {
                reject(reader, "plate-internal targets carry no rack marker".to_string());
            }
            targets = parsed;
        }
    } else {
        reader.forbid(TRANSFER_TARGETS, name);
    }
    let sector_index = if position_type == PositionType::Library {
        reader.forbid(SECTOR_INDEX, name);
        None
    } else {
        match reader.parse::<u8>(SECTOR_INDEX) {
            Some(sector) if sector >= NUMBER_SECTORS => {
                reader.invalid(SECTOR_INDEX, &sector.to_string());
                None
            }
            other => other,
        }
    };

    // Step 3: stock data (samples only)
    let (marker, tube, rack) = if content.is_sample() {
        let marker = reader.parse::<RackMarker>(STOCK_RACK_MARKER);
        if let Some(marker) = marker {
            if marker.role != RackRole::Stock {
                reader.invalid(STOCK_RACK_MARKER, &marker.to_string());
            }
        }
        let tube = reader.take(STOCK_TUBE_BARCODE);
        let rack = reader.take(STOCK_RACK_BARCODE);
        if marker.is_none() && (tube.is_some() || rack.is_some()) {
            reject(reader, "stock tube data without a stock rack marker".to_string());
        }
        (marker, tube, rack)
    } else {
        for attribute in [STOCK_RACK_MARKER, STOCK_TUBE_BARCODE, STOCK_RACK_BARCODE] {
            reader.forbid(attribute, name);
        }
        (None, None, None)
    };

    if reader.has_defects() {
        return None;
    }

    // Step 4: construct through the validating constructors
    let rack_position = reader.position();
    let built = (|| -> LabResult<LabIsoPosition> {
        let mut base = LabIsoPosition::new(rack_position, content, volume.unwrap_or_default(), concentration)?;
        for target in targets {
            base.add_transfer_target(target)?;
        }
        if let Some(sector) = sector_index {
            base.set_sector_index(sector)?;
        }
        if let Some(marker) = marker {
            base.set_stock_rack_marker(marker)?;
        }
        if let (Some(tube), Some(rack)) = (tube, rack) {
            base.set_stock_tube(tube.to_string(), rack.to_string())?;
        } else if let Some(tube) = tube {
            base.stock_tube_barcode = Some(tube.to_string());
        }
        Ok(base)
    })();
    match built {
        Ok(base) => Some(base),
        Err(err) => {
            reject(reader, err.to_string());
            None
        }
    }
}

fn read_final_position(reader: &mut PositionReader<'_>, context: &Context) -> Option<FinalPosition> {
    let from_job = reader.parse::<bool>(FROM_JOB);
    let base = read_base(reader, context)?;
    Some(FinalPosition::new(base, from_job.unwrap_or(false)))
}

fn read_prep_position(reader: &mut PositionReader<'_>, context: &Context) -> Option<PrepPosition> {
    let external: Vec<TransferTarget> = parse_targets(reader, EXTERNAL_TARGETS).unwrap_or_default();
    let base = read_base(reader, context)?;
    let mut position = PrepPosition::new(base);
    for target in external {
        if let Err(err) = position.add_external_target(target) {
            reject(reader, err.to_string());
            return None;
        }
    }
    Some(position)
}

pub fn decode_final_layout(record: &RackLayoutRecord, context: &Context) -> LabResult<FinalLayout> {
    decode(record, FINAL_DOMAIN, "final", |reader| read_final_position(reader, context))
}

pub fn decode_prep_layout(record: &RackLayoutRecord, context: &Context) -> LabResult<PrepLayout> {
    decode(record, PREP_DOMAIN, "preparation", |reader| read_prep_position(reader, context))
}

pub fn encode_final_layout(layout: &FinalLayout) -> RackLayoutRecord {
    to_persisted_form(layout, FINAL_DOMAIN)
}

pub fn encode_prep_layout(layout: &PrepLayout) -> RackLayoutRecord {
    to_persisted_form(layout, PREP_DOMAIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LabError;
    use crate::model::{Pool, RackPosition, RackShape, WellContent};
    use crate::converter::Tag;

    fn context() -> Context {
        Context::default().with_pools([Pool {
            id: 205201,
            stock_concentration: 50000.0,
            molecule_type: "siRNA".to_string(),
            supplier: None,
        }])
    }

    fn sample_layout() -> FinalLayout {
        let mut layout = FinalLayout::new(RackShape::Wells96);
        let mut b2 = LabIsoPosition::new(
            RackPosition::new(1, 1),
            WellContent::Fixed { pool: 205201 },
            4.5,
            Some(50.0),
        )
        .unwrap();
        b2.set_stock_rack_marker(RackMarker::stock(1)).unwrap();
        b2.add_transfer_target(TransferTarget::new(RackPosition::new(3, 1), 2.5)).unwrap();
        layout.add(FinalPosition::new(b2, true)).unwrap();
        let d2 = LabIsoPosition::new(
            RackPosition::new(3, 1),
            WellContent::Fixed { pool: 205201 },
            5.0,
            Some(25.0),
        )
        .unwrap();
        layout.add(FinalPosition::new(d2, false)).unwrap();
        layout
            .add(FinalPosition::new(
                LabIsoPosition::new(RackPosition::new(5, 1), WellContent::Mock, 5.0, None).unwrap(),
                false,
            ))
            .unwrap();
        layout
            .add(FinalPosition::new(LabIsoPosition::empty(RackPosition::new(7, 1)), false))
            .unwrap();
        layout
    }

    #[test]
    fn test_final_layout_round_trip_drops_empties() {
        let layout = sample_layout();
        let record = encode_final_layout(&layout);
        let decoded = decode_final_layout(&record, &context()).unwrap();
        assert_eq!(decoded, layout.closed_copy());
        assert!(decoded.is_closed());
        assert_eq!(encode_final_layout(&decoded), record);
    }

    #[test]
    fn test_mock_with_stock_data_is_rejected_with_all_defects() {
        let mut record = encode_final_layout(&sample_layout());
        let mock = RackPosition::new(5, 1);
        let unknown = RackPosition::new(6, 1);
        record.tagged_sets.push(crate::converter::TaggedPositionSet {
            tags: [Tag::new(FINAL_DOMAIN, STOCK_RACK_MARKER, "s#1")].into_iter().collect(),
            positions: [mock].into_iter().collect(),
        });
        record.tagged_sets.push(crate::converter::TaggedPositionSet {
            tags: [
                Tag::new(FINAL_DOMAIN, POSITION_TYPE, "fixed"),
                Tag::new(FINAL_DOMAIN, POOL_ID, "999"),
                Tag::new(FINAL_DOMAIN, VOLUME, "2"),
                Tag::new(FINAL_DOMAIN, CONCENTRATION, "50"),
            ]
            .into_iter()
            .collect(),
            positions: [unknown].into_iter().collect(),
        });

        match decode_final_layout(&record, &context()) {
            Err(LabError::ConversionFailed { defects, .. }) => {
                assert_eq!(defects.len(), 2);
                assert!(defects.contains(&Defect::ForbiddenAttribute {
                    position: "F2".to_string(),
                    position_type: "mock".to_string(),
                    attribute: STOCK_RACK_MARKER.to_string(),
                }));
                assert!(defects.contains(&Defect::UnknownPool {
                    position: "G2".to_string(),
                    value: "999".to_string(),
                }));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_floating_pool_must_be_id_or_missing_marker() {
        let b2 = RackPosition::new(1, 1);
        let record = |pool: &str| RackLayoutRecord {
            shape: RackShape::Wells96,
            tagged_sets: vec![crate::converter::TaggedPositionSet {
                tags: [
                    Tag::new(FINAL_DOMAIN, POSITION_TYPE, "floating"),
                    Tag::new(FINAL_DOMAIN, PLACEHOLDER, "md_1"),
                    Tag::new(FINAL_DOMAIN, POOL_ID, pool),
                    Tag::new(FINAL_DOMAIN, VOLUME, "2"),
                    Tag::new(FINAL_DOMAIN, CONCENTRATION, "50"),
                ]
                .into_iter()
                .collect(),
                positions: [b2].into_iter().collect(),
            }],
        };

        let missing = decode_final_layout(&record("missing_floating"), &context()).unwrap();
        assert_eq!(missing.get(b2).unwrap().base.content.pool(), None);
        let bound = decode_final_layout(&record("205201"), &context()).unwrap();
        assert_eq!(bound.get(b2).unwrap().base.content.pool(), Some(205201));
        assert!(matches!(
            decode_final_layout(&record("abc"), &context()),
            Err(LabError::ConversionFailed { .. })
        ));
    }

    #[test]
    fn test_prep_external_targets_round_trip() {
        let mut layout = PrepLayout::new(RackShape::Wells96);
        let mut position = PrepPosition::new(
            LabIsoPosition::new(
                RackPosition::new(3, 1),
                WellContent::Fixed { pool: 205201 },
                11.0,
                Some(10000.0),
            )
            .unwrap(),
        );
        position
            .add_external_target(TransferTarget::on_rack(RackPosition::new(3, 1), 2.0, RackMarker::final_plate()))
            .unwrap();
        layout.add(position).unwrap();

        let decoded = decode_prep_layout(&encode_prep_layout(&layout), &context()).unwrap();
        assert_eq!(decoded, layout);
        assert_eq!(decoded.get(RackPosition::new(3, 1)).unwrap().outgoing_volume(), 2.0);
    }
}
