//! Stock rack layouts: pool, tube and plate-qualified targets per tube

use super::predicates::{ORIGIN, POOL_ID, TRANSFER_TARGETS, TUBE_BARCODE};
use super::{decode, format_targets, parse_targets, to_persisted_form, Defect, RackLayoutRecord, TagEncode};
use crate::error::LabResult;
use crate::model::{PoolId, RackPosition, StockRackLayout, StockRackPosition, TubeOrigin};

pub const DOMAIN: &str = "stock_rack";

impl TagEncode for StockRackPosition {
    fn tag_values(&self) -> Vec<(&'static str, String)> {
        let mut values = vec![
            (POOL_ID, self.pool().to_string()),
            (TUBE_BARCODE, self.tube_barcode.clone()),
            (TRANSFER_TARGETS, format_targets(&self.transfer_targets)),
        ];
        if let Some(origin) = &self.origin {
            values.push((ORIGIN, format!("{}:{}", origin.rack_barcode, origin.position)));
        }
        values
    }
}

fn parse_origin(value: &str) -> Option<TubeOrigin> {
    let (rack_barcode, position) = value.rsplit_once(':')?;
    let position: RackPosition = position.parse().ok()?;
    if rack_barcode.is_empty() {
        return None;
    }
    Some(TubeOrigin {
        rack_barcode: rack_barcode.to_string(),
        position,
    })
}

pub fn decode_stock_rack_layout(record: &RackLayoutRecord) -> LabResult<StockRackLayout> {
    decode(record, DOMAIN, "stock rack", |reader| {
        let pool = reader.require(POOL_ID).and_then(|value| match value.parse::<PoolId>() {
            Ok(id) => Some(id),
            Err(_) => {
                let position = reader.label();
                reader.defect(Defect::UnknownPool {
                    position,
                    value: value.to_string(),
                });
                None
            }
        });
        let tube = reader.require(TUBE_BARCODE);
        let targets = if reader.require(TRANSFER_TARGETS).is_some() {
            parse_targets(reader, TRANSFER_TARGETS)
        } else {
            None
        };
        if let Some(targets) = &targets {
            if targets.iter().any(|t| t.target_rack.is_none()) {
                let position = reader.label();
                reader.defect(Defect::Rejected {
                    position,
                    reason: "stock transfer targets need a plate marker".to_string(),
                });
            }
        }
        let origin = match reader.take(ORIGIN) {
            Some(value) => {
                let parsed = parse_origin(value);
                if parsed.is_none() {
                    reader.invalid(ORIGIN, value);
                }
                parsed
            }
            None => None,
        };
        if reader.has_defects() {
            return None;
        }

        let mut position = StockRackPosition::new(reader.position(), pool?, tube?);
        position.transfer_targets = targets?;
        position.origin = origin;
        Some(position)
    })
}

pub fn encode_stock_rack_layout(layout: &StockRackLayout) -> RackLayoutRecord {
    to_persisted_form(layout, DOMAIN)
}
