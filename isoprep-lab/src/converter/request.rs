//! Request layouts and request records

use super::content::{content_tag_values, read_content, FloatingPools};
use super::predicates::{CONCENTRATION, VOLUME};
use super::{decode, to_persisted_form, Defect, PositionReader, RackLayoutRecord, TagEncode};
use crate::context::Context;
use crate::error::{LabError, LabResult};
use crate::model::{IsoRequest, IsoRequestRecord, PoolId, PositionType, RackLayout, RequestPosition};
use isoprep_common::units;
use std::collections::BTreeSet;
use tracing::debug;

pub const DOMAIN: &str = "iso_request";

impl TagEncode for RequestPosition {
    fn tag_values(&self) -> Vec<(&'static str, String)> {
        let mut values = content_tag_values(&self.content);
        if let Some(volume) = self.volume {
            values.push((VOLUME, volume.to_string()));
        }
        if let Some(concentration) = self.concentration {
            values.push((CONCENTRATION, concentration.to_string()));
        }
        values
    }
}

fn read_request_position(reader: &mut PositionReader<'_>, context: &Context) -> Option<RequestPosition> {
    let content = read_content(reader, context, FloatingPools::Forbidden)?;
    let name = content.position_type().name();
    let (volume, concentration) = match content.position_type() {
        PositionType::Fixed | PositionType::Floating => {
            let volume = reader.required_positive(VOLUME);
            (volume, reader.required_positive(CONCENTRATION))
        }
        PositionType::Mock => {
            reader.forbid(CONCENTRATION, name);
            (reader.required_positive(VOLUME), None)
        }
        PositionType::Library => (reader.positive(VOLUME), reader.positive(CONCENTRATION)),
        PositionType::Empty | PositionType::Untreated => {
            reader.forbid(VOLUME, name);
            reader.forbid(CONCENTRATION, name);
            (None, None)
        }
    };
    if reader.has_defects() {
        return None;
    }
    match RequestPosition::new(reader.position(), content, volume, concentration) {
        Ok(position) => Some(position),
        Err(err) => {
            let position = reader.label();
            reader.defect(Defect::Rejected {
                position,
                reason: err.to_string(),
            });
            None
        }
    }
}

/// Decode a persisted request layout; fixed pools must be in the context
pub fn decode_request_layout(record: &RackLayoutRecord, context: &Context) -> LabResult<RackLayout<RequestPosition>> {
    decode(record, DOMAIN, "request", |reader| read_request_position(reader, context))
}

pub fn encode_request_layout(layout: &RackLayout<RequestPosition>) -> RackLayoutRecord {
    to_persisted_form(layout, DOMAIN)
}

/// Decode and validate a request record
///
/// Floating positions take the stock concentration shared by the pools of
/// the pool set; pools with different stock concentrations are rejected.
pub fn decode_request(record: &IsoRequestRecord, context: &Context) -> LabResult<IsoRequest> {
    let mut layout = decode_request_layout(&record.layout, context)?;

    let mut stock_concentrations = Vec::new();
    for &id in &record.pool_set {
        stock_concentrations.push(context.pool(id)?.stock_concentration);
    }
    if let Some(&first) = stock_concentrations.first() {
        if let Some(&other) = stock_concentrations.iter().find(|&&c| !units::are_equal(c, first)) {
            return Err(LabError::LayoutInvariantViolation(format!(
                "floating pools have different stock concentrations ({} and {})",
                first, other
            )));
        }
        layout.set_floating_stock_concentration(first)?;
    }

    let request = IsoRequest {
        ticket: record.ticket.clone(),
        scenario: record.scenario,
        layout,
        number_aliquots: record.number_aliquots,
        process_job_first: record.process_job_first,
        pool_set: record.pool_set.clone(),
        library: record.library.clone(),
        isos_per_job: record.isos_per_job,
        reservoir: record.reservoir.clone(),
    };
    request.validate()?;
    debug!(
        ticket = %request.ticket,
        scenario = %request.scenario,
        positions = request.layout.len(),
        "Decoded ISO request"
    );
    Ok(request)
}

pub fn encode_request(request: &IsoRequest) -> IsoRequestRecord {
    IsoRequestRecord {
        ticket: request.ticket.clone(),
        scenario: request.scenario,
        layout: encode_request_layout(&request.layout),
        number_aliquots: request.number_aliquots,
        process_job_first: request.process_job_first,
        pool_set: request.pool_set.clone(),
        library: request.library.clone(),
        isos_per_job: request.isos_per_job,
        reservoir: request.reservoir.clone(),
    }
}

/// Pool ids a request record refers to (pool tags and pool set)
pub fn referenced_pools(record: &IsoRequestRecord) -> BTreeSet<PoolId> {
    let mut pools = record.layout.pool_ids();
    pools.extend(record.pool_set.iter().copied());
    pools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Placeholder, Pool, RackPosition, RackShape, Scenario, WellContent};
    use isoprep_common::config::MachineConstants;

    fn pool(id: PoolId, stock_concentration: f64) -> Pool {
        Pool {
            id,
            stock_concentration,
            molecule_type: "siRNA".to_string(),
            supplier: None,
        }
    }

    fn request(positions: Vec<RequestPosition>, pool_set: Vec<PoolId>) -> IsoRequest {
        let mut layout = RackLayout::new(RackShape::Wells96);
        for position in positions {
            layout.add(position).unwrap();
        }
        IsoRequest {
            ticket: "R1".to_string(),
            scenario: Scenario::Optimization,
            layout,
            number_aliquots: 1,
            process_job_first: false,
            pool_set,
            library: None,
            isos_per_job: 1,
            reservoir: None,
        }
    }

    #[test]
    fn test_request_record_survives_json() {
        let context = Context::new(MachineConstants::default()).with_pools([pool(205201, 50000.0)]);
        let original = request(
            vec![
                RequestPosition::new(
                    RackPosition::new(1, 1),
                    WellContent::Fixed { pool: 205201 },
                    Some(2.0),
                    Some(10000.0),
                )
                .unwrap(),
                RequestPosition::new(RackPosition::new(3, 1), WellContent::Mock, Some(2.0), None).unwrap(),
            ],
            Vec::new(),
        );

        let json = serde_json::to_string(&encode_request(&original)).unwrap();
        let record: IsoRequestRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(referenced_pools(&record), BTreeSet::from([205201]));
        assert_eq!(decode_request(&record, &context).unwrap(), original);
    }

    #[test]
    fn test_pool_set_with_mixed_stock_concentrations_rejected() {
        let context = Context::new(MachineConstants::default())
            .with_pools([pool(100001, 50000.0), pool(100002, 10000.0)]);
        let floating = WellContent::Floating {
            placeholder: Placeholder(1),
            pool: None,
        };
        let position = RequestPosition::new(RackPosition::new(1, 1), floating, Some(2.0), Some(100.0)).unwrap();
        let record = encode_request(&request(vec![position], vec![100001, 100002]));

        assert_eq!(referenced_pools(&record), BTreeSet::from([100001, 100002]));
        let err = decode_request(&record, &context).unwrap_err();
        assert!(matches!(err, LabError::LayoutInvariantViolation(_)), "unexpected error: {:?}", err);
    }
}
