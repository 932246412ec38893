//! Tube moves from storage racks into assigned stock racks

use crate::error::{LabError, LabResult};
use crate::model::{Rack, RackPosition};
use crate::repository::{EntityRepository, RackRepository};
use isoprep_common::labels::EntityLabel;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// One line of the picking list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TubeMove {
    pub tube_barcode: String,
    pub from_rack: String,
    pub from_position: RackPosition,
    pub to_rack: String,
    pub to_position: RackPosition,
}

/// Move the tubes of an entity's stock racks into place
///
/// Tubes already sitting in their stock rack are left alone. Source racks
/// are stored before the stock racks.
pub async fn apply_tube_moves<R>(repo: &R, label: &EntityLabel) -> LabResult<Vec<TubeMove>>
where
    R: RackRepository + EntityRepository + ?Sized,
{
    let entity = repo
        .get_entity(label)
        .await?
        .ok_or_else(|| LabError::UnknownLabel(label.to_string()))?;

    let mut sources: BTreeMap<String, Rack> = BTreeMap::new();
    let mut targets: Vec<Rack> = Vec::new();
    let mut moves = Vec::new();
    for stock_rack in entity.stock_racks() {
        let mut target = match repo.get_rack(&stock_rack.barcode).await? {
            Some(rack) => rack,
            None => Rack::tube_rack(&stock_rack.barcode, &stock_rack.label),
        };
        for position in stock_rack.layout.positions() {
            if target.tube_position(&position.tube_barcode) == Some(position.position) {
                continue;
            }
            let Some(origin) = &position.origin else {
                warn!(tube = %position.tube_barcode, rack = %stock_rack.label, "Tube has no recorded origin");
                continue;
            };
            if !sources.contains_key(&origin.rack_barcode) {
                let rack = repo
                    .get_rack(&origin.rack_barcode)
                    .await?
                    .ok_or_else(|| LabError::UnknownLabel(origin.rack_barcode.clone()))?;
                sources.insert(origin.rack_barcode.clone(), rack);
            }
            let source = sources
                .get_mut(&origin.rack_barcode)
                .ok_or_else(|| LabError::UnknownLabel(origin.rack_barcode.clone()))?;

            let found = source.tube_position(&position.tube_barcode);
            let container = found.and_then(|p| source.remove_tube(p));
            let Some(sample) = container.and_then(|c| c.sample) else {
                return Err(LabError::TubeNotFound { pool: position.pool() });
            };
            target.put_tube(position.position, position.tube_barcode.clone(), sample);
            moves.push(TubeMove {
                tube_barcode: position.tube_barcode.clone(),
                from_rack: origin.rack_barcode.clone(),
                from_position: found.unwrap_or(origin.position),
                to_rack: stock_rack.barcode.clone(),
                to_position: position.position,
            });
        }
        targets.push(target);
    }

    for rack in sources.values() {
        repo.save_rack(rack).await?;
    }
    for rack in &targets {
        repo.save_rack(rack).await?;
    }
    info!(entity = %label, tubes = moves.len(), "Moved stock tubes");
    Ok(moves)
}
