//! Test Helper Utilities
//!
//! Pool catalog, source tube rack and request builders shared by the
//! scenario tests.

#![allow(dead_code)]

use isoprep_common::config::MachineConstants;
use isoprep_common::labels::EntityLabel;
use isoprep_lab::model::{
    IsoRequest, Placeholder, Pool, PoolId, Rack, RackLayout, RackPosition, RackShape, RequestPosition, Sample,
    Scenario, WellContent,
};
use isoprep_lab::planner::{self, build_isos, register_job, IsoBatch, IsoDraft};
use isoprep_lab::repository::{Inventory, MemoryInventory, RackRepository};
use isoprep_lab::stock::{apply_tube_moves, assign_stock_racks, StockRackBarcodes};
use isoprep_lab::worklists::generate_processing_series;
use isoprep_lab::Context;
use std::collections::BTreeSet;

/// Fixed pools used by the control layouts
pub const POOLS: [PoolId; 5] = [205201, 330001, 333803, 1056000, 180005];

/// Pools bound to floating placeholders
pub const FLOATING_POOLS: [PoolId; 4] = [100001, 100002, 100003, 100004];

pub const STOCK_CONCENTRATION: f64 = 50000.0;

/// Storage rack holding one stock tube per pool
pub const SOURCE_RACK: &str = "09000001";

pub const TUBE_VOLUME: f64 = 50.0;

pub fn pool(id: PoolId) -> Pool {
    Pool {
        id,
        stock_concentration: STOCK_CONCENTRATION,
        molecule_type: "siRNA".to_string(),
        supplier: Some("Ambion".to_string()),
    }
}

pub fn all_pools() -> Vec<PoolId> {
    POOLS.iter().chain(FLOATING_POOLS.iter()).copied().collect()
}

/// Tube barcode of a pool in the source rack
pub fn tube_barcode(id: PoolId) -> String {
    format!("T{}", id)
}

pub fn pos(label: &str) -> RackPosition {
    label.parse().unwrap()
}

pub fn context() -> Context {
    Context::new(MachineConstants::default()).with_pools(all_pools().into_iter().map(pool))
}

/// Storage rack with one stock tube per pool
pub fn source_rack() -> Rack {
    let mut source = Rack::tube_rack(SOURCE_RACK, "source rack");
    let slots = RackShape::Wells96.positions_by_column();
    for (id, slot) in all_pools().into_iter().zip(slots) {
        source.put_tube(slot, tube_barcode(id), Sample::new(id, TUBE_VOLUME, STOCK_CONCENTRATION));
    }
    source
}

/// Inventory with every pool and the source rack
pub async fn inventory() -> MemoryInventory {
    let inventory = MemoryInventory::new();
    for id in all_pools() {
        inventory.insert_pool(pool(id)).await;
    }
    inventory.save_rack(&source_rack()).await.unwrap();
    inventory
}

pub fn fixed(label: &str, pool: PoolId, volume: f64, concentration: f64) -> RequestPosition {
    RequestPosition::new(pos(label), WellContent::Fixed { pool }, Some(volume), Some(concentration)).unwrap()
}

pub fn fixed_at(position: RackPosition, pool: PoolId, volume: f64, concentration: f64) -> RequestPosition {
    RequestPosition::new(position, WellContent::Fixed { pool }, Some(volume), Some(concentration)).unwrap()
}

pub fn floating_at(position: RackPosition, placeholder: u32, volume: f64, concentration: f64) -> RequestPosition {
    let content = WellContent::Floating {
        placeholder: Placeholder(placeholder),
        pool: None,
    };
    RequestPosition::new(position, content, Some(volume), Some(concentration)).unwrap()
}

pub fn mock(label: &str, volume: f64) -> RequestPosition {
    RequestPosition::new(pos(label), WellContent::Mock, Some(volume), None).unwrap()
}

pub fn mock_at(position: RackPosition, volume: f64) -> RequestPosition {
    RequestPosition::new(position, WellContent::Mock, Some(volume), None).unwrap()
}

pub fn library_well(label: &str) -> RequestPosition {
    RequestPosition::new(pos(label), WellContent::Library { pool: None }, None, None).unwrap()
}

/// Request with one aliquot and one ISO per job
pub fn request(ticket: &str, scenario: Scenario, shape: RackShape, positions: Vec<RequestPosition>) -> IsoRequest {
    let mut layout = RackLayout::new(shape);
    for position in positions {
        layout.add(position).unwrap();
    }
    IsoRequest {
        ticket: ticket.to_string(),
        scenario,
        layout,
        number_aliquots: 1,
        process_job_first: false,
        pool_set: Vec::new(),
        library: None,
        isos_per_job: 1,
        reservoir: None,
    }
}

/// Bind the floating pool set (all pools share the stock concentration)
pub fn with_pool_set(mut request: IsoRequest, pools: &[PoolId]) -> IsoRequest {
    request.pool_set = pools.to_vec();
    request.layout.set_floating_stock_concentration(STOCK_CONCENTRATION).unwrap();
    request
}

/// Plan a request and draft `count` ISOs of job 1
pub fn draft(request: &IsoRequest, count: u32) -> IsoDraft {
    let context = context();
    let plan = planner::plan(request, &context).unwrap();
    let series = generate_processing_series(&plan, &context).unwrap();
    let batch = IsoBatch {
        count,
        ..IsoBatch::default()
    };
    build_isos(&plan, series, &request.pool_set, &BTreeSet::new(), &batch).unwrap()
}

/// Plan, register, assign and pick a request; returns the draft as planned
pub async fn prepared_job<R: Inventory>(
    inventory: &R,
    request: &IsoRequest,
    count: u32,
    barcodes: &[(&str, &str)],
) -> IsoDraft {
    let context = context();
    let draft = draft(request, count);
    register_job(inventory, &context, &draft).await.unwrap();

    let barcodes: StockRackBarcodes = barcodes
        .iter()
        .map(|(label, barcode)| (label.to_string(), barcode.to_string()))
        .collect();
    assign_stock_racks(inventory, &context, &draft.job.label, &barcodes)
        .await
        .unwrap();

    apply_tube_moves(inventory, &draft.job.label).await.unwrap();
    for iso in &draft.isos {
        apply_tube_moves(inventory, &iso.label).await.unwrap();
    }
    draft
}

pub fn iso_label(ticket: &str, number: u32) -> EntityLabel {
    EntityLabel::iso(ticket, number)
}

pub fn job_label(ticket: &str) -> EntityLabel {
    EntityLabel::job(ticket, 1)
}
