//! Order-only flow against a SQLite inventory on disk

mod helpers;

use helpers::*;
use isoprep_common::config::MachineConstants;
use isoprep_lab::executor::execute;
use isoprep_lab::converter::lab::encode_final_layout;
use isoprep_lab::model::{IsoStatus, RackShape, Scenario};
use isoprep_lab::planner::register_job;
use isoprep_lab::repository::{EntityRepository, IsoRecord, RackRepository, SqliteInventory};
use isoprep_lab::stock::{apply_tube_moves, assign_stock_racks, StockRackBarcodes};
use isoprep_lab::Context;
use serial_test::serial;
use tokio_util::sync::CancellationToken;

async fn seeded(path: &std::path::Path) -> SqliteInventory {
    let inventory = SqliteInventory::open(path).await.unwrap();
    for id in all_pools() {
        inventory.insert_pool(&pool(id)).await.unwrap();
    }
    inventory.save_rack(&source_rack()).await.unwrap();
    inventory
}

#[tokio::test]
#[serial]
async fn test_order_only_flow_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("isoprep.db");

    let request = request(
        "S1",
        Scenario::OrderOnly,
        RackShape::Wells96,
        vec![
            fixed("B2", 205201, 2.0, 50000.0),
            fixed("D2", 330001, 2.0, 50000.0),
        ],
    );
    {
        let inventory = seeded(&db_path).await;
        prepared_job(&inventory, &request, 1, &[("S1_iso_01_s#1", "02000011")]).await;
        inventory.db().close().await;
    }

    // A fresh connection sees job, ISO, plates and the moved tubes
    let inventory = SqliteInventory::open(&db_path).await.unwrap();
    let iso = inventory.get_iso(&iso_label("S1", 1)).await.unwrap().unwrap();
    assert_eq!(iso.status, IsoStatus::Queued);
    assert_eq!(iso.stock_racks[0].barcode, "02000011");
    let stock = inventory.get_rack("02000011").await.unwrap().unwrap();
    assert!(stock.tube_position(&tube_barcode(330001)).is_some());

    let context = Context::for_entity(&inventory, &iso_label("S1", 1), MachineConstants::default())
        .await
        .unwrap();
    let report = execute(&inventory, &context, &iso_label("S1", 1), "lab_user", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, IsoStatus::Done);

    let plate = inventory.get_rack("S1_iso_01_a").await.unwrap().unwrap();
    assert_eq!(plate.sample(pos("D2")).unwrap().pool, Some(330001));
    let iso = inventory.get_iso(&iso_label("S1", 1)).await.unwrap().unwrap();
    assert_eq!(iso.status, IsoStatus::Done);

    let logged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM executed_worklists WHERE entity_label = ?")
        .bind("S1_iso_01")
        .fetch_one(inventory.db())
        .await
        .unwrap();
    assert_eq!(logged, 1);
}

#[tokio::test]
#[serial]
async fn test_layouts_stored_as_tagged_sets_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("isoprep.db");

    // Prep plate, a dilution inside the final plate and a mock
    let request = request(
        "S2",
        Scenario::Optimization,
        RackShape::Wells96,
        vec![
            fixed("B2", 205201, 10.0, 10000.0),
            fixed("D2", 205201, 10.0, 2000.0),
            mock("H2", 4.0),
        ],
    );
    let draft = draft(&request, 1);
    {
        let inventory = seeded(&db_path).await;
        register_job(&inventory, &context(), &draft).await.unwrap();
        inventory.db().close().await;
    }

    let inventory = SqliteInventory::open(&db_path).await.unwrap();
    let job = inventory.get_job(&job_label("S2")).await.unwrap().unwrap();
    let planned = &draft.job.plan;
    assert_eq!(job.plan.final_layout, planned.final_layout.closed_copy());
    assert!(job.plan.final_layout.is_closed());
    assert_eq!(job.plan.prep_plates.len(), planned.prep_plates.len());
    for (loaded, planned) in job.plan.prep_plates.iter().zip(&planned.prep_plates) {
        assert_eq!(loaded.marker, planned.marker);
        assert_eq!(loaded.layout, planned.layout.closed_copy());
    }
    assert_eq!(job.plan.stock_racks, planned.stock_racks);
    assert_eq!(job.processing_series, draft.job.processing_series);

    let iso = inventory.get_iso(&iso_label("S2", 1)).await.unwrap().unwrap();
    assert_eq!(iso.final_layout, draft.isos[0].final_layout.closed_copy());
    assert_eq!(iso.prep_plates, draft.isos[0].prep_plates);
    let donor = iso.final_layout.get(pos("B2")).unwrap();
    assert_eq!(donor.base.volume, 12.0);
    assert_eq!(donor.base.transfer_targets.len(), 1);

    // The payload holds tagged position sets, not the layout structs
    let payload: String = sqlx::query_scalar("SELECT payload FROM isos WHERE label = ?")
        .bind("S2_iso_01")
        .fetch_one(inventory.db())
        .await
        .unwrap();
    let record: IsoRecord = serde_json::from_str(&payload).unwrap();
    assert_eq!(record.final_layout.record, encode_final_layout(&iso.final_layout));

    // Stock rack layouts take the same path
    let barcodes: StockRackBarcodes = [("S2_iso_01_s#1".to_string(), "02000021".to_string())]
        .into_iter()
        .collect();
    assign_stock_racks(&inventory, &context(), &job.label, &barcodes)
        .await
        .unwrap();
    apply_tube_moves(&inventory, &iso_label("S2", 1)).await.unwrap();
    let assigned = inventory.get_iso(&iso_label("S2", 1)).await.unwrap().unwrap();
    inventory.db().close().await;

    let inventory = SqliteInventory::open(&db_path).await.unwrap();
    let reloaded = inventory.get_iso(&iso_label("S2", 1)).await.unwrap().unwrap();
    assert_eq!(reloaded, assigned);
    let stock = &reloaded.stock_racks[0];
    assert_eq!(stock.barcode, "02000021");
    let tube = stock.layout.positions().next().unwrap();
    assert_eq!(tube.tube_barcode, tube_barcode(205201));
    assert_eq!(tube.origin.as_ref().unwrap().rack_barcode, SOURCE_RACK);
}
