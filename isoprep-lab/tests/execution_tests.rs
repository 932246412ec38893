//! End-to-end tests: plan → register → assign → pick → print / execute

mod helpers;

use helpers::*;
use isoprep_common::config::MachineConstants;
use isoprep_lab::executor::{execute, print_worklists};
use isoprep_lab::model::{
    IsoStatus, LibraryPlate, LibraryReference, Rack, RackShape, Sample, Scenario,
};
use isoprep_lab::repository::{EntityRepository, RackRepository};
use isoprep_lab::stock::{apply_tube_moves, assign_stock_racks, StockRackBarcodes};
use isoprep_lab::{Context, LabError};
use tokio_util::sync::CancellationToken;

const USER: &str = "lab_user";

fn order_only(ticket: &str) -> isoprep_lab::model::IsoRequest {
    request(
        ticket,
        Scenario::OrderOnly,
        RackShape::Wells96,
        vec![
            fixed("B2", 205201, 2.0, 50000.0),
            fixed("B4", 330001, 2.0, 50000.0),
            fixed("B6", 333803, 2.0, 50000.0),
            fixed("B8", 1056000, 2.0, 50000.0),
            fixed("B10", 180005, 2.0, 50000.0),
        ],
    )
}

async fn entity_context(inventory: &isoprep_lab::repository::MemoryInventory, ticket: &str) -> Context {
    Context::for_entity(inventory, &iso_label(ticket, 1), MachineConstants::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_order_only_full_flow() {
    let inventory = inventory().await;
    let request = order_only("T1");
    prepared_job(&inventory, &request, 1, &[("T1_iso_01_s#1", "02000001")]).await;

    // Assignment: one ISO stock rack pouring into the final plate
    let iso = inventory.get_iso(&iso_label("T1", 1)).await.unwrap().unwrap();
    assert_eq!(iso.stock_racks.len(), 1);
    let stock = &iso.stock_racks[0];
    assert_eq!(stock.label, "T1_iso_01_s#1");
    assert_eq!(stock.barcode, "02000001");
    assert_eq!(stock.series.labels(), vec!["T1_1_s#1_to_a"]);
    let worklist = stock.series.get(0).unwrap();
    assert_eq!(worklist.transfers.len(), 5);
    assert!(worklist.transfers.iter().all(|t| t.volume() == 2.0));

    // Picking moved the tubes out of the storage rack
    let rack = inventory.get_rack("02000001").await.unwrap().unwrap();
    assert!(rack.tube_position(&tube_barcode(205201)).is_some());
    let source = inventory.get_rack(SOURCE_RACK).await.unwrap().unwrap();
    assert!(source.tube_position(&tube_barcode(205201)).is_none());

    // Printing leaves the inventory untouched
    let context = entity_context(&inventory, "T1").await;
    let bundle = print_worklists(&inventory, &context, &iso_label("T1", 1)).await.unwrap();
    assert!(bundle.names().contains(&"T1_iso_01_instructions.txt"));
    let csv = bundle.member("T1_iso_01_1_s#1_to_a.csv").unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 6);
    assert!(lines[1].starts_with("02000001,"));
    let instructions = bundle.member("T1_iso_01_instructions.txt").unwrap();
    assert!(instructions.contains("No job processing required."));
    assert!(inventory.executed_worklists().await.is_empty());

    // Execution
    let cancel = CancellationToken::new();
    let report = execute(&inventory, &context, &iso_label("T1", 1), USER, &cancel)
        .await
        .unwrap();
    assert_eq!(report.status, IsoStatus::Done);
    assert_eq!(report.worklists, vec!["T1_1_s#1_to_a"]);

    let plate = inventory.get_rack("T1_iso_01_a").await.unwrap().unwrap();
    let sample = plate.sample(pos("B2")).unwrap();
    assert_eq!(sample.pool, Some(205201));
    assert_eq!(sample.volume, 2.0);
    assert_eq!(sample.concentration, Some(50000.0));

    let rack = inventory.get_rack("02000001").await.unwrap().unwrap();
    let tube = rack.tube_position(&tube_barcode(205201)).unwrap();
    assert_eq!(rack.sample(tube).unwrap().volume, TUBE_VOLUME - 2.0);

    let iso = inventory.get_iso(&iso_label("T1", 1)).await.unwrap().unwrap();
    assert_eq!(iso.status, IsoStatus::Done);
    let executed = inventory.executed_worklists().await;
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].user, USER);
    assert_eq!(executed[0].target_rack, "T1_iso_01_a");

    // A finished ISO cannot run again
    let err = execute(&inventory, &context, &iso_label("T1", 1), USER, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LabError::UnexpectedStatus {
            found: IsoStatus::Done,
            expected: IsoStatus::Queued,
            ..
        }
    ));
}

#[tokio::test]
async fn test_missing_stock_tube_blocks_execution() {
    let inventory = inventory().await;
    let request = order_only("T6");
    prepared_job(&inventory, &request, 1, &[("T6_iso_01_s#1", "02000006")]).await;

    // Someone takes a tube back out of the stock rack
    let mut rack = inventory.get_rack("02000006").await.unwrap().unwrap();
    let position = rack.tube_position(&tube_barcode(330001)).unwrap();
    rack.remove_tube(position);
    inventory.save_rack(&rack).await.unwrap();

    let context = entity_context(&inventory, "T6").await;
    let err = execute(&inventory, &context, &iso_label("T6", 1), USER, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, LabError::TubeNotFound { pool: 330001 }),
        "unexpected error: {:?}",
        err
    );

    let iso = inventory.get_iso(&iso_label("T6", 1)).await.unwrap().unwrap();
    assert_eq!(iso.status, IsoStatus::Queued);
    assert!(inventory.executed_worklists().await.is_empty());
    let plate = inventory.get_rack("T6_iso_01_a").await.unwrap().unwrap();
    assert!(plate.is_empty());
}

#[tokio::test]
async fn test_execution_requires_user() {
    let inventory = inventory().await;
    let request = order_only("T7");
    prepared_job(&inventory, &request, 1, &[("T7_iso_01_s#1", "02000007")]).await;

    let context = entity_context(&inventory, "T7").await;
    let err = execute(&inventory, &context, &iso_label("T7", 1), "  ", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::MissingUser));
}

#[tokio::test]
async fn test_cancelled_execution_writes_nothing() {
    let inventory = inventory().await;
    let request = order_only("T8");
    prepared_job(&inventory, &request, 1, &[("T8_iso_01_s#1", "02000008")]).await;

    let context = entity_context(&inventory, "T8").await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = execute(&inventory, &context, &iso_label("T8", 1), USER, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::Cancelled));

    let iso = inventory.get_iso(&iso_label("T8", 1)).await.unwrap().unwrap();
    assert_eq!(iso.status, IsoStatus::Queued);
    let plate = inventory.get_rack("T8_iso_01_a").await.unwrap().unwrap();
    assert!(plate.is_empty());
}

/// Job stored without registering its plates
async fn unregistered_plates(inventory: &isoprep_lab::repository::MemoryInventory, ticket: &str, barcode: &str) {
    let request = order_only(ticket);
    let draft = draft(&request, 1);
    inventory.save_job(&draft.job, &draft.isos).await.unwrap();
    let barcodes: StockRackBarcodes = [(format!("{}_iso_01_s#1", ticket), barcode.to_string())]
        .into_iter()
        .collect();
    assign_stock_racks(inventory, &context(), &draft.job.label, &barcodes)
        .await
        .unwrap();
    apply_tube_moves(inventory, &iso_label(ticket, 1)).await.unwrap();
}

#[tokio::test]
async fn test_missing_plate_is_stored_only_by_committed_execution() {
    let inventory = inventory().await;
    unregistered_plates(&inventory, "T9", "02000009").await;
    let context = entity_context(&inventory, "T9").await;

    print_worklists(&inventory, &context, &iso_label("T9", 1)).await.unwrap();
    assert!(inventory.get_rack("T9_iso_01_a").await.unwrap().is_none());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = execute(&inventory, &context, &iso_label("T9", 1), USER, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::Cancelled));
    assert!(inventory.get_rack("T9_iso_01_a").await.unwrap().is_none());

    let report = execute(&inventory, &context, &iso_label("T9", 1), USER, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, IsoStatus::Done);
    let plate = inventory.get_rack("T9_iso_01_a").await.unwrap().unwrap();
    assert_eq!(plate.label, "T9_iso_01_a");
    let well = plate.sample(pos("B10")).unwrap();
    assert_eq!(well.pool, Some(180005));
    assert_eq!(well.volume, 2.0);
}

#[tokio::test]
async fn test_failed_verification_leaves_missing_plate_unstored() {
    let inventory = inventory().await;
    unregistered_plates(&inventory, "T10", "02000010").await;

    let mut stock = inventory.get_rack("02000010").await.unwrap().unwrap();
    let position = stock.tube_position(&tube_barcode(330001)).unwrap();
    stock.remove_tube(position);
    inventory.save_rack(&stock).await.unwrap();

    let context = entity_context(&inventory, "T10").await;
    let err = execute(&inventory, &context, &iso_label("T10", 1), USER, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::TubeNotFound { pool: 330001 }));
    assert!(inventory.get_rack("T10_iso_01_a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_optimization_execution_dilutes_samples() {
    let inventory = inventory().await;
    let request = request(
        "T2",
        Scenario::Optimization,
        RackShape::Wells96,
        vec![
            fixed("B2", 205201, 2.0, 10000.0),
            fixed("D2", 330001, 2.0, 10000.0),
        ],
    );
    prepared_job(&inventory, &request, 1, &[("T2_iso_01_s#1", "02000002")]).await;

    let context = entity_context(&inventory, "T2").await;
    let bundle = print_worklists(&inventory, &context, &iso_label("T2", 1)).await.unwrap();
    let buffer = bundle.member("T2_iso_01_buffer.csv").unwrap();
    assert!(buffer.lines().any(|l| l == "T2_1_p_buffer,T2_iso_01_p,B2,5.6,annealing buffer"));

    let report = execute(&inventory, &context, &iso_label("T2", 1), USER, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.worklists, vec!["T2_1_p_buffer", "T2_1_s#1_to_p", "T2_3_p_to_a"]);
    assert_eq!(report.status, IsoStatus::Done);

    let prep = inventory.get_rack("T2_iso_01_p").await.unwrap().unwrap();
    assert_eq!(prep.sample(pos("B2")).unwrap().volume, 5.0);

    let plate = inventory.get_rack("T2_iso_01_a").await.unwrap().unwrap();
    for (label, pool) in [("B2", 205201), ("D2", 330001)] {
        let sample = plate.sample(pos(label)).unwrap();
        assert_eq!(sample.pool, Some(pool));
        assert_eq!(sample.volume, 2.0);
        assert!((sample.concentration.unwrap() - 10000.0).abs() < 1e-6);
    }
}

#[tokio::test]
async fn test_library_job_fills_library_plates() {
    let inventory = inventory().await;
    let mut request = request(
        "T5",
        Scenario::Library,
        RackShape::Wells96,
        vec![
            library_well("A1"),
            library_well("A3"),
            fixed("B2", 205201, 4.0, 1270.0),
            fixed("D2", 330001, 4.0, 1270.0),
            mock("F2", 4.0),
        ],
    );
    request.isos_per_job = 2;
    let plates = [("08000001", "testlib_l1_r1"), ("08000002", "testlib_l2_r1")];
    request.library = Some(LibraryReference {
        name: "testlib".to_string(),
        plates: plates
            .iter()
            .map(|(barcode, label)| LibraryPlate::from_label(*barcode, label).unwrap())
            .collect(),
    });
    for (barcode, label) in plates {
        let mut plate = Rack::plate(barcode, label, RackShape::Wells96, "standard 96");
        for well in ["A1", "A3"] {
            *plate.sample_mut(pos(well)) = Some(Sample::new(999001, 4.0, 500.0));
        }
        inventory.save_rack(&plate).await.unwrap();
    }
    prepared_job(&inventory, &request, 2, &[("T5_job_01_s#1", "02000005")]).await;

    let job = job_label("T5");
    let context = Context::for_entity(&inventory, &job, MachineConstants::default())
        .await
        .unwrap();

    // ISOs of a library job have no phase of their own
    let err = execute(&inventory, &context, &iso_label("T5", 1), USER, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::InvalidRequest(_)));

    let report = execute(&inventory, &context, &job, USER, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, IsoStatus::Done);
    // one preparation for both ISOs, one transfer per library plate
    assert_eq!(
        report.worklists,
        vec!["T5_1_jp_buffer", "T5_1_s#1_to_jp", "T5_3_jp_to_a", "T5_3_jp_to_a"]
    );

    for (barcode, _) in plates {
        let plate = inventory.get_rack(barcode).await.unwrap().unwrap();
        let control = plate.sample(pos("B2")).unwrap();
        assert_eq!(control.pool, Some(205201));
        assert_eq!(control.volume, 4.0);
        assert!((control.concentration.unwrap() - 1270.0).abs() < 2.0);
        let mock = plate.sample(pos("F2")).unwrap();
        assert_eq!(mock.pool, None);
        assert_eq!(mock.volume, 4.0);
        assert_eq!(plate.sample(pos("A1")).unwrap().pool, Some(999001));
    }
    for number in [1, 2] {
        let iso = inventory.get_iso(&iso_label("T5", number)).await.unwrap().unwrap();
        assert_eq!(iso.status, IsoStatus::Done);
    }
}

#[tokio::test]
async fn test_missing_library_plate_is_reported() {
    let inventory = inventory().await;
    let mut request = request(
        "T9",
        Scenario::Library,
        RackShape::Wells96,
        vec![library_well("A1"), fixed("B2", 205201, 4.0, 1270.0)],
    );
    request.library = Some(LibraryReference {
        name: "testlib".to_string(),
        plates: vec![LibraryPlate::from_label("08000009", "testlib_l1_r1").unwrap()],
    });
    prepared_job(&inventory, &request, 1, &[("T9_job_01_s#1", "02000009")]).await;

    let job = job_label("T9");
    let context = Context::for_entity(&inventory, &job, MachineConstants::default())
        .await
        .unwrap();
    let err = execute(&inventory, &context, &job, USER, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::UnknownLabel(ref barcode) if barcode == "08000009"));
}
