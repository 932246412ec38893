//! Planning tests per scenario: request layout → plan → processing series

mod helpers;

use helpers::*;
use isoprep_common::labels::{EntityKind, RackMarker, RackRole};
use isoprep_common::Pipettor;
use isoprep_lab::model::{
    LibraryPlate, LibraryReference, ProcessingOrder, RackPosition, RackShape, RequestPosition, Scenario,
};
use isoprep_lab::planner;
use isoprep_lab::worklists::{PlannedTransfer, TransferType};
use isoprep_lab::LabError;

fn prep() -> RackMarker {
    RackMarker::new(RackRole::IsoPrep)
}

/// Columns 2, 4, 6, 8 and 10 of one row, one pool each
fn pool_row(row: char, concentration: f64) -> Vec<RequestPosition> {
    POOLS
        .iter()
        .enumerate()
        .map(|(i, &pool)| fixed(&format!("{}{}", row, 2 * i + 2), pool, 2.0, concentration))
        .collect()
}

#[test]
fn test_order_only_delivers_stock_into_final_plate() {
    let request = request("T1", Scenario::OrderOnly, RackShape::Wells96, pool_row('B', 50000.0));
    let draft = draft(&request, 1);
    let plan = &draft.job.plan;

    assert_eq!(plan.processing_order, ProcessingOrder::NoJob);
    assert!(plan.prep_plates.is_empty());
    assert!(draft.job.processing_series.is_empty());
    assert_eq!(plan.stock_racks.len(), 1);
    assert_eq!(plan.stock_racks[0].marker, RackMarker::stock(1));
    assert_eq!(plan.stock_racks[0].owner, EntityKind::Iso);
    assert_eq!(plan.stock_racks[0].sector, None);

    for label in ["B2", "B4", "B6", "B8", "B10"] {
        let well = plan.final_layout.get(pos(label)).unwrap();
        assert_eq!(well.base.volume, 2.0);
        assert_eq!(well.base.concentration, Some(50000.0));
        assert_eq!(well.base.stock_rack_marker, Some(RackMarker::stock(1)));
    }

    let iso = &draft.isos[0];
    assert_eq!(iso.label.to_string(), "T1_iso_01");
    assert_eq!(iso.final_plates.len(), 1);
    assert_eq!(iso.final_plates[0].barcode, "T1_iso_01_a");
}

#[test]
fn test_optimization_dilutes_through_preparation_plate() {
    // B row at stock concentration, D row one fivefold step below
    let mut positions = pool_row('B', 50000.0);
    positions.extend(pool_row('D', 10000.0));
    let request = request("T2", Scenario::Optimization, RackShape::Wells96, positions);
    let draft = draft(&request, 1);
    let plan = &draft.job.plan;

    assert_eq!(plan.prep_plates.len(), 1);
    let plate = plan.prep_plate(prep()).unwrap();
    assert_eq!(plate.layout.len(), 5);
    for label in ["D2", "D4", "D6", "D8", "D10"] {
        let well = plate.layout.get(pos(label)).unwrap();
        assert_eq!(well.base.volume, 7.0);
        assert_eq!(well.base.concentration, Some(10000.0));
        assert_eq!(well.base.stock_rack_marker, Some(RackMarker::stock(1)));
    }
    // the B row comes straight from stock
    let direct = plan.final_layout.get(pos("B2")).unwrap();
    assert_eq!(direct.base.stock_rack_marker, Some(RackMarker::stock(1)));

    // no final well needs buffer: slot 2 (a_buffer) stays empty
    let series = &draft.job.processing_series;
    assert_eq!(series.labels(), vec!["T2_1_p_buffer", "T2_3_p_to_a"]);
    assert!(series.get(1).is_none());
    let to_final = series.get(2).unwrap();
    assert_eq!(to_final.pipettor, Pipettor::Biomek);
    assert_eq!(to_final.transfers.len(), 5);
    assert!(to_final.transfers.iter().all(|t| t.volume() == 2.0));
}

#[test]
fn test_optimization_dilution_inside_final_plate_uses_aliquot_buffer() {
    // D2 at a fifth of B2 is diluted from B2 on the final plate
    let request = request(
        "T2",
        Scenario::Optimization,
        RackShape::Wells96,
        vec![
            fixed("B2", 205201, 10.0, 10000.0),
            fixed("D2", 205201, 10.0, 2000.0),
        ],
    );
    let draft = draft(&request, 1);
    let plan = &draft.job.plan;

    let donor = plan.final_layout.get(pos("B2")).unwrap();
    assert_eq!(donor.base.volume, 12.0);
    assert_eq!(donor.base.transfer_targets.len(), 1);
    let prep_well = plan.prep_plate(prep()).unwrap().layout.get(pos("B2")).unwrap();
    assert_eq!(prep_well.base.volume, 17.0);

    let series = &draft.job.processing_series;
    assert_eq!(
        series.labels(),
        vec!["T2_1_p_buffer", "T2_2_a_buffer", "T2_3_p_to_a", "T2_4_a_to_a"]
    );
    let aliquot_buffer = series.get(1).unwrap();
    assert_eq!(aliquot_buffer.transfers, vec![PlannedTransfer::dilution(pos("D2"), 8.0)]);
    let intra = series.get(3).unwrap();
    assert!(intra.transfers.iter().all(|t| t.volume() == 2.0));
}

#[test]
fn test_optimization_rejects_concentration_above_stock() {
    let request = request(
        "T2",
        Scenario::Optimization,
        RackShape::Wells96,
        vec![fixed("B2", 205201, 2.0, 60000.0)],
    );
    let err = planner::plan(&request, &context()).unwrap_err();
    assert!(
        matches!(err, LabError::ConcentrationExceedsStock { .. }),
        "unexpected error: {:?}",
        err
    );
}

#[test]
fn test_screening_groups_sectors_and_uses_quadrant_transfers() {
    // floatings in sectors 0 and 1, job controls in sectors 2 and 3, one quadrant of mocks
    let quadrants = [RackPosition::new(0, 0), RackPosition::new(0, 1)];
    let mut positions = Vec::new();
    for (i, &quadrant) in quadrants.iter().enumerate() {
        let placeholder = i as u32 * 2;
        positions.push(floating_at(RackPosition::from_quadrant(quadrant, 0), placeholder + 1, 10.0, 50.0));
        positions.push(floating_at(RackPosition::from_quadrant(quadrant, 1), placeholder + 2, 10.0, 50.0));
        positions.push(fixed_at(RackPosition::from_quadrant(quadrant, 2), POOLS[i], 10.0, 50.0));
        positions.push(fixed_at(RackPosition::from_quadrant(quadrant, 3), POOLS[i], 10.0, 50.0));
    }
    for sector in 0..4 {
        positions.push(mock_at(RackPosition::from_quadrant(RackPosition::new(1, 0), sector), 10.0));
    }
    let mut request = with_pool_set(
        request("T3", Scenario::Screening, RackShape::Wells384, positions),
        &FLOATING_POOLS,
    );
    request.process_job_first = true;

    let draft = draft(&request, 1);
    let plan = &draft.job.plan;

    assert_eq!(plan.processing_order, ProcessingOrder::JobFirst);
    assert!(plan.uses_sector_transfers());
    // floatings match any reagent, so the controls join their group
    assert_eq!(plan.sector_groups, vec![vec![0, 1, 2, 3]]);
    assert_eq!(plan.aliquot_dilution_factor, 10);
    assert_eq!(plan.prep_plates.len(), 1);

    let racks: Vec<(RackMarker, EntityKind, Option<u8>)> =
        plan.stock_racks.iter().map(|r| (r.marker, r.owner, r.sector)).collect();
    assert_eq!(
        racks,
        vec![
            (RackMarker::stock(1), EntityKind::Job, None),
            (RackMarker::stock(2), EntityKind::Iso, Some(0)),
            (RackMarker::stock(3), EntityKind::Iso, Some(1))
        ]
    );

    let to_final = draft
        .job
        .processing_series
        .iter()
        .find(|w| w.source == Some(prep()) && w.target == RackMarker::final_plate())
        .unwrap();
    assert_eq!(to_final.pipettor, Pipettor::CyBio);
    assert_eq!(to_final.transfer_type, TransferType::RackSampleTransfer);
    assert_eq!(to_final.transfers.len(), 4);

    // each ISO binds its own floating pools
    let bound: Vec<_> = draft.isos[0].floating_bindings.values().copied().collect();
    assert_eq!(bound.len(), 4);
    assert!(bound.iter().all(Option::is_some));
}

#[test]
fn test_screening_dilution_series_between_sectors() {
    // sector 0 at 100 nM feeds sector 2 at 50 nM
    let mut positions = Vec::new();
    for (column, placeholder) in [(0u8, 1u32), (1, 2)] {
        let quadrant = RackPosition::new(0, column);
        positions.push(floating_at(RackPosition::from_quadrant(quadrant, 0), placeholder, 10.0, 100.0));
        positions.push(floating_at(RackPosition::from_quadrant(quadrant, 2), placeholder, 10.0, 50.0));
    }
    let request = with_pool_set(
        request("T4", Scenario::Screening, RackShape::Wells384, positions),
        &FLOATING_POOLS[..2],
    );

    let draft = draft(&request, 1);
    let plan = &draft.job.plan;
    assert_eq!(plan.processing_order, ProcessingOrder::NoJob);
    assert_eq!(plan.aliquot_dilution_factor, 5);
    assert_eq!(plan.sector_groups, vec![vec![0, 2]]);

    let plate = plan.prep_plate(prep()).unwrap();
    let root = plate.layout.get(RackPosition::from_quadrant(RackPosition::new(0, 0), 0)).unwrap();
    let child = plate.layout.get(RackPosition::from_quadrant(RackPosition::new(0, 0), 2)).unwrap();
    assert_eq!(root.base.volume, 100.0);
    assert_eq!(root.base.concentration, Some(500.0));
    assert_eq!(child.base.volume, 7.0);
    assert_eq!(child.base.concentration, Some(250.0));

    let series = &draft.job.processing_series;
    assert_eq!(
        series.labels(),
        vec!["T4_1_p_buffer", "T4_2_a_buffer", "T4_3_p_to_p", "T4_4_p_to_a"]
    );
    let intra = series.get(2).unwrap();
    assert_eq!(
        intra.transfers,
        vec![PlannedTransfer::RackSampleTransfer {
            source_sector: 0,
            target_sector: 2,
            number_sectors: 4,
            volume: 3.5
        }]
    );
    let to_final = series.get(3).unwrap();
    assert_eq!(to_final.transfer_type, TransferType::RackSampleTransfer);
    assert!(to_final.transfers.iter().all(|t| t.volume() == 2.0));
}

#[test]
fn test_library_controls_prepared_by_job() {
    let mut request = request(
        "T5",
        Scenario::Library,
        RackShape::Wells96,
        vec![
            library_well("A1"),
            library_well("A3"),
            fixed("B2", 205201, 4.0, 1270.0),
            fixed("D2", 330001, 4.0, 1270.0),
            fixed("F2", 1056000, 4.0, 1270.0),
            mock("H2", 4.0),
        ],
    );
    request.isos_per_job = 2;
    request.library = Some(LibraryReference {
        name: "testlib".to_string(),
        plates: vec![
            LibraryPlate::from_label("08000002", "testlib_l2_r2").unwrap(),
            LibraryPlate::from_label("08000001", "testlib_l1_r2").unwrap(),
        ],
    });

    let draft = draft(&request, 2);
    let plan = &draft.job.plan;
    assert_eq!(plan.processing_order, ProcessingOrder::NoIso);
    assert_eq!(plan.prep_plates.len(), 1);
    assert_eq!(plan.prep_plates[0].marker, RackMarker::new(RackRole::JobPrep));
    assert_eq!(plan.stock_racks.len(), 1);
    assert_eq!(plan.stock_racks[0].owner, EntityKind::Job);

    for label in ["B2", "D2", "F2"] {
        let control = plan.prep_plates[0].layout.get(pos(label)).unwrap();
        assert_eq!(control.base.volume, 39.4);
        assert_eq!(control.base.concentration, Some(1270.0));
    }
    let mock = plan.prep_plates[0].layout.get(pos("H2")).unwrap();
    assert!(mock.base.volume >= 8.0);

    assert_eq!(draft.job.processing_series.labels(), vec!["T5_1_jp_buffer", "T5_3_jp_to_a"]);
    assert_eq!(draft.job.prep_plates[0].label, "T5_job_01_jp");

    // one library layout per ISO, in layout order
    assert_eq!(draft.isos.len(), 2);
    assert_eq!(draft.isos[0].final_plates[0].barcode, "08000001");
    assert_eq!(draft.isos[1].final_plates[0].barcode, "08000002");
    assert!(draft.isos.iter().all(|iso| iso.prep_plates.is_empty()));
}

#[test]
fn test_library_plates_exhausted() {
    let mut request = request(
        "T5",
        Scenario::Library,
        RackShape::Wells96,
        vec![library_well("A1"), fixed("B2", 205201, 4.0, 1270.0)],
    );
    request.library = Some(LibraryReference {
        name: "testlib".to_string(),
        plates: vec![LibraryPlate::from_label("08000001", "testlib_l1_r1").unwrap()],
    });

    let context = context();
    let plan = planner::plan(&request, &context).unwrap();
    let series = isoprep_lab::worklists::generate_processing_series(&plan, &context).unwrap();
    let batch = planner::IsoBatch {
        count: 2,
        ..planner::IsoBatch::default()
    };
    let err = planner::build_isos(&plan, series, &[], &Default::default(), &batch).unwrap_err();
    assert!(matches!(
        err,
        LabError::LibraryPlatesExhausted {
            required: 2,
            available: 1
        }
    ));
}
