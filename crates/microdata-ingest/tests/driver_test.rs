//! Driver behaviour against an in-memory sink
//!
//! Covers the commit cadence, failure scopes, header and positional layouts,
//! and dry runs through `run_ingestion` with a snapshot catalog.

mod common;

use common::{block_c_rows, catalog, init_test_tracing, write_csv, Failure, MemorySink};
use microdata_ingest::schema::CatalogSnapshot;
use microdata_ingest::{
    run_ingestion, CatalogSource, CellValue, FileStatus, IngestConfig, IngestError,
    IngestionDriver, PartitionPlan, ProgressHandle, RunOptions, SchemaCatalog, VariableDef,
    VariableType,
};

fn config(chunk_size: usize, commit_every: u64) -> IngestConfig {
    IngestConfig {
        chunk_size,
        commit_every,
        ..IngestConfig::default()
    }
}

fn driver(
    chunk_size: usize,
    commit_every: u64,
    plan: PartitionPlan,
    sink: MemorySink,
) -> IngestionDriver<MemorySink> {
    IngestionDriver::new(&config(chunk_size, commit_every), catalog(), plan, sink)
}

#[tokio::test]
async fn test_positional_rows_and_rejections() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let file = write_csv(dir.path(), "blkC.csv", "07,015,Acme Mills\n,015,Acme Mills\n");

    let mut driver = driver(100, 5, PartitionPlan::single_level("ASI_BLOCK_C"), MemorySink::new());
    let summary = driver.run(&[file]).await.unwrap();

    assert_eq!(summary.total_processed, 2);
    assert_eq!(summary.total_inserted, 1);
    assert_eq!(summary.total_skipped, 1);
    assert!(!summary.is_clean());
    assert_eq!(summary.files[0].status, FileStatus::Completed);

    let sink = driver.into_sink();
    assert_eq!(sink.identifiers(), vec!["7_15"]);
    let payload = &sink.committed[0].data_payload;
    assert_eq!(payload.get("STATE"), Some(&CellValue::Integer(7)));
    assert_eq!(payload.get("NAME"), Some(&CellValue::Text("Acme Mills".into())));
    assert_eq!(sink.committed[0].level_id, common::BLOCK_C_ID);
}

#[tokio::test]
async fn test_column_mismatch_aborts_only_that_file() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let good = write_csv(dir.path(), "a.csv", &block_c_rows(0, 10));
    // Good rows first: none of them may be written.
    let bad = write_csv(dir.path(), "b.csv", "9,1,ok\n9,2,ok\n9,3\n");
    let later = write_csv(dir.path(), "c.csv", &block_c_rows(500, 3));

    let mut driver = driver(2, 1, PartitionPlan::single_level("ASI_BLOCK_C"), MemorySink::new());
    let summary = driver.run(&[good, bad, later]).await.unwrap();

    assert_eq!(summary.files.len(), 3);
    assert_eq!(summary.files[0].inserted, 10);
    assert!(summary.files[1].is_aborted());
    assert_eq!(summary.files[1].inserted, 0);
    match &summary.files[1].status {
        FileStatus::Aborted { reason } => assert!(reason.contains("line 3"), "{}", reason),
        FileStatus::Completed => panic!("b.csv should be aborted"),
    }
    assert_eq!(summary.files[2].inserted, 3);
    assert_eq!(summary.total_inserted, 13);

    let sink = driver.into_sink();
    assert_eq!(sink.committed.len(), 13);
    assert!(!sink.identifiers().contains(&"9_1".to_string()));
}

#[tokio::test]
async fn test_transfer_failure_rolls_back_uncommitted_chunks() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let file = write_csv(dir.path(), "blkC.csv", &block_c_rows(0, 5));
    let other = write_csv(dir.path(), "more.csv", &block_c_rows(100, 2));

    // One row per chunk, commit every two: chunks 1-2 are durable, chunk 3 is
    // pending when chunk 4 fails.
    let sink = MemorySink::failing_at(4, Failure::Transfer);
    let mut driver = driver(1, 2, PartitionPlan::single_level("ASI_BLOCK_C"), sink);
    let progress = driver.progress();
    let summary = driver.run(&[file, other]).await.unwrap();

    let first = &summary.files[0];
    assert!(first.is_aborted());
    assert_eq!(first.inserted, 2);
    assert_eq!(first.chunks, 2);
    assert_eq!(first.processed, 4);

    assert_eq!(summary.files[1].status, FileStatus::Completed);
    assert_eq!(summary.total_inserted, 4);
    assert_eq!(progress.snapshot().inserted, 4);

    let sink = driver.into_sink();
    assert_eq!(sink.committed.len(), 4);
    assert_eq!(sink.rollbacks, 1);
}

#[tokio::test]
async fn test_connectivity_loss_aborts_run() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let first = write_csv(dir.path(), "a.csv", &block_c_rows(0, 3));
    let second = write_csv(dir.path(), "b.csv", &block_c_rows(10, 3));

    let sink = MemorySink::failing_at(1, Failure::Connectivity);
    let mut driver = driver(10, 5, PartitionPlan::single_level("ASI_BLOCK_C"), sink);
    let err = driver.run(&[first, second]).await.unwrap_err();

    assert!(matches!(err, IngestError::ConnectivityLoss(_)));
    let sink = driver.into_sink();
    assert_eq!(sink.applies, 1);
    assert!(sink.committed.is_empty());
}

#[tokio::test]
async fn test_unknown_level_fails_before_any_file_is_read() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_csv(dir.path(), "a.csv", &block_c_rows(0, 3));
    let second = write_csv(dir.path(), "b.csv", &block_c_rows(10, 3));

    let plan: PartitionPlan = toml::from_str(
        r#"
        default_level = "ASI_BLOCK_C"
        [files."b.csv"]
        level = "ASI_BLOCK_Z"
        "#,
    )
    .unwrap();

    let mut driver = driver(10, 5, plan, MemorySink::new());
    let err = driver.run(&[first, second]).await.unwrap_err();

    assert!(matches!(err, IngestError::LevelNotFound { .. }));
    assert_eq!(driver.into_sink().applies, 0);
}

#[tokio::test]
async fn test_commit_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_csv(dir.path(), "blkC.csv", &block_c_rows(0, 7));

    let mut driver = driver(2, 2, PartitionPlan::single_level("ASI_BLOCK_C"), MemorySink::new());
    let summary = driver.run(&[file]).await.unwrap();

    assert_eq!(summary.files[0].chunks, 4);
    assert_eq!(summary.total_inserted, 7);
    assert!(summary.is_clean());
    assert_eq!(driver.into_sink().commit_sizes, vec![4, 3]);
}

#[tokio::test]
async fn test_header_row_and_delimiter_from_plan() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_csv(
        dir.path(),
        "blkE202223.csv",
        "ASI 2022-23 Block E\nwages;DSL;workers;remarks\n1250.5;A01;12;x\n n/a ;A02;7.9;y\n0;;3;z\n",
    );

    let plan: PartitionPlan = toml::from_str(
        r#"
        default_level = "ASI_BLOCK_C"
        [files."BLKE202223.CSV"]
        level = "asi_block_e"
        header_row = 1
        delimiter = ";"
        "#,
    )
    .unwrap();

    let mut driver = driver(100, 5, plan, MemorySink::new());
    let summary = driver.run(&[file]).await.unwrap();

    let report = &summary.files[0];
    assert_eq!(report.level, "ASI_BLOCK_E");
    assert_eq!(report.processed, 3);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.degraded, 1);

    let sink = driver.into_sink();
    assert_eq!(sink.identifiers(), vec!["A01", "A02"]);
    let second = &sink.committed[1].data_payload;
    assert_eq!(second.get("WAGES"), Some(&CellValue::Text("n/a".into())));
    assert_eq!(second.get("WORKERS"), Some(&CellValue::Integer(7)));
    assert_eq!(second.get("REMARKS"), None);
}

#[tokio::test]
async fn test_reapplied_file_does_not_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_csv(dir.path(), "blkC.csv", &block_c_rows(0, 4));

    let mut driver = driver(3, 1, PartitionPlan::single_level("ASI_BLOCK_C"), MemorySink::new());
    let first = driver.run(&[file.clone()]).await.unwrap();
    let second = driver.run(&[file]).await.unwrap();

    assert_eq!(first.total_inserted, 4);
    assert_eq!(second.total_processed, 4);
    assert_eq!(second.total_inserted, 0);
    assert_eq!(driver.into_sink().committed.len(), 4);
}

#[tokio::test]
async fn test_dry_run_with_snapshot_catalog() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    write_csv(&data, "b.csv", &block_c_rows(0, 3));
    write_csv(&data, "a.CSV", "07,015,Acme\n07,,Acme\n");
    write_csv(&data, "readme.txt", "not data");

    let snapshot = CatalogSnapshot {
        survey_id: common::SURVEY_ID,
        levels: vec![common::block_c(), common::block_e()],
    };
    let snapshot_path = dir.path().join("catalog.json");
    std::fs::write(&snapshot_path, serde_json::to_string(&snapshot).unwrap()).unwrap();

    let progress = ProgressHandle::new();
    let options = RunOptions {
        inputs: vec![data],
        plan: PartitionPlan::single_level("ASI_BLOCK_C"),
        catalog: CatalogSource::Snapshot(snapshot_path),
        dry_run: true,
        progress: progress.clone(),
    };

    let summary = run_ingestion(&IngestConfig::default(), options).await.unwrap();

    let names: Vec<String> = summary
        .files
        .iter()
        .map(|f| f.file.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["a.CSV", "b.csv"]);
    assert_eq!(summary.total_processed, 5);
    assert_eq!(summary.total_inserted, 4);
    assert_eq!(summary.total_skipped, 1);

    let live = progress.snapshot();
    assert_eq!(live.files_done, 2);
    assert_eq!(live.processed, 5);
    assert_eq!(live.current_file, None);
}

#[tokio::test]
async fn test_invalid_utf8_cell_does_not_abort_file() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("blkC.csv");
    std::fs::write(&file, b"07,015,Acme\n07,016,Mill\xff\n08,\xff1,Works\n".as_slice()).unwrap();

    let mut driver = driver(100, 5, PartitionPlan::single_level("ASI_BLOCK_C"), MemorySink::new());
    let summary = driver.run(&[file]).await.unwrap();

    let report = &summary.files[0];
    assert_eq!(report.status, FileStatus::Completed);
    assert_eq!(report.processed, 3);
    assert_eq!(report.inserted, 3);
    assert_eq!(report.degraded, 2);

    let sink = driver.into_sink();
    assert_eq!(sink.identifiers(), vec!["7_15", "7_16", "8_\u{fffd}1"]);
    assert_eq!(
        sink.committed[1].data_payload.get("NAME"),
        Some(&CellValue::Text("Mill\u{fffd}".into()))
    );
}

#[tokio::test]
async fn test_invalid_unreferenced_level_does_not_block_run() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_csv(dir.path(), "blkC.csv", &block_c_rows(0, 3));

    // Duplicate variable names, as a broken extraction could produce.
    let mut block_j = common::block_c();
    block_j.level_id = 9;
    block_j.level_name = "ASI_BLOCK_J".to_string();
    block_j.variables.push(VariableDef::new("dsl", VariableType::Text, false));
    block_j.variables.push(VariableDef::new("DSL", VariableType::Text, false));
    let catalog =
        SchemaCatalog::from_levels(common::SURVEY_ID, vec![common::block_c(), block_j]).unwrap();

    let mut ok = IngestionDriver::new(
        &config(10, 5),
        catalog.clone(),
        PartitionPlan::single_level("ASI_BLOCK_C"),
        MemorySink::new(),
    );
    let summary = ok.run(&[file.clone()]).await.unwrap();
    assert_eq!(summary.total_inserted, 3);

    let mut bad = IngestionDriver::new(
        &config(10, 5),
        catalog,
        PartitionPlan::single_level("ASI_BLOCK_J"),
        MemorySink::new(),
    );
    let err = bad.run(&[file]).await.unwrap_err();
    assert!(matches!(err, IngestError::InvalidSchema { .. }));
    assert_eq!(bad.into_sink().applies, 0);
}
