use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fare_core::{CanonicalTable, ReportBatch, Week};
use fare_publish::{LocalFileRepository, TableRepository};
use fare_reports::{parse_report, ReportError, ReportFetcher, ReportSource};
use fare_storage::TableStore;
use fare_sync::{bootstrap, bulk_load, BootstrapStatus, BulkLoadError, CycleStatus, UpdatePipeline};
use tempfile::tempdir;

const BASE: &str = "http://fixtures.test/fares";

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn week(s: &str) -> Week {
    s.parse().expect("week")
}

/// Serves `fixtures/remote/<file name>` for any remote address.
struct FixtureFetcher;

#[async_trait]
impl ReportFetcher for FixtureFetcher {
    async fn fetch(&self, address: &str) -> Result<ReportBatch, ReportError> {
        let source = ReportSource::classify(address)?;
        let name = address.rsplit('/').next().unwrap_or_default();
        match std::fs::read(fixtures().join("remote").join(name)) {
            Ok(bytes) => parse_report(&source, &bytes),
            Err(err) => Err(ReportError::Retrieval {
                address: address.to_string(),
                source: err.into(),
            }),
        }
    }
}

#[tokio::test]
async fn backfill_directory_loads_in_week_order() {
    let loaded = bulk_load(&fixtures().join("backfill")).await.expect("bulk load");

    assert_eq!(loaded.files.len(), 3);
    assert!(loaded.skipped.is_empty());
    let weeks: Vec<Week> = loaded.table.weeks().collect();
    assert_eq!(weeks, vec![week("2023-05-26"), week("2023-06-02"), week("2023-06-09")]);
    assert_eq!(loaded.table.len(), 9);
    assert_eq!(
        loaded.table.categories(),
        ["FF", "SEN/DIS", "7-D AFAS UNL", "OMNY"]
    );

    let stations = loaded.table.stations();
    assert!(stations.contains("WHITEHALL STREET"));
    assert!(stations.contains("CYPRESS HILLS"));
    assert_eq!(stations.len(), 3);

    let cypress_0602 = loaded
        .table
        .week_rows(week("2023-06-02"))
        .find(|r| r.station_id == "CYPRESS HILLS")
        .expect("row");
    assert_eq!(cypress_0602.counts.get("FF"), Some(&998));
    assert_eq!(cypress_0602.counts.get("7-D AFAS UNL"), None);
    assert_eq!(cypress_0602.counts.get("OMNY"), None);
}

#[tokio::test]
async fn week_stamp_orders_files_not_their_names() {
    let dir = tempdir().expect("tempdir");
    for (name, copy) in [
        ("230609.csv", "a_230609.csv"),
        ("230526.csv", "b_230526.csv"),
        ("230602.csv", "c_230602.csv"),
    ] {
        std::fs::copy(fixtures().join("backfill").join(name), dir.path().join(copy)).expect("copy");
    }

    let loaded = bulk_load(dir.path()).await.expect("bulk load");
    let names: Vec<String> = loaded
        .files
        .iter()
        .filter_map(|f| f.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, ["b_230526.csv", "c_230602.csv", "a_230609.csv"]);
    assert_eq!(loaded.table.max_week(), Some(week("2023-06-09")));
    assert!(loaded.table.rows().windows(2).all(|p| p[0].week <= p[1].week));
}

#[tokio::test]
async fn bad_backfill_file_is_named_in_the_error() {
    let dir = tempdir().expect("tempdir");
    for name in ["230526.csv", "230602.csv"] {
        std::fs::copy(fixtures().join("backfill").join(name), dir.path().join(name)).expect("copy");
    }
    std::fs::write(dir.path().join("notes.txt"), "not a report").expect("write");
    std::fs::write(dir.path().join(".230519.csv"), "ignored").expect("write");
    std::fs::write(
        dir.path().join("230609.csv"),
        "REMOTE,STATION,FF\nR001,WHITEHALL STREET,lots\n",
    )
    .expect("write");

    let err = bulk_load(dir.path()).await.unwrap_err();
    assert!(matches!(err, BulkLoadError::Report { .. }));
    assert_eq!(err.file(), Some(dir.path().join("230609.csv").as_path()));
    assert!(err.to_string().contains("230609.csv"));
}

#[tokio::test]
async fn unstamped_backfill_file_is_rejected() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("latest.csv"), "REMOTE,STATION,FF\nR001,A,1\n").expect("write");

    let err = bulk_load(dir.path()).await.unwrap_err();
    assert!(matches!(err, BulkLoadError::Unstamped { .. }));
}

#[tokio::test]
async fn bootstrap_then_weekly_cycle_against_local_table() {
    let dir = tempdir().expect("tempdir");
    let table_path = dir.path().join("data").join("main.csv");
    let now = Utc.with_ymd_and_hms(2023, 7, 1, 6, 0, 0).single().expect("ts");

    let repository = LocalFileRepository::new(TableStore::new(&table_path));
    let status = bootstrap(&repository, &fixtures().join("backfill"), now)
        .await
        .expect("bootstrap");
    assert!(matches!(status, BootstrapStatus::Published { files: 3, rows: 9, .. }));

    let again = bootstrap(&repository, &fixtures().join("backfill"), now)
        .await
        .expect("second bootstrap");
    assert!(matches!(again, BootstrapStatus::AlreadyPresent { rows: 9, .. }));

    let pipeline = UpdatePipeline::new(
        Box::new(LocalFileRepository::new(TableStore::new(&table_path))),
        Box::new(FixtureFetcher),
        BASE,
    );
    let report = pipeline.run_cycle(now).await.expect("cycle");
    assert_eq!(report.location.address, format!("{BASE}/fares_230630.csv"));
    assert!(matches!(
        report.status,
        CycleStatus::Published { week: w, appended: 3, .. } if w == week("2023-06-16")
    ));

    let bytes = std::fs::read(&table_path).expect("read table");
    let table = CanonicalTable::read_csv(bytes.as_slice()).expect("parse table");
    assert_eq!(table.len(), 12);
    assert_eq!(table.max_week(), Some(week("2023-06-16")));

    // The following report has not been posted yet.
    let report = pipeline.run_cycle(now).await.expect("cycle");
    assert!(matches!(report.status, CycleStatus::FetchFailed { .. }));
    assert_eq!(std::fs::read(&table_path).expect("read table"), bytes);
}
