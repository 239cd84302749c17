//! Weekly fare report retrieval + normalization.
//!
//! Remote reports are posted as `fares_<YYMMDD>.csv` where the stamp is the
//! posting date; they open with a two line preamble. Local backfill files are
//! already stripped of the preamble and carry the covered week in their name.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use fare_core::{
    parse_count, report_address, trailing_stamp, InvalidCount, NormalizedRecord, ReportBatch,
    ReportToken, Week, REMOTE_COLUMN, STATION_COLUMN, WEEK_COLUMN,
};
use fare_storage::{FetchError, HttpFetcher, TableStore};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

pub const CRATE_NAME: &str = "fare-reports";

/// Lines the publisher prints above the header row of every remote report.
pub const REMOTE_PREAMBLE_LINES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportSource {
    Remote(Url),
    Local(PathBuf),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed report address: {0}")]
    InvalidAddress(String),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("report has no header row")]
    MissingHeader,
    #[error("report header is missing the {0} column")]
    MissingColumn(&'static str),
    #[error("row {row}: blank station name")]
    BlankStation { row: usize },
    #[error("row {row}, column {column}: {source}")]
    InvalidCount {
        row: usize,
        column: String,
        source: InvalidCount,
    },
    #[error("report has no station rows")]
    NoRows,
    #[error("report header lists the {0} column twice")]
    DuplicateColumn(String),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("retrieving {address}: {source}")]
    Retrieval {
        address: String,
        source: RetrievalError,
    },
    #[error("parsing {address}: {source}")]
    Parse { address: String, source: ParseError },
}

impl ReportError {
    fn retrieval(address: &str, source: impl Into<RetrievalError>) -> Self {
        Self::Retrieval {
            address: address.to_string(),
            source: source.into(),
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Self::Retrieval { address, .. } | Self::Parse { address, .. } => address,
        }
    }

    pub fn is_retrieval(&self) -> bool {
        matches!(self, Self::Retrieval { .. })
    }
}

impl ReportSource {
    pub fn classify(address: &str) -> Result<Self, ReportError> {
        let trimmed = address.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let url = Url::parse(trimmed).map_err(|err| {
                ReportError::retrieval(address, RetrievalError::InvalidAddress(err.to_string()))
            })?;
            return Ok(Self::Remote(url));
        }
        if trimmed.is_empty() {
            return Err(ReportError::retrieval(
                address,
                RetrievalError::InvalidAddress("empty address".into()),
            ));
        }
        Ok(Self::Local(PathBuf::from(trimmed)))
    }

    pub fn address(&self) -> String {
        match self {
            Self::Remote(url) => url.to_string(),
            Self::Local(path) => path.display().to_string(),
        }
    }

    pub fn preamble_lines(&self) -> usize {
        match self {
            Self::Remote(_) => REMOTE_PREAMBLE_LINES,
            Self::Local(_) => 0,
        }
    }

    fn file_stem(&self) -> Option<String> {
        match self {
            Self::Remote(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .and_then(|name| Path::new(name).file_stem())
                .map(|stem| stem.to_string_lossy().into_owned()),
            Self::Local(path) => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned()),
        }
    }

    /// Covered week of the report behind this source. Remote names carry the
    /// posting token; local backfill names carry the week itself.
    pub fn effective_week(&self) -> Result<(Week, Option<ReportToken>), ReportError> {
        let address = self.address();
        let invalid = || {
            ReportError::retrieval(
                &address,
                RetrievalError::InvalidAddress("file name carries no YYMMDD date stamp".into()),
            )
        };
        let stem = self.file_stem().ok_or_else(invalid)?;
        let stamp = trailing_stamp(&stem).ok_or_else(invalid)?;
        match self {
            Self::Remote(_) => {
                let token = ReportToken::from_stamp(stamp).ok_or_else(invalid)?;
                Ok((token.effective_week(), Some(token)))
            }
            Self::Local(_) => Ok((Week::from_stamp(stamp).ok_or_else(invalid)?, None)),
        }
    }
}

/// A report's table after preamble skipping, blank column removal and trimming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn skip_lines(bytes: &[u8], lines: usize) -> &[u8] {
    let mut rest = bytes;
    for _ in 0..lines {
        match rest.iter().position(|b| *b == b'\n') {
            Some(idx) => rest = &rest[idx + 1..],
            None => return &[],
        }
    }
    rest
}

pub fn normalize_frame(bytes: &[u8], preamble_lines: usize) -> Result<ReportFrame, ParseError> {
    let body = skip_lines(bytes, preamble_lines);
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body);

    let mut records = rdr.records();
    let header = loop {
        match records.next() {
            Some(record) => {
                let record = record?;
                if record.iter().any(|field| !field.trim().is_empty()) {
                    break record;
                }
            }
            None => return Err(ParseError::MissingHeader),
        }
    };

    let kept: Vec<(usize, String)> = header
        .iter()
        .enumerate()
        .map(|(idx, name)| (idx, name.trim().to_string()))
        .filter(|(_, name)| !name.is_empty())
        .collect();
    let mut seen = HashSet::with_capacity(kept.len());
    for (_, name) in &kept {
        if !seen.insert(name.as_str()) {
            return Err(ParseError::DuplicateColumn(name.clone()));
        }
    }

    let mut rows = Vec::new();
    for record in records {
        let record = record?;
        let row: Vec<String> = kept
            .iter()
            .map(|(idx, _)| record.get(*idx).unwrap_or("").trim().to_string())
            .collect();
        if row.iter().all(String::is_empty) {
            continue;
        }
        rows.push(row);
    }

    Ok(ReportFrame {
        columns: kept.into_iter().map(|(_, name)| name).collect(),
        rows,
    })
}

impl ReportFrame {
    /// Tags every row with `week` and splits it into station identity + counts.
    pub fn into_batch(
        self,
        week: Week,
        token: Option<ReportToken>,
    ) -> Result<ReportBatch, ParseError> {
        let position = |name: &str| self.columns.iter().position(|c| c == name);
        let station_idx =
            position(STATION_COLUMN).ok_or(ParseError::MissingColumn(STATION_COLUMN))?;
        let remote_idx = position(REMOTE_COLUMN);
        let week_idx = position(WEEK_COLUMN);
        let category_cols: Vec<(usize, String)> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| {
                *idx != station_idx && Some(*idx) != remote_idx && Some(*idx) != week_idx
            })
            .map(|(idx, name)| (idx, name.clone()))
            .collect();

        let mut records = Vec::with_capacity(self.rows.len());
        for (row_no, row) in self.rows.into_iter().enumerate() {
            let row_no = row_no + 1;
            let station_id = row[station_idx].clone();
            if station_id.is_empty() {
                return Err(ParseError::BlankStation { row: row_no });
            }
            let mut counts = std::collections::BTreeMap::new();
            for (idx, column) in &category_cols {
                let count = parse_count(&row[*idx]).map_err(|source| ParseError::InvalidCount {
                    row: row_no,
                    column: column.clone(),
                    source,
                })?;
                if let Some(count) = count {
                    counts.insert(column.clone(), count);
                }
            }
            records.push(NormalizedRecord {
                week,
                remote_id: remote_idx.map(|idx| row[idx].clone()).unwrap_or_default(),
                station_id,
                counts,
            });
        }

        if records.is_empty() {
            return Err(ParseError::NoRows);
        }

        Ok(ReportBatch {
            week,
            token,
            categories: category_cols.into_iter().map(|(_, name)| name).collect(),
            records,
        })
    }
}

/// Normalizes raw report bytes obtained from `source`.
pub fn parse_report(source: &ReportSource, bytes: &[u8]) -> Result<ReportBatch, ReportError> {
    let (week, token) = source.effective_week()?;
    normalize_frame(bytes, source.preamble_lines())
        .and_then(|frame| frame.into_batch(week, token))
        .map_err(|source_err| ReportError::Parse {
            address: source.address(),
            source: source_err,
        })
}

pub async fn read_local_report(path: &Path) -> Result<ReportBatch, ReportError> {
    let source = ReportSource::Local(path.to_path_buf());
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| ReportError::retrieval(&source.address(), err))?;
    parse_report(&source, &bytes)
}

#[async_trait]
pub trait ReportFetcher: Send + Sync {
    /// Retrieves and normalizes the report at `address`, a URL or local path.
    async fn fetch(&self, address: &str) -> Result<ReportBatch, ReportError>;
}

pub struct FareReportFetcher {
    http: HttpFetcher,
}

impl FareReportFetcher {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ReportFetcher for FareReportFetcher {
    async fn fetch(&self, address: &str) -> Result<ReportBatch, ReportError> {
        match ReportSource::classify(address)? {
            ReportSource::Local(path) => read_local_report(&path).await,
            source @ ReportSource::Remote(_) => {
                let response = self
                    .http
                    .fetch_bytes(address.trim())
                    .await
                    .map_err(|err| ReportError::retrieval(address, err))?;
                parse_report(&source, &response.body)
            }
        }
    }
}

/// Serializes a batch as a local backfill file: no preamble, no WEEK column.
pub fn backfill_csv_bytes(batch: &ReportBatch) -> anyhow::Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    let mut header = vec![REMOTE_COLUMN.to_string(), STATION_COLUMN.to_string()];
    header.extend(batch.categories.iter().cloned());
    wtr.write_record(&header)?;
    for record in &batch.records {
        let mut fields = vec![record.remote_id.clone(), record.station_id.clone()];
        fields.extend(batch.categories.iter().map(|category| {
            record
                .counts
                .get(category)
                .map(u64::to_string)
                .unwrap_or_default()
        }));
        wtr.write_record(&fields)?;
    }
    wtr.into_inner()
        .map_err(|err| anyhow::anyhow!("flushing backfill csv: {}", err.error()))
}

#[derive(Debug, Clone)]
pub struct BackfillSummary {
    pub written: Vec<PathBuf>,
    pub failed: Vec<String>,
}

/// Downloads `weeks` consecutive reports starting at posting token `first`
/// and stores each as `<out_dir>/<covered YYMMDD>.csv`. A week that cannot be
/// fetched is logged and listed in the summary; the rest still download.
pub async fn download_backfill(
    fetcher: &dyn ReportFetcher,
    base: &str,
    first: ReportToken,
    weeks: usize,
    out_dir: &Path,
) -> anyhow::Result<BackfillSummary> {
    let mut summary = BackfillSummary {
        written: Vec::new(),
        failed: Vec::new(),
    };
    let mut token = first;
    for n in 0..weeks {
        let address = report_address(base, token);
        info!(week = n + 1, of = weeks, %address, "downloading backfill report");
        match fetcher.fetch(&address).await {
            Ok(batch) => {
                let path = out_dir.join(format!("{}.csv", batch.week.stamp()));
                let bytes = backfill_csv_bytes(&batch)?;
                TableStore::new(&path)
                    .write_bytes(&bytes)
                    .await
                    .with_context(|| format!("writing backfill file {}", path.display()))?;
                summary.written.push(path);
            }
            Err(err) => {
                warn!(%address, error = %err, "backfill report unavailable");
                summary.failed.push(address);
            }
        }
        token = token.next();
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fare_core::CanonicalTable;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const REMOTE_REPORT: &str = "Fare Type Breakdown,,,,\n\
        From 06/10/2023-06/16/2023,,,,\n\
        REMOTE,STATION ,FF ,SEN/DIS , \n\
        R001,WHITEHALL STREET    ,1200,45, \n\
        R003,CYPRESS HILLS,300,  7 , \n\
        ,,,,\n";

    fn week(s: &str) -> Week {
        s.parse().expect("week")
    }

    #[test]
    fn blank_trailing_columns_are_dropped_and_headers_trimmed() {
        let frame = normalize_frame(b" STATION ,FF , \n 125 ST ,10, \n", 0).expect("frame");
        assert_eq!(frame.columns, ["STATION", "FF"]);
        assert_eq!(frame.rows, vec![vec!["125 ST".to_string(), "10".to_string()]]);
    }

    #[test]
    fn headers_that_trim_to_the_same_name_are_rejected() {
        let err = normalize_frame(b"REMOTE,STATION,FF ,FF\nR001,A,10,20\n", 0).unwrap_err();
        assert!(matches!(err, ParseError::DuplicateColumn(ref name) if name == "FF"));

        let err = normalize_frame(b" STATION,STATION ,FF\nA,A,1\n", 0).unwrap_err();
        assert!(matches!(err, ParseError::DuplicateColumn(ref name) if name == "STATION"));

        let source = ReportSource::classify("data/230602.csv").expect("classify");
        let err = parse_report(&source, b"REMOTE,STATION,FF ,FF\nR001,A,10,20\n").unwrap_err();
        assert!(!err.is_retrieval());
    }

    #[test]
    fn padded_station_names_group_with_unpadded_ones() {
        let padded = normalize_frame(b"STATION,FF\n 125 ST ,10\n", 0)
            .and_then(|f| f.into_batch(week("2023-06-02"), None))
            .expect("padded");
        let plain = normalize_frame(b"STATION,FF\n125 ST,5\n", 0)
            .and_then(|f| f.into_batch(week("2023-06-09"), None))
            .expect("plain");
        assert_eq!(padded.records[0].station_id, "125 ST");

        let mut table = CanonicalTable::new();
        table.merge(padded).expect("merge");
        table.merge(plain).expect("merge");
        let totals = table.totals_by_station();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals["125 ST"]["FF"], 15);
    }

    #[test]
    fn remote_report_skips_preamble_and_derives_week_from_token() {
        let source =
            ReportSource::classify("http://example.test/fares/fares_230623.csv").expect("classify");
        assert_eq!(source.preamble_lines(), REMOTE_PREAMBLE_LINES);

        let batch = parse_report(&source, REMOTE_REPORT.as_bytes()).expect("parse");
        assert_eq!(batch.week, week("2023-06-09"));
        assert_eq!(batch.token.map(|t| t.to_string()), Some("230623".to_string()));
        assert_eq!(batch.categories, ["FF", "SEN/DIS"]);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].station_id, "WHITEHALL STREET");
        assert_eq!(batch.records[0].remote_id, "R001");
        assert_eq!(batch.records[1].counts["SEN/DIS"], 7);
        assert!(batch.records.iter().all(|r| r.week == batch.week));
    }

    #[tokio::test]
    async fn local_backfill_file_has_no_preamble_and_names_its_week() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("230609.csv");
        std::fs::write(&path, "REMOTE,STATION,FF\nR001,WHITEHALL STREET,1200\n").expect("write");

        let batch = read_local_report(&path).await.expect("read");
        assert_eq!(batch.week, week("2023-06-09"));
        assert_eq!(batch.token, None);
        assert_eq!(batch.records[0].counts["FF"], 1200);
    }

    #[tokio::test]
    async fn missing_local_file_is_a_retrieval_error() {
        let dir = tempdir().expect("tempdir");
        let err = read_local_report(&dir.path().join("230609.csv"))
            .await
            .unwrap_err();
        assert!(err.is_retrieval());
        assert!(err.address().ends_with("230609.csv"));
    }

    #[test]
    fn malformed_content_is_a_parse_error() {
        let source = ReportSource::Local(PathBuf::from("230609.csv"));
        let bad_count = parse_report(&source, b"STATION,FF\nWHITEHALL,lots\n").unwrap_err();
        assert!(matches!(
            bad_count,
            ReportError::Parse {
                source: ParseError::InvalidCount { row: 1, .. },
                ..
            }
        ));

        let no_station = parse_report(&source, b"REMOTE,FF\nR001,3\n").unwrap_err();
        assert!(matches!(
            no_station,
            ReportError::Parse {
                source: ParseError::MissingColumn(STATION_COLUMN),
                ..
            }
        ));

        let empty = parse_report(&source, b"STATION,FF\n,\n").unwrap_err();
        assert!(matches!(
            empty,
            ReportError::Parse {
                source: ParseError::NoRows,
                ..
            }
        ));
    }

    #[test]
    fn addresses_are_classified_by_scheme() {
        assert!(matches!(
            ReportSource::classify("https://example.test/fares_230623.csv"),
            Ok(ReportSource::Remote(_))
        ));
        assert!(matches!(
            ReportSource::classify("data/230609.csv"),
            Ok(ReportSource::Local(_))
        ));
        assert!(ReportSource::classify("http://").is_err());

        let unstamped = ReportSource::classify("data/latest.csv").expect("classify");
        assert!(unstamped.effective_week().unwrap_err().is_retrieval());
    }

    struct CannedFetcher {
        reports: HashMap<String, String>,
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReportFetcher for CannedFetcher {
        async fn fetch(&self, address: &str) -> Result<ReportBatch, ReportError> {
            self.requested.lock().expect("lock").push(address.to_string());
            let source = ReportSource::classify(address)?;
            match self.reports.get(address) {
                Some(body) => parse_report(&source, body.as_bytes()),
                None => Err(ReportError::retrieval(
                    address,
                    RetrievalError::InvalidAddress("not published".into()),
                )),
            }
        }
    }

    #[tokio::test]
    async fn backfill_writes_loadable_files_named_by_covered_week() {
        let base = "http://example.test/fares";
        let first = ReportToken::from_stamp("230623").expect("token");
        let fetcher = CannedFetcher {
            reports: HashMap::from([(report_address(base, first), REMOTE_REPORT.to_string())]),
            requested: Mutex::new(Vec::new()),
        };
        let dir = tempdir().expect("tempdir");

        let summary = download_backfill(&fetcher, base, first, 2, dir.path())
            .await
            .expect("backfill");
        assert_eq!(summary.written, vec![dir.path().join("230609.csv")]);
        assert_eq!(summary.failed, vec![format!("{base}/fares_230630.csv")]);
        assert_eq!(fetcher.requested.lock().expect("lock").len(), 2);

        let reloaded = read_local_report(&summary.written[0]).await.expect("reload");
        let original = parse_report(
            &ReportSource::classify(&report_address(base, first)).expect("classify"),
            REMOTE_REPORT.as_bytes(),
        )
        .expect("parse");
        assert_eq!(reloaded.week, original.week);
        assert_eq!(reloaded.records, original.records);
        assert_eq!(reloaded.categories, original.categories);
    }
}
