//! Core domain model for the weekly fare-swipe table: week/report-token date
//! rules, the report locator, and the append-only merge engine.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "fare-core";

pub const WEEK_COLUMN: &str = "WEEK";
pub const REMOTE_COLUMN: &str = "REMOTE";
pub const STATION_COLUMN: &str = "STATION";

/// Days between two consecutive weekly reports.
pub const REPORT_PERIOD_DAYS: i64 = 7;

/// Days between the first day of the covered week and the posting date the
/// publisher encodes in the report file name.
pub const PUBLICATION_LAG_DAYS: i64 = 14;

const WEEK_FORMAT: &str = "%Y-%m-%d";
const STAMP_FORMAT: &str = "%y%m%d";

/// The calendar week a report's swipe counts cover, keyed by its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Week(NaiveDate);

impl Week {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    /// Parses a `YYMMDD` stamp as used by local backfill file names.
    pub fn from_stamp(stamp: &str) -> Option<Self> {
        parse_stamp(stamp).map(Self)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + Duration::days(REPORT_PERIOD_DAYS))
    }

    /// Posting token of the report that covers this week.
    pub fn report_token(&self) -> ReportToken {
        ReportToken(self.0 + Duration::days(PUBLICATION_LAG_DAYS))
    }

    /// `YYMMDD` stamp used to name local backfill files.
    pub fn stamp(&self) -> String {
        self.0.format(STAMP_FORMAT).to_string()
    }
}

impl fmt::Display for Week {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(WEEK_FORMAT))
    }
}

impl FromStr for Week {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), WEEK_FORMAT).map(Self)
    }
}

/// Publisher posting-date token embedded in remote report names (`fares_YYMMDD.csv`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportToken(NaiveDate);

impl ReportToken {
    pub fn new(posted_on: NaiveDate) -> Self {
        Self(posted_on)
    }

    pub fn from_stamp(stamp: &str) -> Option<Self> {
        parse_stamp(stamp).map(Self)
    }

    pub fn posted_on(&self) -> NaiveDate {
        self.0
    }

    /// The week covered by the report posted under this token. The covered
    /// week starts 14 days before the posting date, not 7: the report posted
    /// on 2022-01-28 covers the week of 2022-01-14.
    pub fn effective_week(&self) -> Week {
        Week(self.0 - Duration::days(PUBLICATION_LAG_DAYS))
    }

    pub fn next(&self) -> Self {
        Self(self.0 + Duration::days(REPORT_PERIOD_DAYS))
    }
}

impl fmt::Display for ReportToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(STAMP_FORMAT))
    }
}

fn parse_stamp(stamp: &str) -> Option<NaiveDate> {
    if stamp.len() != 6 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(stamp, STAMP_FORMAT).ok()
}

/// Returns the trailing six-digit date stamp of a file stem, e.g. `fares_220128` -> `220128`.
pub fn trailing_stamp(stem: &str) -> Option<&str> {
    let split = stem.len().checked_sub(6)?;
    let tail = stem.get(split..)?;
    tail.bytes().all(|b| b.is_ascii_digit()).then_some(tail)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportLocation {
    pub effective_week: Week,
    pub token: ReportToken,
    pub address: String,
}

pub fn report_address(base: &str, token: ReportToken) -> String {
    format!("{}/fares_{token}.csv", base.trim_end_matches('/'))
}

/// Computes the next report due after `max_week`, the latest week in the
/// durable table.
pub fn locate_next(max_week: Week, base: &str) -> ReportLocation {
    let effective_week = max_week.next();
    let token = effective_week.report_token();
    ReportLocation {
        effective_week,
        token,
        address: report_address(base, token),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StationKey {
    pub remote_id: String,
    pub station_id: String,
}

/// One station row of a weekly report after trimming and week tagging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub week: Week,
    pub remote_id: String,
    pub station_id: String,
    /// Fare category -> swipes. Categories left blank by the publisher are absent.
    pub counts: BTreeMap<String, u64>,
}

impl NormalizedRecord {
    pub fn key(&self) -> StationKey {
        StationKey {
            remote_id: self.remote_id.clone(),
            station_id: self.station_id.clone(),
        }
    }
}

/// All normalized records of one weekly report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportBatch {
    pub week: Week,
    pub token: Option<ReportToken>,
    /// Fare categories in the order the report lists them.
    pub categories: Vec<String>,
    pub records: Vec<NormalizedRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestionOutcome {
    pub added: bool,
    pub week: Week,
    pub appended: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("week {week} is older than the latest stored week {latest}")]
    OutOfOrder { week: Week, latest: Week },
    #[error("report for week {week} has no station rows")]
    EmptyBatch { week: Week },
    #[error("record for station {station:?} is tagged {found}, expected {expected}")]
    WeekMismatch {
        expected: Week,
        found: Week,
        station: String,
    },
    #[error("station {station:?} (remote {remote:?}) appears twice in week {week}")]
    DuplicateStation {
        week: Week,
        remote: String,
        station: String,
    },
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table header is missing the {0} column")]
    MissingColumn(&'static str),
    #[error("table header lists the {0} column twice")]
    DuplicateColumn(String),
    #[error("line {line}: invalid week {value:?}")]
    InvalidWeek { line: u64, value: String },
    #[error("line {line}: {source}")]
    InvalidCount { line: u64, source: InvalidCount },
    #[error("line {line}: week {week} follows a later week")]
    Unordered { line: u64, week: Week },
    #[error("line {line}: duplicate row for station {station:?} in week {week}")]
    DuplicateRow {
        line: u64,
        week: Week,
        station: String,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid swipe count {0:?}")]
pub struct InvalidCount(pub String);

/// Parses a swipe count cell. Blank cells are `None`; `12.0` style values
/// written by float-typed exporters are accepted when integral.
pub fn parse_count(raw: &str) -> Result<Option<u64>, InvalidCount> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    if let Ok(count) = value.parse::<u64>() {
        return Ok(Some(count));
    }
    match value.parse::<f64>() {
        Ok(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => {
            Ok(Some(f as u64))
        }
        _ => Err(InvalidCount(value.to_string())),
    }
}

/// The append-only per-station, per-week time series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalTable {
    categories: Vec<String>,
    rows: Vec<NormalizedRecord>,
    weeks: BTreeSet<Week>,
}

impl CanonicalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[NormalizedRecord] {
        &self.rows
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn weeks(&self) -> impl Iterator<Item = Week> + '_ {
        self.weeks.iter().copied()
    }

    pub fn contains_week(&self, week: Week) -> bool {
        self.weeks.contains(&week)
    }

    pub fn max_week(&self) -> Option<Week> {
        self.weeks.last().copied()
    }

    pub fn week_rows(&self, week: Week) -> impl Iterator<Item = &NormalizedRecord> + '_ {
        self.rows.iter().filter(move |r| r.week == week)
    }

    pub fn stations(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|r| r.station_id.as_str()).collect()
    }

    /// Category totals per station name, summed over booths and weeks.
    pub fn totals_by_station(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        let mut totals: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for row in &self.rows {
            let station = totals.entry(row.station_id.clone()).or_default();
            for (category, count) in &row.counts {
                *station.entry(category.clone()).or_default() += count;
            }
        }
        totals
    }

    /// Admits `batch` unless its week is already stored. The table is only
    /// touched when the outcome reports `added`; every check runs first.
    pub fn merge(&mut self, batch: ReportBatch) -> Result<IngestionOutcome, MergeError> {
        let week = batch.week;
        if self.weeks.contains(&week) {
            return Ok(IngestionOutcome {
                added: false,
                week,
                appended: 0,
            });
        }
        if let Some(latest) = self.max_week() {
            if week < latest {
                return Err(MergeError::OutOfOrder { week, latest });
            }
        }
        if batch.records.is_empty() {
            return Err(MergeError::EmptyBatch { week });
        }

        let mut seen = HashSet::with_capacity(batch.records.len());
        for record in &batch.records {
            if record.week != week {
                return Err(MergeError::WeekMismatch {
                    expected: week,
                    found: record.week,
                    station: record.station_id.clone(),
                });
            }
            if !seen.insert(record.key()) {
                return Err(MergeError::DuplicateStation {
                    week,
                    remote: record.remote_id.clone(),
                    station: record.station_id.clone(),
                });
            }
        }

        let ReportBatch {
            categories,
            records,
            ..
        } = batch;
        for category in categories
            .iter()
            .chain(records.iter().flat_map(|r| r.counts.keys()))
        {
            if !self.categories.contains(category) {
                self.categories.push(category.clone());
            }
        }

        let appended = records.len();
        self.rows.extend(records);
        self.weeks.insert(week);
        Ok(IngestionOutcome {
            added: true,
            week,
            appended,
        })
    }

    /// Reads the durable CSV form, checking uniqueness and week ordering.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self, TableError> {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers: Vec<String> = rdr
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let mut seen = HashSet::with_capacity(headers.len());
        for name in headers.iter().filter(|h| !h.is_empty()) {
            if !seen.insert(name.as_str()) {
                return Err(TableError::DuplicateColumn(name.clone()));
            }
        }
        let position = |name: &str| headers.iter().position(|h| h == name);
        let week_idx = position(WEEK_COLUMN).ok_or(TableError::MissingColumn(WEEK_COLUMN))?;
        let station_idx =
            position(STATION_COLUMN).ok_or(TableError::MissingColumn(STATION_COLUMN))?;
        let remote_idx = position(REMOTE_COLUMN);
        let category_cols: Vec<(usize, &String)> = headers
            .iter()
            .enumerate()
            .filter(|(i, h)| {
                !h.is_empty() && *i != week_idx && *i != station_idx && Some(*i) != remote_idx
            })
            .collect();

        let mut table = CanonicalTable {
            categories: category_cols.iter().map(|(_, h)| (*h).clone()).collect(),
            ..Default::default()
        };
        let mut keys: HashSet<(Week, StationKey)> = HashSet::new();

        for result in rdr.records() {
            let record = result?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            let cell = |idx: usize| record.get(idx).unwrap_or("").trim();

            let raw_week = cell(week_idx);
            let week: Week = raw_week.parse().map_err(|_| TableError::InvalidWeek {
                line,
                value: raw_week.to_string(),
            })?;
            if table.max_week().is_some_and(|latest| week < latest) {
                return Err(TableError::Unordered { line, week });
            }

            let mut counts = BTreeMap::new();
            for (idx, name) in &category_cols {
                if let Some(count) =
                    parse_count(cell(*idx)).map_err(|source| TableError::InvalidCount { line, source })?
                {
                    counts.insert((*name).clone(), count);
                }
            }

            let row = NormalizedRecord {
                week,
                remote_id: remote_idx.map(cell).unwrap_or("").to_string(),
                station_id: cell(station_idx).to_string(),
                counts,
            };
            if !keys.insert((week, row.key())) {
                return Err(TableError::DuplicateRow {
                    line,
                    week,
                    station: row.station_id,
                });
            }
            table.weeks.insert(week);
            table.rows.push(row);
        }

        Ok(table)
    }

    /// Writes `WEEK,REMOTE,STATION,<categories...>`, one line per row.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), TableError> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = vec![WEEK_COLUMN, REMOTE_COLUMN, STATION_COLUMN];
        header.extend(self.categories.iter().map(String::as_str));
        wtr.write_record(&header)?;

        for row in &self.rows {
            let mut fields = Vec::with_capacity(header.len());
            fields.push(row.week.to_string());
            fields.push(row.remote_id.clone());
            fields.push(row.station_id.clone());
            for category in &self.categories {
                fields.push(
                    row.counts
                        .get(category)
                        .map(u64::to_string)
                        .unwrap_or_default(),
                );
            }
            wtr.write_record(&fields)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, TableError> {
        let mut out = Vec::new();
        self.write_csv(&mut out)?;
        Ok(out)
    }
}
