//! Scheduled update cycle, bulk bootstrap and cron wiring for the fare table.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fare_core::{locate_next, trailing_stamp, CanonicalTable, MergeError, ReportLocation, Week};
use fare_publish::{
    CommitRepository, GithubConfig, GithubRefStore, LocalFileRepository, PublishReceipt,
    TableRepository,
};
use fare_reports::{read_local_report, FareReportFetcher, ReportError, ReportFetcher};
use fare_storage::{HttpClientConfig, HttpFetcher, TableStore};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fare-sync";

pub const DEFAULT_REPORT_BASE_URL: &str = "http://web.mta.info/developers/data/nyct/fares";
pub const TABLE_FILE_NAME: &str = "main.csv";
pub const BACKFILL_DIR_NAME: &str = "backfill";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubSettings {
    pub token: String,
    pub owner: Option<String>,
    pub repo: String,
    pub branch: String,
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub report_base_url: String,
    pub data_dir: PathBuf,
    pub table_path: String,
    pub github: Option<GithubSettings>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let github = var("GITHUB_TOKEN")
            .filter(|token| !token.trim().is_empty())
            .map(|token| {
                let repo = var("FARE_GITHUB_REPO")
                    .unwrap_or_else(|| "metrocard-visualization".to_string());
                let (owner, repo) = match repo.split_once('/') {
                    Some((owner, name)) => (Some(owner.to_string()), name.to_string()),
                    None => (var("FARE_GITHUB_OWNER"), repo),
                };
                GithubSettings {
                    token,
                    owner,
                    repo,
                    branch: var("FARE_GITHUB_BRANCH").unwrap_or_else(|| "master".to_string()),
                    api_url: var("FARE_GITHUB_API_URL")
                        .unwrap_or_else(|| "https://api.github.com".to_string()),
                }
            });

        Self {
            report_base_url: var("FARE_REPORT_BASE_URL")
                .unwrap_or_else(|| DEFAULT_REPORT_BASE_URL.to_string()),
            data_dir: var("FARE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            table_path: var("FARE_TABLE_PATH").unwrap_or_else(|| "data/main.csv".to_string()),
            github,
            user_agent: var("FARE_USER_AGENT").unwrap_or_else(|| "fare-bot/0.1".to_string()),
            http_timeout_secs: var("FARE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            scheduler_enabled: var("FARE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("FARE_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * Sat".to_string()),
        }
    }

    pub fn local_table_path(&self) -> PathBuf {
        self.data_dir.join(TABLE_FILE_NAME)
    }

    /// Where backfill files are written and bootstrapped from by default.
    pub fn backfill_dir(&self) -> PathBuf {
        self.data_dir.join(BACKFILL_DIR_NAME)
    }

    pub fn http_fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })
    }
}

/// The commit repository when credentials are configured, otherwise the
/// local data directory.
pub fn build_repository(config: &SyncConfig, http: &HttpFetcher) -> Result<Box<dyn TableRepository>> {
    match &config.github {
        Some(github) => {
            let owner = github.owner.clone().with_context(|| {
                format!(
                    "repository {} has no owner; set FARE_GITHUB_REPO=owner/name or FARE_GITHUB_OWNER",
                    github.repo
                )
            })?;
            let store = GithubRefStore::new(
                http,
                GithubConfig {
                    api_url: github.api_url.clone(),
                    owner,
                    repo: github.repo.clone(),
                    token: github.token.clone(),
                },
            );
            Ok(Box::new(CommitRepository::new(
                store,
                github.branch.clone(),
                config.table_path.clone(),
            )))
        }
        None => Ok(Box::new(LocalFileRepository::new(TableStore::new(
            config.local_table_path(),
        )))),
    }
}

pub fn commit_message(now: DateTime<Utc>) -> String {
    format!("Data Updated - {}", now.format("%Y-%m-%d %H:%M:%S"))
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleStatus {
    /// Retrieval or parsing failed; the table was not touched.
    FetchFailed { address: String, error: String },
    /// The report's week is already stored; nothing was published.
    Duplicate { week: Week },
    Published {
        week: Week,
        appended: usize,
        receipt: PublishReceipt,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub location: ReportLocation,
    pub status: CycleStatus,
}

/// One scheduled update: locate, fetch, merge, publish.
pub struct UpdatePipeline {
    repository: Box<dyn TableRepository>,
    reports: Box<dyn ReportFetcher>,
    report_base_url: String,
}

impl UpdatePipeline {
    pub fn new(
        repository: Box<dyn TableRepository>,
        reports: Box<dyn ReportFetcher>,
        report_base_url: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            reports,
            report_base_url: report_base_url.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = config.http_fetcher()?;
        let repository = build_repository(config, &http)?;
        Ok(Self::new(
            repository,
            Box::new(FareReportFetcher::new(http)),
            config.report_base_url.clone(),
        ))
    }

    pub fn repository(&self) -> &dyn TableRepository {
        self.repository.as_ref()
    }

    /// Where the next report is expected, judged from the durable table.
    pub async fn next_location(&self) -> Result<ReportLocation> {
        let loaded = self.repository.load().await?;
        let max_week = loaded.table.max_week().with_context(|| {
            format!(
                "durable table {} is empty; bootstrap it from backfill files first",
                self.repository.describe()
            )
        })?;
        Ok(locate_next(max_week, &self.report_base_url))
    }

    pub async fn run_once(&self) -> Result<CycleReport> {
        self.run_cycle(Utc::now()).await
    }

    /// Runs one cycle stamped with `now`. Fetch failures and duplicates are
    /// terminal statuses; merge and publish failures are errors.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        // Always the durable copy: a week that failed to publish must be located again.
        let loaded = self
            .repository
            .load()
            .await
            .with_context(|| format!("loading {}", self.repository.describe()))?;
        let max_week = loaded.table.max_week().with_context(|| {
            format!(
                "durable table {} is empty; bootstrap it from backfill files first",
                self.repository.describe()
            )
        })?;
        let location = locate_next(max_week, &self.report_base_url);
        info!(%run_id, %max_week, week = %location.effective_week, address = %location.address, "located next report");

        let finish = |location: ReportLocation, status: CycleStatus| CycleReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            location,
            status,
        };

        let batch = match self.reports.fetch(&location.address).await {
            Ok(batch) => batch,
            Err(err) => {
                let kind = if err.is_retrieval() { "retrieval" } else { "parse" };
                error!(%run_id, address = %err.address(), kind, error = %err, "report fetch failed");
                let status = CycleStatus::FetchFailed {
                    address: location.address.clone(),
                    error: err.to_string(),
                };
                return Ok(finish(location, status));
            }
        };
        if batch.week != location.effective_week {
            warn!(%run_id, expected = %location.effective_week, found = %batch.week, "report covers an unexpected week");
        }

        let mut table = loaded.table;
        let outcome = table
            .merge(batch)
            .with_context(|| format!("merging {}", location.address))?;
        if !outcome.added {
            info!(%run_id, week = %outcome.week, "week already stored; nothing to publish");
            let status = CycleStatus::Duplicate { week: outcome.week };
            return Ok(finish(location, status));
        }
        info!(%run_id, week = %outcome.week, appended = outcome.appended, rows = table.len(), "report merged");

        let message = commit_message(now);
        let receipt = self
            .repository
            .publish(&table, &message, loaded.revision.as_deref())
            .await
            .with_context(|| {
                format!(
                    "publishing week {} to {}",
                    outcome.week,
                    self.repository.describe()
                )
            })?;
        info!(%run_id, revision = %receipt.revision, "published");

        let status = CycleStatus::Published {
            week: outcome.week,
            appended: outcome.appended,
            receipt,
        };
        Ok(finish(location, status))
    }
}

#[derive(Debug, Error)]
pub enum BulkLoadError {
    #[error("listing {}: {source}", dir.display())]
    List {
        dir: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: file name carries no YYMMDD week stamp", file.display())]
    Unstamped { file: PathBuf },
    #[error("{}: {source}", file.display())]
    Report { file: PathBuf, source: ReportError },
    #[error("{}: {source}", file.display())]
    Merge { file: PathBuf, source: MergeError },
}

impl BulkLoadError {
    pub fn file(&self) -> Option<&Path> {
        match self {
            Self::List { .. } => None,
            Self::Unstamped { file } | Self::Report { file, .. } | Self::Merge { file, .. } => {
                Some(file.as_path())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkLoad {
    pub table: CanonicalTable,
    pub files: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Builds a table from every `*.csv` backfill file in `dir`, oldest week first.
pub async fn bulk_load(dir: &Path) -> Result<BulkLoad, BulkLoadError> {
    let list_err = |source| BulkLoadError::List {
        dir: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir).await.map_err(list_err)?;
    let mut files: Vec<(Week, PathBuf)> = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if !is_csv || name.starts_with('.') {
            continue;
        }
        let week = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(trailing_stamp)
            .and_then(Week::from_stamp)
            .ok_or_else(|| BulkLoadError::Unstamped { file: path.clone() })?;
        files.push((week, path));
    }
    files.sort();

    let mut loaded = BulkLoad {
        table: CanonicalTable::new(),
        files: Vec::with_capacity(files.len()),
        skipped: Vec::new(),
    };
    for (n, (_, file)) in files.into_iter().enumerate() {
        let batch = read_local_report(&file)
            .await
            .map_err(|source| BulkLoadError::Report {
                file: file.clone(),
                source,
            })?;
        let outcome = loaded.table.merge(batch).map_err(|source| BulkLoadError::Merge {
            file: file.clone(),
            source,
        })?;
        if outcome.added {
            info!(file = %file.display(), n = n + 1, week = %outcome.week, rows = outcome.appended, "loaded backfill file");
            loaded.files.push(file);
        } else {
            warn!(file = %file.display(), week = %outcome.week, "week already loaded; skipping");
            loaded.skipped.push(file);
        }
    }
    Ok(loaded)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BootstrapStatus {
    AlreadyPresent { rows: usize, max_week: Option<Week> },
    Published {
        files: usize,
        rows: usize,
        receipt: PublishReceipt,
    },
}

/// Builds the table from `dir` and publishes it, unless the durable table
/// already holds data.
pub async fn bootstrap(
    repository: &dyn TableRepository,
    dir: &Path,
    now: DateTime<Utc>,
) -> Result<BootstrapStatus> {
    let loaded = repository
        .load()
        .await
        .with_context(|| format!("loading {}", repository.describe()))?;
    if !loaded.table.is_empty() {
        info!(rows = loaded.table.len(), "durable table already populated; bootstrap skipped");
        return Ok(BootstrapStatus::AlreadyPresent {
            rows: loaded.table.len(),
            max_week: loaded.table.max_week(),
        });
    }

    let bulk = bulk_load(dir).await?;
    if bulk.table.is_empty() {
        bail!("no backfill files found in {}", dir.display());
    }
    let message = format!("Initial data load - {}", now.format("%Y-%m-%d %H:%M:%S"));
    let receipt = repository
        .publish(&bulk.table, &message, loaded.revision.as_deref())
        .await
        .with_context(|| format!("publishing bootstrap table to {}", repository.describe()))?;
    Ok(BootstrapStatus::Published {
        files: bulk.files.len(),
        rows: bulk.table.len(),
        receipt,
    })
}

/// Schedules `pipeline` on `cron`. Triggers that fire while a cycle is still
/// running are skipped, so cycles never overlap.
pub async fn build_scheduler(pipeline: Arc<UpdatePipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let gate = gate.clone();
        Box::pin(async move {
            let Ok(_running) = gate.try_lock() else {
                warn!("previous update cycle still running; trigger skipped");
                return;
            };
            match pipeline.run_once().await {
                Ok(report) => info!(run_id = %report.run_id, status = ?report.status, "scheduled cycle finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn run_once_from_env() -> Result<CycleReport> {
    let config = SyncConfig::from_env();
    UpdatePipeline::from_config(&config)?.run_once().await
}
