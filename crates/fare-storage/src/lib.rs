//! Atomic local table storage + HTTP fetch utilities for the fare pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use fare_core::CanonicalTable;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fare-storage";

#[derive(Debug, Clone)]
pub struct StoredTable {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    /// The file already held exactly these bytes.
    pub unchanged: bool,
}

/// The canonical table as a CSV file on local disk.
#[derive(Debug, Clone)]
pub struct TableStore {
    path: PathBuf,
}

impl TableStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn read_bytes(&self) -> anyhow::Result<Option<Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    /// Loads the stored table, or `None` when nothing has been stored yet.
    pub async fn load(&self) -> anyhow::Result<Option<CanonicalTable>> {
        let Some(bytes) = self.read_bytes().await? else {
            return Ok(None);
        };
        let table = CanonicalTable::read_csv(bytes.as_slice())
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(table))
    }

    pub async fn save(&self, table: &CanonicalTable) -> anyhow::Result<StoredTable> {
        let bytes = table
            .to_csv_bytes()
            .context("serializing canonical table")?;
        self.write_bytes(&bytes).await
    }

    /// Replaces the file through a temp file + rename so readers never see a
    /// half-written table.
    pub async fn write_bytes(&self, bytes: &[u8]) -> anyhow::Result<StoredTable> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self.path.clone();

        if let Ok(existing) = fs::read(&path).await {
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredTable {
                    content_hash,
                    path,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating table directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp table file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp table file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp table file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp table {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredTable {
            content_hash,
            path,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Single-shot HTTP GET client. A failed request is reported, never retried:
/// the next scheduled cycle is the retry.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fare_core::{NormalizedRecord, ReportBatch, Week};
    use tempfile::tempdir;

    fn one_week_table() -> CanonicalTable {
        let week: Week = "2023-06-02".parse().expect("week");
        let mut table = CanonicalTable::new();
        table
            .merge(ReportBatch {
                week,
                token: None,
                categories: vec!["FF".into()],
                records: vec![NormalizedRecord {
                    week,
                    remote_id: "R001".into(),
                    station_id: "WHITEHALL ST".into(),
                    counts: [("FF".to_string(), 10)].into_iter().collect(),
                }],
            })
            .expect("merge");
        table
    }

    #[test]
    fn table_hashing_is_stable() {
        let hash = TableStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn missing_table_loads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = TableStore::new(dir.path().join("main.csv"));
        assert!(store.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn saved_table_loads_back_and_rewrites_are_detected() {
        let dir = tempdir().expect("tempdir");
        let store = TableStore::new(dir.path().join("data").join("main.csv"));
        let table = one_week_table();

        let first = store.save(&table).await.expect("first save");
        let second = store.save(&table).await.expect("second save");
        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert_eq!(first.content_hash, second.content_hash);

        let loaded = store.load().await.expect("load").expect("table");
        assert_eq!(loaded, table);

        let leftovers = std::fs::read_dir(dir.path().join("data"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn client_builds_with_user_agent() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("fare-bot/test".into()),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }
}
