//! Versioned-commit publishing of the canonical fare table.
//!
//! A publish reads the branch tip, writes a tree holding the new table blob,
//! commits it on top of the tip and fast-forwards the branch. The branch only
//! moves in the last step, so a failure anywhere leaves it where it was.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use fare_core::{CanonicalTable, TableError};
use fare_storage::{HttpFetcher, TableStore};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "fare-publish";

/// Git mode of a regular, non-executable file.
pub const BLOB_FILE_MODE: &str = "100644";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublishStep {
    ReadTip,
    ReadFile,
    CreateTree,
    CreateCommit,
    AdvanceRef,
}

impl fmt::Display for PublishStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadTip => "read-tip",
            Self::ReadFile => "read-file",
            Self::CreateTree => "create-tree",
            Self::CreateCommit => "create-commit",
            Self::AdvanceRef => "advance-ref",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{step}: credentials rejected ({message})")]
    Auth { step: PublishStep, message: String },
    #[error("branch {branch} moved since it was read: {detail}")]
    Conflict { branch: String, detail: String },
    #[error("{step}: transport failure: {source}")]
    Transport {
        step: PublishStep,
        source: reqwest::Error,
    },
    #[error("{step}: remote rejected request (status {status:?}): {message}")]
    Api {
        step: PublishStep,
        status: Option<u16>,
        message: String,
    },
    #[error("serializing table: {0}")]
    Serialize(#[from] TableError),
    #[error(transparent)]
    Local(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchTip {
    pub commit: String,
    pub tree: String,
}

/// The four commit-protocol steps, plus reading a file back at a commit.
#[async_trait]
pub trait RefStore: Send + Sync {
    async fn read_tip(&self, branch: &str) -> Result<BranchTip, PublishError>;

    async fn read_file(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>, PublishError>;

    /// Returns the id of `base_tree` with `path` replaced by `content`.
    async fn create_tree(
        &self,
        base_tree: &str,
        path: &str,
        content: &[u8],
    ) -> Result<String, PublishError>;

    async fn create_commit(
        &self,
        message: &str,
        tree: &str,
        parent: &str,
    ) -> Result<String, PublishError>;

    /// Moves `branch` from `from` to `to`; must never force.
    async fn advance_ref(&self, branch: &str, from: &str, to: &str) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedTable {
    pub table: CanonicalTable,
    /// Commit id or content hash the table was read at; `None` for a fresh store.
    pub revision: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub committed: bool,
    pub revision: String,
    pub previous: Option<String>,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Load/publish lifecycle of the durable table.
#[async_trait]
pub trait TableRepository: Send + Sync {
    fn describe(&self) -> String;

    async fn load(&self) -> anyhow::Result<LoadedTable>;

    /// Persists `table`. When `base_revision` is given and the store has moved
    /// past it, nothing is written and `PublishError::Conflict` is returned.
    async fn publish(
        &self,
        table: &CanonicalTable,
        message: &str,
        base_revision: Option<&str>,
    ) -> Result<PublishReceipt, PublishError>;
}

/// Table kept as a file in a branch of a remote repository.
pub struct CommitRepository<R> {
    store: R,
    branch: String,
    path: String,
}

impl<R: RefStore> CommitRepository<R> {
    pub fn new(store: R, branch: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            store,
            branch: branch.into(),
            path: path.into(),
        }
    }

    pub fn store(&self) -> &R {
        &self.store
    }
}

#[async_trait]
impl<R: RefStore> TableRepository for CommitRepository<R> {
    fn describe(&self) -> String {
        format!("{}@{}", self.path, self.branch)
    }

    async fn load(&self) -> anyhow::Result<LoadedTable> {
        let tip = self
            .store
            .read_tip(&self.branch)
            .await
            .with_context(|| format!("reading tip of {}", self.branch))?;
        let table = match self.store.read_file(&tip.commit, &self.path).await? {
            Some(bytes) => CanonicalTable::read_csv(bytes.as_slice())
                .with_context(|| format!("parsing {} at {}", self.path, tip.commit))?,
            None => CanonicalTable::new(),
        };
        Ok(LoadedTable {
            table,
            revision: Some(tip.commit),
        })
    }

    async fn publish(
        &self,
        table: &CanonicalTable,
        message: &str,
        base_revision: Option<&str>,
    ) -> Result<PublishReceipt, PublishError> {
        let span = info_span!("publish", branch = %self.branch, path = %self.path);
        async {
            let bytes = table.to_csv_bytes()?;

            let tip = self.store.read_tip(&self.branch).await?;
            if let Some(base) = base_revision {
                if base != tip.commit {
                    return Err(PublishError::Conflict {
                        branch: self.branch.clone(),
                        detail: format!("table was loaded at {base}, tip is now {}", tip.commit),
                    });
                }
            }

            let tree = self.store.create_tree(&tip.tree, &self.path, &bytes).await?;
            let commit = self.store.create_commit(message, &tree, &tip.commit).await?;
            self.store
                .advance_ref(&self.branch, &tip.commit, &commit)
                .await?;
            info!(%commit, parent = %tip.commit, bytes = bytes.len(), "branch advanced");

            Ok::<_, PublishError>(PublishReceipt {
                committed: true,
                revision: commit,
                previous: Some(tip.commit),
                content_hash: TableStore::sha256_hex(&bytes),
                byte_size: bytes.len(),
            })
        }
        .instrument(span)
        .await
    }
}

/// Table kept as a plain local file; revisions are content hashes.
pub struct LocalFileRepository {
    store: TableStore,
}

impl LocalFileRepository {
    pub fn new(store: TableStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TableRepository for LocalFileRepository {
    fn describe(&self) -> String {
        self.store.path().display().to_string()
    }

    async fn load(&self) -> anyhow::Result<LoadedTable> {
        let Some(bytes) = self.store.read_bytes().await? else {
            return Ok(LoadedTable {
                table: CanonicalTable::new(),
                revision: None,
            });
        };
        let table = CanonicalTable::read_csv(bytes.as_slice())
            .with_context(|| format!("parsing {}", self.store.path().display()))?;
        Ok(LoadedTable {
            table,
            revision: Some(TableStore::sha256_hex(&bytes)),
        })
    }

    async fn publish(
        &self,
        table: &CanonicalTable,
        message: &str,
        base_revision: Option<&str>,
    ) -> Result<PublishReceipt, PublishError> {
        let current = self
            .store
            .read_bytes()
            .await?
            .map(|bytes| TableStore::sha256_hex(&bytes));
        if current.as_deref() != base_revision {
            return Err(PublishError::Conflict {
                branch: self.describe(),
                detail: format!(
                    "expected revision {}, found {}",
                    base_revision.unwrap_or("<none>"),
                    current.as_deref().unwrap_or("<none>")
                ),
            });
        }

        let stored = self.store.save(table).await?;
        info!(path = %stored.path.display(), %message, "table written");
        Ok(PublishReceipt {
            committed: !stored.unchanged,
            revision: stored.content_hash.clone(),
            previous: current,
            content_hash: stored.content_hash,
            byte_size: stored.byte_size,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GithubConfig {
    pub api_url: String,
    pub owner: String,
    pub repo: String,
    pub token: String,
}

/// Git data API client for github.com (or an API-compatible host).
pub struct GithubRefStore {
    client: reqwest::Client,
    config: GithubConfig,
}

#[derive(Debug, Deserialize)]
struct ShaRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: ShaRef,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    tree: ShaRef,
}

/// Maps a failed API response onto the publish error kinds.
pub fn classify_response(
    step: PublishStep,
    branch: &str,
    status: StatusCode,
    body: &str,
) -> PublishError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PublishError::Auth { step, message },
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
            if step == PublishStep::AdvanceRef =>
        {
            PublishError::Conflict {
                branch: branch.to_string(),
                detail: message,
            }
        }
        _ => PublishError::Api {
            step,
            status: Some(status.as_u16()),
            message,
        },
    }
}

impl GithubRefStore {
    pub fn new(http: &HttpFetcher, config: GithubConfig) -> Self {
        Self {
            client: http.client().clone(),
            config,
        }
    }

    pub fn repo_url(&self, tail: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            tail.trim_start_matches('/')
        )
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.request_accepting(method, url, "application/vnd.github+json")
    }

    fn request_accepting(
        &self,
        method: Method,
        url: &str,
        accept: &str,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.config.token)
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(
        &self,
        step: PublishStep,
        branch: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PublishError> {
        let resp = request
            .send()
            .await
            .map_err(|source| PublishError::Transport { step, source })?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_response(step, branch, status, &body))
    }

    async fn json<T: for<'de> Deserialize<'de>>(
        step: PublishStep,
        resp: reqwest::Response,
    ) -> Result<T, PublishError> {
        resp.json::<T>()
            .await
            .map_err(|source| PublishError::Transport { step, source })
    }

    async fn current_ref(&self, branch: &str) -> Result<String, PublishError> {
        let url = self.repo_url(&format!("git/ref/heads/{branch}"));
        let resp = self
            .send(PublishStep::ReadTip, branch, self.request(Method::GET, &url))
            .await?;
        let reference: RefResponse = Self::json(PublishStep::ReadTip, resp).await?;
        Ok(reference.object.sha)
    }
}

#[async_trait]
impl RefStore for GithubRefStore {
    async fn read_tip(&self, branch: &str) -> Result<BranchTip, PublishError> {
        let commit = self.current_ref(branch).await?;
        let url = self.repo_url(&format!("git/commits/{commit}"));
        let resp = self
            .send(PublishStep::ReadTip, branch, self.request(Method::GET, &url))
            .await?;
        let parsed: CommitResponse = Self::json(PublishStep::ReadTip, resp).await?;
        Ok(BranchTip {
            commit,
            tree: parsed.tree.sha,
        })
    }

    async fn read_file(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>, PublishError> {
        let url = self.repo_url(&format!("contents/{path}"));
        let request = self
            .request_accepting(Method::GET, &url, "application/vnd.github.raw+json")
            .query(&[("ref", commit)]);
        let resp = request.send().await.map_err(|source| PublishError::Transport {
            step: PublishStep::ReadFile,
            source,
        })?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_response(PublishStep::ReadFile, "", status, &body));
        }
        let bytes = resp.bytes().await.map_err(|source| PublishError::Transport {
            step: PublishStep::ReadFile,
            source,
        })?;
        Ok(Some(bytes.to_vec()))
    }

    async fn create_tree(
        &self,
        base_tree: &str,
        path: &str,
        content: &[u8],
    ) -> Result<String, PublishError> {
        let content = std::str::from_utf8(content).map_err(|err| PublishError::Api {
            step: PublishStep::CreateTree,
            status: None,
            message: format!("table is not valid UTF-8: {err}"),
        })?;
        let body = json!({
            "base_tree": base_tree,
            "tree": [{
                "path": path,
                "mode": BLOB_FILE_MODE,
                "type": "blob",
                "content": content,
            }],
        });
        let url = self.repo_url("git/trees");
        let resp = self
            .send(
                PublishStep::CreateTree,
                "",
                self.request(Method::POST, &url).json(&body),
            )
            .await?;
        let tree: ShaRef = Self::json(PublishStep::CreateTree, resp).await?;
        Ok(tree.sha)
    }

    async fn create_commit(
        &self,
        message: &str,
        tree: &str,
        parent: &str,
    ) -> Result<String, PublishError> {
        let body = json!({
            "message": message,
            "tree": tree,
            "parents": [parent],
        });
        let url = self.repo_url("git/commits");
        let resp = self
            .send(
                PublishStep::CreateCommit,
                "",
                self.request(Method::POST, &url).json(&body),
            )
            .await?;
        let commit: ShaRef = Self::json(PublishStep::CreateCommit, resp).await?;
        Ok(commit.sha)
    }

    async fn advance_ref(&self, branch: &str, from: &str, to: &str) -> Result<(), PublishError> {
        let current = self.current_ref(branch).await?;
        if current != from {
            return Err(PublishError::Conflict {
                branch: branch.to_string(),
                detail: format!("expected tip {from}, found {current}"),
            });
        }
        let url = self.repo_url(&format!("git/refs/heads/{branch}"));
        let body = json!({ "sha": to, "force": false });
        self.send(
            PublishStep::AdvanceRef,
            branch,
            self.request(Method::PATCH, &url).json(&body),
        )
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MemoryCommit {
    tree: String,
    parent: Option<String>,
    message: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    branches: HashMap<String, String>,
    commits: HashMap<String, MemoryCommit>,
    trees: HashMap<String, BTreeMap<String, Vec<u8>>>,
    fail_at: Option<PublishStep>,
}

impl MemoryState {
    fn mint(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:038x}", self.next_id)
    }

    fn check(&self, step: PublishStep) -> Result<(), PublishError> {
        if self.fail_at == Some(step) {
            warn!(%step, "injected failure");
            return Err(PublishError::Api {
                step,
                status: None,
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

/// In-process ref store used for dry runs and tests. `fail_at` makes the
/// chosen protocol step fail.
#[derive(Debug, Default)]
pub struct MemoryRefStore {
    state: Mutex<MemoryState>,
}

impl MemoryRefStore {
    /// A repository whose `branch` points at one empty root commit.
    pub fn new(branch: &str) -> Self {
        let mut state = MemoryState::default();
        let tree = state.mint("7e");
        state.trees.insert(tree.clone(), BTreeMap::new());
        let commit = state.mint("c0");
        state.commits.insert(
            commit.clone(),
            MemoryCommit {
                tree,
                parent: None,
                message: "initial commit".into(),
            },
        );
        state.branches.insert(branch.to_string(), commit);
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_at(&self, step: Option<PublishStep>) {
        self.lock().fail_at = step;
    }

    pub fn tip(&self, branch: &str) -> Option<String> {
        self.lock().branches.get(branch).cloned()
    }

    pub fn file_at_tip(&self, branch: &str, path: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        let commit = state.branches.get(branch)?;
        let tree = &state.commits.get(commit)?.tree;
        state.trees.get(tree)?.get(path).cloned()
    }

    /// Commit messages reachable from `branch`, newest first.
    pub fn history(&self, branch: &str) -> Vec<String> {
        let state = self.lock();
        let mut messages = Vec::new();
        let mut cursor = state.branches.get(branch).cloned();
        while let Some(id) = cursor {
            let Some(commit) = state.commits.get(&id) else {
                break;
            };
            messages.push(commit.message.clone());
            cursor = commit.parent.clone();
        }
        messages
    }

    /// Moves `branch` directly, as another writer would.
    pub fn force_commit(&self, branch: &str, path: &str, content: &[u8], message: &str) {
        let mut state = self.lock();
        let Some(parent) = state.branches.get(branch).cloned() else {
            return;
        };
        let mut files = state
            .commits
            .get(&parent)
            .and_then(|c| state.trees.get(&c.tree))
            .cloned()
            .unwrap_or_default();
        files.insert(path.to_string(), content.to_vec());
        let tree = state.mint("7e");
        state.trees.insert(tree.clone(), files);
        let commit = state.mint("c0");
        state.commits.insert(
            commit.clone(),
            MemoryCommit {
                tree,
                parent: Some(parent),
                message: message.to_string(),
            },
        );
        state.branches.insert(branch.to_string(), commit);
    }
}

#[async_trait]
impl RefStore for MemoryRefStore {
    async fn read_tip(&self, branch: &str) -> Result<BranchTip, PublishError> {
        let state = self.lock();
        state.check(PublishStep::ReadTip)?;
        let unknown = || PublishError::Api {
            step: PublishStep::ReadTip,
            status: Some(404),
            message: format!("unknown branch {branch}"),
        };
        let commit = state.branches.get(branch).ok_or_else(unknown)?;
        let tree = &state.commits.get(commit).ok_or_else(unknown)?.tree;
        Ok(BranchTip {
            commit: commit.clone(),
            tree: tree.clone(),
        })
    }

    async fn read_file(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>, PublishError> {
        let state = self.lock();
        state.check(PublishStep::ReadFile)?;
        Ok(state
            .commits
            .get(commit)
            .and_then(|c| state.trees.get(&c.tree))
            .and_then(|files| files.get(path))
            .cloned())
    }

    async fn create_tree(
        &self,
        base_tree: &str,
        path: &str,
        content: &[u8],
    ) -> Result<String, PublishError> {
        let mut state = self.lock();
        state.check(PublishStep::CreateTree)?;
        let mut files = state
            .trees
            .get(base_tree)
            .cloned()
            .ok_or_else(|| PublishError::Api {
                step: PublishStep::CreateTree,
                status: Some(422),
                message: format!("unknown base tree {base_tree}"),
            })?;
        files.insert(path.to_string(), content.to_vec());
        let id = state.mint("7e");
        state.trees.insert(id.clone(), files);
        Ok(id)
    }

    async fn create_commit(
        &self,
        message: &str,
        tree: &str,
        parent: &str,
    ) -> Result<String, PublishError> {
        let mut state = self.lock();
        state.check(PublishStep::CreateCommit)?;
        if !state.trees.contains_key(tree) || !state.commits.contains_key(parent) {
            return Err(PublishError::Api {
                step: PublishStep::CreateCommit,
                status: Some(422),
                message: "unknown tree or parent".into(),
            });
        }
        let id = state.mint("c0");
        state.commits.insert(
            id.clone(),
            MemoryCommit {
                tree: tree.to_string(),
                parent: Some(parent.to_string()),
                message: message.to_string(),
            },
        );
        Ok(id)
    }

    async fn advance_ref(&self, branch: &str, from: &str, to: &str) -> Result<(), PublishError> {
        let mut state = self.lock();
        state.check(PublishStep::AdvanceRef)?;
        let current = state.branches.get(branch).cloned().unwrap_or_default();
        let fast_forward = state
            .commits
            .get(to)
            .and_then(|c| c.parent.as_deref())
            .is_some_and(|parent| parent == current);
        if current != from || !fast_forward {
            return Err(PublishError::Conflict {
                branch: branch.to_string(),
                detail: format!("expected tip {from}, found {current}"),
            });
        }
        state.branches.insert(branch.to_string(), to.to_string());
        Ok(())
    }
}
