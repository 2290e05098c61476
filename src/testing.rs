//! Test doubles and fixtures shared by the cache and HTTP tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::db::{init_database, BuildStore, RetryConfig, SqliteBuildStore};
use crate::errors::AppError;
use crate::git::RepositoryLog;
use crate::models::{Build, BuildStep, BuilderStatus, BranchHead, Commit, CommitComment};

pub fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

pub fn commit(hash: &str, seconds: i64) -> Commit {
    Commit {
        hash: hash.to_string(),
        parents: vec![],
        author: "dev <dev@example.com>".to_string(),
        timestamp: ts(seconds),
        message: format!("Commit {}", hash),
    }
}

pub fn build(builder: &str, number: i64, results: i64, commits: &[&str]) -> Build {
    Build {
        id: 0,
        builder: builder.to_string(),
        master: "client.skia".to_string(),
        number,
        got_revision: commits.first().map(|c| c.to_string()).unwrap_or_default(),
        branch: "main".to_string(),
        repository: "https://example.com/repo.git".to_string(),
        results,
        build_slave: "slave-1".to_string(),
        started: Some(ts(10)),
        finished: Some(ts(20)),
        properties: serde_json::Value::Null,
        steps: vec![BuildStep {
            name: "compile".to_string(),
            number: 0,
            results,
            started: Some(ts(10)),
            finished: Some(ts(20)),
        }],
        commits: commits.iter().map(|c| c.to_string()).collect(),
        comments: vec![],
    }
}

pub fn status(builder: &str, message: &str) -> BuilderStatus {
    BuilderStatus {
        id: 0,
        builder: builder.to_string(),
        user: "sheriff@example.com".to_string(),
        timestamp: ts(30),
        flaky: false,
        ignore_failure: false,
        message: message.to_string(),
    }
}

/// A fresh SQLite build store in a temp directory, with short retry delays.
pub async fn sqlite_store() -> (Arc<SqliteBuildStore>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("builds.sqlite"))
        .await
        .unwrap();
    let retry = RetryConfig::default()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5));
    (Arc::new(SqliteBuildStore::new(pool).with_retry(retry)), temp_dir)
}

/// In-memory repository log whose history tests append to.
#[derive(Default)]
pub struct MemoryRepositoryLog {
    commits: Mutex<Vec<Commit>>,
    heads: Mutex<Vec<BranchHead>>,
    failing: AtomicBool,
    pub syncs: AtomicUsize,
}

impl MemoryRepositoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a commit and move `main` to it.
    pub fn push(&self, commit: Commit) {
        *self.heads.lock().unwrap() = vec![BranchHead {
            name: "main".to_string(),
            head: commit.hash.clone(),
        }];
        self.commits.lock().unwrap().push(commit);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Repo("repository unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RepositoryLog for MemoryRepositoryLog {
    async fn sync(&self) -> Result<(), AppError> {
        self.check()?;
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commits_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Commit>, AppError> {
        self.check()?;
        Ok(self
            .commits
            .lock()
            .unwrap()
            .iter()
            .filter(|c| since.map_or(true, |ts| c.timestamp > ts))
            .cloned()
            .collect())
    }

    async fn branch_heads(&self) -> Result<Vec<BranchHead>, AppError> {
        self.check()?;
        Ok(self.heads.lock().unwrap().clone())
    }
}

/// Wraps a store, records which commits were fetched and can be made to fail.
pub struct CountingStore {
    inner: Arc<dyn BuildStore>,
    commit_fetches: Mutex<Vec<Vec<String>>>,
    id_fetches: AtomicUsize,
    failing: AtomicBool,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn BuildStore>) -> Self {
        Self {
            inner,
            commit_fetches: Mutex::new(Vec::new()),
            id_fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Commit lists passed to `get_builds_for_commits`, in call order.
    pub fn commit_fetches(&self) -> Vec<Vec<String>> {
        self.commit_fetches.lock().unwrap().clone()
    }

    pub fn id_fetches(&self) -> usize {
        self.id_fetches.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.commit_fetches.lock().unwrap().clear();
        self.id_fetches.store(0, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Store("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BuildStore for CountingStore {
    async fn get_builds_for_commits(
        &self,
        commits: &[String],
        exclude_ids: &HashSet<i64>,
    ) -> Result<HashMap<String, Vec<Build>>, AppError> {
        self.check()?;
        let mut sorted = commits.to_vec();
        sorted.sort();
        self.commit_fetches.lock().unwrap().push(sorted);
        self.inner.get_builds_for_commits(commits, exclude_ids).await
    }

    async fn get_builds_by_id(&self, ids: &[i64]) -> Result<HashMap<i64, Build>, AppError> {
        self.check()?;
        self.id_fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.get_builds_by_id(ids).await
    }

    async fn get_builder_statuses(
        &self,
        builders: &[String],
    ) -> Result<HashMap<String, BuilderStatus>, AppError> {
        self.check()?;
        self.inner.get_builder_statuses(builders).await
    }

    async fn get_comments_for_commits(
        &self,
        commits: &[String],
    ) -> Result<HashMap<String, Vec<CommitComment>>, AppError> {
        self.check()?;
        self.inner.get_comments_for_commits(commits).await
    }

    async fn replace_build(&self, build: &Build) -> Result<Build, AppError> {
        self.check()?;
        self.inner.replace_build(build).await
    }

    async fn insert_builder_status(&self, status: &BuilderStatus) -> Result<i64, AppError> {
        self.check()?;
        self.inner.insert_builder_status(status).await
    }

    async fn insert_commit_comment(&self, comment: &CommitComment) -> Result<i64, AppError> {
        self.check()?;
        self.inner.insert_commit_comment(comment).await
    }
}

/// Wraps a store and, once armed, parks the next commit fetch until released.
pub struct GateStore {
    inner: Arc<dyn BuildStore>,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl GateStore {
    pub fn new(inner: Arc<dyn BuildStore>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until an armed fetch has loaded its builds and is parked.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl BuildStore for GateStore {
    async fn get_builds_for_commits(
        &self,
        commits: &[String],
        exclude_ids: &HashSet<i64>,
    ) -> Result<HashMap<String, Vec<Build>>, AppError> {
        let builds = self.inner.get_builds_for_commits(commits, exclude_ids).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        Ok(builds)
    }

    async fn get_builds_by_id(&self, ids: &[i64]) -> Result<HashMap<i64, Build>, AppError> {
        self.inner.get_builds_by_id(ids).await
    }

    async fn get_builder_statuses(
        &self,
        builders: &[String],
    ) -> Result<HashMap<String, BuilderStatus>, AppError> {
        self.inner.get_builder_statuses(builders).await
    }

    async fn get_comments_for_commits(
        &self,
        commits: &[String],
    ) -> Result<HashMap<String, Vec<CommitComment>>, AppError> {
        self.inner.get_comments_for_commits(commits).await
    }

    async fn replace_build(&self, build: &Build) -> Result<Build, AppError> {
        self.inner.replace_build(build).await
    }

    async fn insert_builder_status(&self, status: &BuilderStatus) -> Result<i64, AppError> {
        self.inner.insert_builder_status(status).await
    }

    async fn insert_commit_comment(&self, comment: &CommitComment) -> Result<i64, AppError> {
        self.inner.insert_commit_comment(comment).await
    }
}
