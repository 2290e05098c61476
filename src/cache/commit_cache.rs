//! The commit history plus an embedded build window.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::build_cache::{BuildCache, BuildWindow};
use super::filter::BuilderFilter;
use super::snapshot::{read_snapshot, write_snapshot, Snapshot, SNAPSHOT_VERSION};
use crate::db::BuildStore;
use crate::errors::AppError;
use crate::git::RepositoryLog;
use crate::models::{
    BranchHead, Build, BuildComment, BuilderStatus, Commit, CommitComment, CommitRangeData,
};

/// Settings consumed by [`CommitCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of trailing commits whose builds stay resident.
    pub window_size: usize,
    pub refresh_interval: Duration,
    pub snapshot_path: PathBuf,
}

impl CacheConfig {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            window_size: 35,
            refresh_interval: Duration::from_secs(60),
            snapshot_path: snapshot_path.into(),
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Uninitialized,
    Loading,
    Ready,
}

impl CacheState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CacheState::Loading,
            2 => CacheState::Ready,
            _ => CacheState::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CacheState::Uninitialized => 0,
            CacheState::Loading => 1,
            CacheState::Ready => 2,
        }
    }
}

#[derive(Default)]
struct CommitState {
    commits: Vec<Commit>,
    positions: HashMap<String, usize>,
    branch_heads: Vec<BranchHead>,
}

impl CommitState {
    fn append(&mut self, commits: Vec<Commit>) {
        for commit in commits {
            self.positions.insert(commit.hash.clone(), self.commits.len());
            self.commits.push(commit);
        }
    }

    fn tail_hashes(&self, n: usize) -> Vec<String> {
        let start = self.commits.len().saturating_sub(n);
        self.commits[start..].iter().map(|c| c.hash.clone()).collect()
    }
}

/// Append-only commit history with build data for its trailing window.
pub struct CommitCache {
    config: CacheConfig,
    repo: Arc<dyn RepositoryLog>,
    store: Arc<dyn BuildStore>,
    builds: BuildCache,
    state: RwLock<CommitState>,
    lifecycle: AtomicU8,
    refresh_lock: Mutex<()>,
}

impl CommitCache {
    /// Create the cache and restore the snapshot if there is a usable one.
    /// The cache reports `Loading` until [`CommitCache::load`] succeeds.
    pub async fn open(
        config: CacheConfig,
        store: Arc<dyn BuildStore>,
        repo: Arc<dyn RepositoryLog>,
        filter: BuilderFilter,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            builds: BuildCache::new(store.clone(), filter),
            config,
            repo,
            store,
            state: RwLock::new(CommitState::default()),
            lifecycle: AtomicU8::new(CacheState::Uninitialized.as_u8()),
            refresh_lock: Mutex::new(()),
        });

        cache.set_state(CacheState::Loading);
        cache.restore().await;
        cache
    }

    /// First refresh after [`CommitCache::open`]; marks the cache ready.
    pub async fn load(&self) -> Result<(), AppError> {
        self.refresh().await?;
        self.set_state(CacheState::Ready);
        let commits = self.num_commits().await;
        info!(commits, "Commit cache ready");
        Ok(())
    }

    #[cfg(test)]
    pub async fn new(
        config: CacheConfig,
        store: Arc<dyn BuildStore>,
        repo: Arc<dyn RepositoryLog>,
        filter: BuilderFilter,
    ) -> Result<Arc<Self>, AppError> {
        let cache = Self::open(config, store, repo, filter).await;
        cache.load().await?;
        Ok(cache)
    }

    async fn restore(&self) {
        let path = &self.config.snapshot_path;
        let snapshot = match read_snapshot(path).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!("No snapshot at {}; starting empty", path.display());
                return;
            }
            Err(e) => {
                warn!("Ignoring snapshot at {}: {}", path.display(), e);
                return;
            }
        };

        info!(
            commits = snapshot.commits.len(),
            builds = snapshot.builds_by_id.len(),
            "Loaded snapshot from {}",
            path.display()
        );
        {
            let mut state = self.state.write().await;
            state.append(snapshot.commits);
            state.branch_heads = snapshot.branch_heads;
        }
        self.builds
            .update_with_data(BuildWindow {
                by_id: snapshot.builds_by_id,
                by_commit: snapshot.builds_by_commit,
                builders: snapshot.builder_statuses,
            })
            .await;
    }

    fn set_state(&self, state: CacheState) {
        self.lifecycle.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn state(&self) -> CacheState {
        CacheState::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Pull new commits and reload the build window.
    ///
    /// Either every step succeeds and the new state is installed, or the old
    /// state is kept as it was. Returns the number of commits appended.
    pub async fn refresh(&self) -> Result<usize, AppError> {
        let _flight = self.refresh_lock.lock().await;
        info!("Refreshing commit cache");

        let since = self.state.read().await.commits.last().map(|c| c.timestamp);
        self.repo.sync().await?;
        let fetched = self.repo.commits_since(since).await?;
        let branch_heads = self.repo.branch_heads().await?;

        let (new_commits, window_hashes) = {
            let state = self.state.read().await;
            let mut seen = HashSet::new();
            let new_commits: Vec<Commit> = fetched
                .into_iter()
                .filter(|c| !state.positions.contains_key(&c.hash) && seen.insert(c.hash.clone()))
                .collect();

            let keep = self.config.window_size.saturating_sub(new_commits.len());
            let mut hashes = state.tail_hashes(keep);
            hashes.extend(new_commits.iter().map(|c| c.hash.clone()));
            let skip = hashes.len().saturating_sub(self.config.window_size);
            (new_commits, hashes.split_off(skip))
        };

        // Comment and status writes wait until the new window is installed.
        let writes = self.builds.lock_writes().await;
        let window = self.builds.load_data(&window_hashes).await?;

        let added = new_commits.len();
        {
            let mut state = self.state.write().await;
            state.append(new_commits);
            state.branch_heads = branch_heads;
            self.builds.update_with_data(window).await;
        }
        drop(writes);
        info!(new_commits = added, "Refresh finished");

        if let Err(e) = self.persist().await {
            error!("Failed to write snapshot: {}", e);
        }
        Ok(added)
    }

    async fn persist(&self) -> Result<(), AppError> {
        let window = self.builds.export().await;
        let snapshot = {
            let state = self.state.read().await;
            Snapshot {
                version: SNAPSHOT_VERSION,
                commits: state.commits.clone(),
                branch_heads: state.branch_heads.clone(),
                builds_by_id: window.by_id,
                builds_by_commit: window.by_commit,
                builder_statuses: window.builders,
            }
        };
        write_snapshot(&self.config.snapshot_path, &snapshot).await
    }

    pub async fn num_commits(&self) -> usize {
        self.state.read().await.commits.len()
    }

    #[cfg(test)]
    pub async fn branch_heads(&self) -> Vec<BranchHead> {
        self.state.read().await.branch_heads.clone()
    }

    pub async fn get_commit(&self, index: i64) -> Result<Commit, AppError> {
        let state = self.state.read().await;
        usize::try_from(index)
            .ok()
            .and_then(|i| state.commits.get(i))
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Commit index {} out of range (have {})",
                    index,
                    state.commits.len()
                ))
            })
    }

    /// Commits in `[start, end)`.
    #[cfg(test)]
    pub async fn slice(&self, start: usize, end: usize) -> Result<Vec<Commit>, AppError> {
        let state = self.state.read().await;
        check_range(start, end, state.commits.len())?;
        Ok(state.commits[start..end].to_vec())
    }

    /// Commits in `[start, end)` joined with their builds, builder statuses
    /// and commit comments.
    pub async fn range_as_json(
        &self,
        start: usize,
        end: usize,
    ) -> Result<CommitRangeData, AppError> {
        let (commits, branch_heads) = {
            let state = self.state.read().await;
            check_range(start, end, state.commits.len())?;
            (state.commits[start..end].to_vec(), state.branch_heads.clone())
        };

        let hashes: Vec<String> = commits.iter().map(|c| c.hash.clone()).collect();
        let (builds, builders) = self.builds.get_builds_for_commits(&hashes).await?;
        let comments = self
            .store
            .get_comments_for_commits(&hashes)
            .await?
            .into_iter()
            .collect();

        Ok(CommitRangeData {
            comments,
            commits,
            branch_heads,
            builds,
            builders,
            start_idx: start,
            end_idx: end,
        })
    }

    /// The last `n` commits, or all of them if there are fewer.
    pub async fn last_n(&self, n: usize) -> Result<CommitRangeData, AppError> {
        let end = self.num_commits().await;
        self.range_as_json(end.saturating_sub(n), end).await
    }

    pub async fn get_build(&self, id: i64) -> Result<Build, AppError> {
        self.builds.get(id).await
    }

    pub async fn add_build_comment(
        &self,
        build_id: i64,
        user: &str,
        message: &str,
    ) -> Result<Build, AppError> {
        let comment = BuildComment {
            id: 0,
            user: user.to_string(),
            timestamp: Utc::now(),
            message: message.to_string(),
        };
        self.builds
            .update_build(build_id, move |b| b.comments.push(comment))
            .await
    }

    pub async fn set_builder_status(
        &self,
        builder: &str,
        status: BuilderStatus,
    ) -> Result<BuilderStatus, AppError> {
        self.builds.set_builder_status(builder, status).await
    }

    /// Store a comment on a known commit.
    pub async fn add_commit_comment(
        &self,
        mut comment: CommitComment,
    ) -> Result<CommitComment, AppError> {
        if !self.state.read().await.positions.contains_key(&comment.commit) {
            return Err(AppError::NotFound(format!(
                "No such commit: {}",
                comment.commit
            )));
        }
        comment.id = self.store.insert_commit_comment(&comment).await?;
        Ok(comment)
    }

    #[cfg(test)]
    pub(crate) fn builds(&self) -> &BuildCache {
        &self.builds
    }
}

fn check_range(start: usize, end: usize, len: usize) -> Result<(), AppError> {
    if start > end || end > len {
        return Err(AppError::InvalidRange(format!(
            "Invalid range [{}, {}) for {} commits",
            start, end, len
        )));
    }
    Ok(())
}
