//! In-memory index over build data for the trailing commit window.
//!
//! The three indexes live in sharded maps inside a window generation. The
//! generation pointer is swapped wholesale on refresh; point reads, miss-fill
//! merges and write-through patches only touch individual shards.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::warn;

use super::filter::BuilderFilter;
use crate::db::BuildStore;
use crate::errors::AppError;
use crate::models::{Build, BuildSummary, BuilderStatus, BuildsByCommit};

/// Build data for a set of commits, as produced by [`BuildCache::load_data`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildWindow {
    pub by_id: BTreeMap<i64, Build>,
    pub by_commit: BuildsByCommit,
    pub builders: BTreeMap<String, BuilderStatus>,
}

/// One generation of the cached window.
#[derive(Default)]
struct WindowIndex {
    by_id: DashMap<i64, Build>,
    by_commit: DashMap<String, BTreeMap<String, BuildSummary>>,
    builders: DashMap<String, BuilderStatus>,
}

impl WindowIndex {
    fn from_window(window: BuildWindow) -> Self {
        Self {
            by_id: window.by_id.into_iter().collect(),
            by_commit: window.by_commit.into_iter().collect(),
            builders: window.builders.into_iter().collect(),
        }
    }

    /// Merge freshly loaded entries, keeping everything already cached.
    fn merge(&self, window: &BuildWindow) {
        for (id, build) in &window.by_id {
            self.by_id.insert(*id, build.clone());
        }
        for (hash, by_builder) in &window.by_commit {
            self.by_commit
                .entry(hash.clone())
                .or_default()
                .extend(by_builder.iter().map(|(b, s)| (b.clone(), s.clone())));
        }
        for (builder, status) in &window.builders {
            self.builders.insert(builder.clone(), status.clone());
        }
    }

    fn builder_statuses(&self) -> BTreeMap<String, BuilderStatus> {
        self.builders
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

/// Read-mostly cache of builds keyed by id, by commit and by builder.
pub struct BuildCache {
    store: Arc<dyn BuildStore>,
    filter: BuilderFilter,
    window: RwLock<Arc<WindowIndex>>,
    /// Serializes read-modify-write of cached builds against the store.
    writes: Mutex<()>,
}

impl BuildCache {
    pub fn new(store: Arc<dyn BuildStore>, filter: BuilderFilter) -> Self {
        Self {
            store,
            filter,
            window: RwLock::new(Arc::new(WindowIndex::default())),
            writes: Mutex::new(()),
        }
    }

    async fn current(&self) -> Arc<WindowIndex> {
        self.window.read().await.clone()
    }

    /// Load build data for `commits` from the store without touching the cache.
    ///
    /// Every requested commit gets an entry in `by_commit`, empty when no
    /// builder has run for it yet. Skipped builders are kept in `by_id` only.
    pub async fn load_data(&self, commits: &[String]) -> Result<BuildWindow, AppError> {
        let builds = self
            .store
            .get_builds_for_commits(commits, &HashSet::new())
            .await?;

        let mut window = BuildWindow::default();
        for hash in commits {
            window.by_commit.entry(hash.clone()).or_default();
        }

        let mut builders = BTreeSet::new();
        for (hash, list) in builds {
            let by_builder = window.by_commit.entry(hash).or_default();
            for build in list {
                if !self.filter.skips(&build.builder) {
                    let newer = by_builder
                        .get(&build.builder)
                        .map_or(true, |s| s.number <= build.number);
                    if newer {
                        by_builder.insert(build.builder.clone(), build.summary());
                    }
                    builders.insert(build.builder.clone());
                }
                window.by_id.insert(build.id, build);
            }
        }

        if !builders.is_empty() {
            let names: Vec<String> = builders.into_iter().collect();
            window.builders = self
                .store
                .get_builder_statuses(&names)
                .await?
                .into_iter()
                .collect();
        }
        Ok(window)
    }

    /// Replace the whole window. This is how periodic refresh installs state.
    pub async fn update_with_data(&self, window: BuildWindow) {
        let index = Arc::new(WindowIndex::from_window(window));
        *self.window.write().await = index;
    }

    /// Copy of the current window, for snapshots.
    pub async fn export(&self) -> BuildWindow {
        let index = self.current().await;
        BuildWindow {
            by_id: index
                .by_id
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            by_commit: index
                .by_commit
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            builders: index.builder_statuses(),
        }
    }

    /// Summaries for `commits` plus the status of every known builder.
    ///
    /// Commits missing from the window are loaded from the store and merged
    /// in. A failed load leaves the cache untouched.
    pub async fn get_builds_for_commits(
        &self,
        commits: &[String],
    ) -> Result<(BuildsByCommit, BTreeMap<String, BuilderStatus>), AppError> {
        let index = self.current().await;

        let mut by_commit = BuildsByCommit::new();
        let mut missing = Vec::new();
        for hash in commits {
            match index.by_commit.get(hash) {
                Some(entry) => {
                    by_commit.insert(hash.clone(), entry.value().clone());
                }
                None => missing.push(hash.clone()),
            }
        }

        if missing.is_empty() {
            return Ok((by_commit, index.builder_statuses()));
        }

        warn!(
            "Missing build data for some commits; loading now ({:?})",
            missing
        );
        let loaded = self.load_data(&missing).await?;

        // Merge into whichever generation is current now.
        let index = self.current().await;
        index.merge(&loaded);
        by_commit.extend(loaded.by_commit);
        Ok((by_commit, index.builder_statuses()))
    }

    /// Build by id. On a miss the store is consulted, but the result is not
    /// added to the window.
    pub async fn get(&self, id: i64) -> Result<Build, AppError> {
        if let Some(build) = self.current().await.by_id.get(&id) {
            return Ok(build.value().clone());
        }

        warn!("Missing build with id {}; loading now.", id);
        self.store
            .get_builds_by_id(&[id])
            .await?
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("No such build: {}", id)))
    }

    /// Record a new status for `builder`. The store assigns its id first.
    pub async fn set_builder_status(
        &self,
        builder: &str,
        mut status: BuilderStatus,
    ) -> Result<BuilderStatus, AppError> {
        let _guard = self.writes.lock().await;

        status.builder = builder.to_string();
        status.id = self.store.insert_builder_status(&status).await?;

        self.current()
            .await
            .builders
            .insert(builder.to_string(), status.clone());
        Ok(status)
    }

    /// Apply `edit` to a cached build, write it to the store, then patch the
    /// cache with what the store accepted.
    ///
    /// The edit starts from the store's copy of the build, so rows written
    /// since the window was loaded are carried over rather than replaced.
    pub async fn update_build<F>(&self, id: i64, edit: F) -> Result<Build, AppError>
    where
        F: FnOnce(&mut Build) + Send,
    {
        let _guard = self.writes.lock().await;

        if !self.current().await.by_id.contains_key(&id) {
            return Err(AppError::NotFound(format!(
                "Build {} is not in the cached window",
                id
            )));
        }
        let mut build = self
            .store
            .get_builds_by_id(&[id])
            .await?
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("No such build: {}", id)))?;
        edit(&mut build);

        let stored = self.store.replace_build(&build).await?;
        self.patch(&stored).await;
        Ok(stored)
    }

    /// Hold off cache writes while a new window is loaded and installed.
    pub async fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().await
    }

    /// Refresh the cached entries for `build`. Commits outside the window are
    /// left for a miss-fill to load in full.
    async fn patch(&self, build: &Build) {
        let index = self.current().await;
        index.by_id.insert(build.id, build.clone());
        if self.filter.skips(&build.builder) {
            return;
        }
        let summary = build.summary();
        for hash in &build.commits {
            if let Some(mut by_builder) = index.by_commit.get_mut(hash) {
                by_builder.insert(build.builder.clone(), summary.clone());
            }
        }
    }
}
