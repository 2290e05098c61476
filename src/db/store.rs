//! The build store contract consumed by the caches.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::errors::AppError;
use crate::models::{Build, BuilderStatus, CommitComment};

/// Persistent store of builds, steps, comments and builder statuses.
///
/// Injected into the caches at construction; every method may fail with
/// [`AppError::Store`].
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Builds that first included each of `commits`, minus `exclude_ids`.
    /// Commits without builds are absent from the result.
    async fn get_builds_for_commits(
        &self,
        commits: &[String],
        exclude_ids: &HashSet<i64>,
    ) -> Result<HashMap<String, Vec<Build>>, AppError>;

    /// Builds by id. Unknown ids are absent from the result.
    async fn get_builds_by_id(&self, ids: &[i64]) -> Result<HashMap<i64, Build>, AppError>;

    /// Current (highest id) status of each builder that has one.
    async fn get_builder_statuses(
        &self,
        builders: &[String],
    ) -> Result<HashMap<String, BuilderStatus>, AppError>;

    /// Commit-level comments grouped by commit hash.
    async fn get_comments_for_commits(
        &self,
        commits: &[String],
    ) -> Result<HashMap<String, Vec<CommitComment>>, AppError>;

    /// Transactionally upserts `build` and replaces its steps, commit
    /// associations and comments. Returns the build with store ids filled in.
    async fn replace_build(&self, build: &Build) -> Result<Build, AppError>;

    /// Appends a builder status row and returns its id.
    async fn insert_builder_status(&self, status: &BuilderStatus) -> Result<i64, AppError>;

    /// Appends a commit comment row and returns its id.
    async fn insert_commit_comment(&self, comment: &CommitComment) -> Result<i64, AppError>;
}
