//! Commit window endpoints.

use axum::extract::{Path, Query, State};
use chrono::Utc;
use serde::Deserialize;

use super::{parse_id, require, success, ApiResult};
use crate::models::{Commit, CommitComment, CommitRangeData, CreateCommentRequest};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LastNQuery {
    pub n: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: usize,
    pub end: usize,
}

/// GET /json/commits - The most recent commits with their builds.
pub async fn last_commits(
    State(state): State<AppState>,
    Query(query): Query<LastNQuery>,
) -> ApiResult<CommitRangeData> {
    let n = query.n.unwrap_or(state.config.window_size);
    success(state.cache.last_n(n).await?)
}

/// GET /json/commits/range - Commits in `[start, end)` with their builds.
pub async fn commit_range(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<CommitRangeData> {
    success(state.cache.range_as_json(query.start, query.end).await?)
}

/// GET /json/commits/:idx - A single commit by position.
pub async fn get_commit(
    State(state): State<AppState>,
    Path(idx): Path<String>,
) -> ApiResult<Commit> {
    let idx = parse_id("commit index", &idx)?;
    success(state.cache.get_commit(idx).await?)
}

/// POST /api/commits/:hash/comments - Comment on a commit.
pub async fn add_commit_comment(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    axum::Json(request): axum::Json<CreateCommentRequest>,
) -> ApiResult<CommitComment> {
    require("user", &request.user)?;
    require("message", &request.message)?;

    let comment = CommitComment {
        id: 0,
        commit: hash,
        user: request.user,
        timestamp: Utc::now(),
        message: request.message,
    };
    success(state.cache.add_commit_comment(comment).await?)
}
