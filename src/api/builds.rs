//! Build endpoints.

use axum::{
    extract::{Path, State},
    Json,
};

use super::{parse_id, require, success, ApiResult};
use crate::models::{Build, CreateCommentRequest};
use crate::AppState;

/// GET /api/builds/:id - A build, cached or not.
pub async fn get_build(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Build> {
    let id = parse_id("build id", &id)?;
    success(state.cache.get_build(id).await?)
}

/// POST /api/builds/:id/comments - Comment on a build.
pub async fn add_build_comment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CreateCommentRequest>,
) -> ApiResult<Build> {
    let id = parse_id("build id", &id)?;
    require("user", &request.user)?;
    require("message", &request.message)?;

    let build = state
        .cache
        .add_build_comment(id, &request.user, &request.message)
        .await?;
    tracing::info!(build = id, user = %request.user, "Added build comment");
    success(build)
}
