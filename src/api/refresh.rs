//! Manual refresh endpoint.

use axum::extract::State;
use serde::Serialize;

use super::{success, ApiResult};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResult {
    pub new_commits: usize,
    pub num_commits: usize,
}

/// POST /api/refresh - Pull new commits now instead of waiting for the timer.
pub async fn refresh(State(state): State<AppState>) -> ApiResult<RefreshResult> {
    let new_commits = state.cache.refresh().await?;
    success(RefreshResult {
        new_commits,
        num_commits: state.cache.num_commits().await,
    })
}
