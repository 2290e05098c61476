//! Builder status endpoint.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;

use super::{require, success, ApiResult};
use crate::models::{BuilderStatus, SetBuilderStatusRequest};
use crate::AppState;

/// POST /api/builders/:builder/status - Annotate a builder.
pub async fn set_builder_status(
    State(state): State<AppState>,
    Path(builder): Path<String>,
    Json(request): Json<SetBuilderStatusRequest>,
) -> ApiResult<BuilderStatus> {
    require("user", &request.user)?;

    let status = BuilderStatus {
        id: 0,
        builder: builder.clone(),
        user: request.user,
        timestamp: Utc::now(),
        flaky: request.flaky,
        ignore_failure: request.ignore_failure,
        message: request.message,
    };
    success(state.cache.set_builder_status(&builder, status).await?)
}
