//! Human-entered builder annotations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An annotation on a builder's health. The highest id per builder is current.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuilderStatus {
    #[serde(default)]
    pub id: i64,
    pub builder: String,
    pub user: String,
    pub timestamp: DateTime<Utc>,
    pub flaky: bool,
    pub ignore_failure: bool,
    pub message: String,
}

/// Request body for setting a builder status.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBuilderStatusRequest {
    pub user: String,
    #[serde(default)]
    pub flaky: bool,
    #[serde(default)]
    pub ignore_failure: bool,
    #[serde(default)]
    pub message: String,
}
