//! Commit history models produced by the repository log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single commit from the followed repository. Immutable once observed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub hash: String,
    #[serde(default)]
    pub parents: Vec<String>,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl Commit {
    /// First line of the commit message.
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }
}

/// Position of a branch tip. Replaced wholesale on every refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchHead {
    pub name: String,
    pub head: String,
}

/// A comment attached to a commit rather than to a build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommitComment {
    #[serde(default)]
    pub id: i64,
    pub commit: String,
    pub user: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Request body for commenting on a commit.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCommentRequest {
    pub user: String,
    pub message: String,
}
