//! Composite payload served for a window of commits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{BranchHead, BuildSummary, BuilderStatus, Commit, CommitComment};

/// Per-commit, per-builder build summaries.
pub type BuildsByCommit = BTreeMap<String, BTreeMap<String, BuildSummary>>;

/// Commits in `[start_idx, end_idx)` joined with their build state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitRangeData {
    pub comments: BTreeMap<String, Vec<CommitComment>>,
    pub commits: Vec<Commit>,
    pub branch_heads: Vec<BranchHead>,
    pub builds: BuildsByCommit,
    pub builders: BTreeMap<String, BuilderStatus>,
    #[serde(rename = "startIdx")]
    pub start_idx: usize,
    #[serde(rename = "endIdx")]
    pub end_idx: usize,
}
