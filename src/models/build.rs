//! Build models mirrored from the build database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result codes reported by the CI system.
#[allow(dead_code)]
pub mod results {
    pub const SUCCESS: i64 = 0;
    pub const WARNINGS: i64 = 1;
    pub const FAILURE: i64 = 2;
    pub const SKIPPED: i64 = 3;
    pub const EXCEPTION: i64 = 4;
}

/// One execution of a builder.
///
/// Identity is `(builder, master, number)` before the store assigns an id,
/// and `id` afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    #[serde(default)]
    pub id: i64,
    pub builder: String,
    pub master: String,
    pub number: i64,
    #[serde(default)]
    pub got_revision: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub repository: String,
    pub results: i64,
    #[serde(default)]
    pub build_slave: String,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub steps: Vec<BuildStep>,
    /// Commits first included by this build.
    #[serde(default)]
    pub commits: Vec<String>,
    #[serde(default)]
    pub comments: Vec<BuildComment>,
}

impl Build {
    /// Whether the build is still running.
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Condensed projection used to render one dashboard cell.
    pub fn summary(&self) -> BuildSummary {
        BuildSummary {
            id: self.id,
            builder: self.builder.clone(),
            master: self.master.clone(),
            number: self.number,
            build_slave: self.build_slave.clone(),
            results: self.results,
            finished: self.is_finished(),
            commits: self.commits.clone(),
            comments: self.comments.clone(),
            failed_steps: self
                .steps
                .iter()
                .filter(|s| s.results == results::FAILURE || s.results == results::EXCEPTION)
                .map(|s| s.name.clone())
                .collect(),
        }
    }
}

/// One stage of a build. Owned by its build and always replaced as a whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildStep {
    pub name: String,
    pub number: i64,
    pub results: i64,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
}

/// A comment attached to a build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildComment {
    #[serde(default)]
    pub id: i64,
    pub user: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Dashboard view of a build, indexed by (commit hash, builder).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub id: i64,
    pub builder: String,
    pub master: String,
    pub number: i64,
    pub build_slave: String,
    pub results: i64,
    pub finished: bool,
    pub commits: Vec<String>,
    pub comments: Vec<BuildComment>,
    pub failed_steps: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, number: i64, results: i64) -> BuildStep {
        BuildStep {
            name: name.to_string(),
            number,
            results,
            started: None,
            finished: None,
        }
    }

    #[test]
    fn test_summary_lists_failed_steps() {
        let build = Build {
            id: 7,
            builder: "Test-Ubuntu-Release".to_string(),
            master: "client.skia".to_string(),
            number: 12,
            got_revision: "c1".to_string(),
            branch: "main".to_string(),
            repository: String::new(),
            results: results::FAILURE,
            build_slave: "slave-3".to_string(),
            started: Some(Utc::now()),
            finished: None,
            properties: serde_json::Value::Null,
            steps: vec![
                step("update", 0, results::SUCCESS),
                step("compile", 1, results::FAILURE),
                step("upload", 2, results::SKIPPED),
                step("cleanup", 3, results::EXCEPTION),
            ],
            commits: vec!["c1".to_string(), "c0".to_string()],
            comments: vec![],
        };

        let summary = build.summary();
        assert_eq!(summary.id, 7);
        assert!(!summary.finished);
        assert_eq!(summary.failed_steps, vec!["compile", "cleanup"]);
        assert_eq!(summary.commits, build.commits);
    }
}
