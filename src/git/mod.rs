//! Repository log backed by a local git checkout.
//!
//! Shells out to the `git` CLI; output parsing lives in pure functions so it
//! can be tested without a repository.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use tokio::process::Command;
use tracing::debug;

use crate::errors::AppError;
use crate::models::{BranchHead, Commit};

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';
const LOG_FORMAT: &str = "--format=%H%x1f%P%x1f%an <%ae>%x1f%ct%x1f%B%x1e";

/// Ordered, append-only commit history of a source repository.
#[async_trait]
pub trait RepositoryLog: Send + Sync {
    /// Fetch the latest history from upstream.
    async fn sync(&self) -> Result<(), AppError>;

    /// Commits with a timestamp strictly after `since` (all commits when
    /// `None`), oldest first.
    async fn commits_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Commit>, AppError>;

    /// Current tip of every local branch.
    async fn branch_heads(&self) -> Result<Vec<BranchHead>, AppError>;
}

/// [`RepositoryLog`] over a checkout on local disk.
#[derive(Debug, Clone)]
pub struct GitRepositoryLog {
    repo_path: PathBuf,
    sync_enabled: bool,
}

impl GitRepositoryLog {
    pub fn new(repo_path: impl Into<PathBuf>, sync_enabled: bool) -> Self {
        Self {
            repo_path: repo_path.into(),
            sync_enabled,
        }
    }

    /// Run git in the checkout and return stdout.
    async fn git(&self, args: &[&str]) -> Result<String, AppError> {
        debug!("Running git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| AppError::Repo(format!("Failed to run git {}: {}", args[0], e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Repo(format!(
                "git {} failed: {}",
                args[0],
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn has_upstream(&self) -> bool {
        self.git(&["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"])
            .await
            .is_ok()
    }
}

#[async_trait]
impl RepositoryLog for GitRepositoryLog {
    async fn sync(&self) -> Result<(), AppError> {
        if !self.sync_enabled {
            return Ok(());
        }
        self.git(&["fetch", "--all", "--prune", "--quiet"]).await?;
        if self.has_upstream().await {
            self.git(&["pull", "--ff-only", "--quiet"]).await?;
        }
        Ok(())
    }

    async fn commits_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Commit>, AppError> {
        let since_arg;
        let mut args = vec!["log", "--branches", "--topo-order", "--reverse", LOG_FORMAT];
        if let Some(ts) = since {
            since_arg = format!("--since={}", ts.to_rfc3339_opts(SecondsFormat::Secs, true));
            args.push(&since_arg);
        }
        let output = self.git(&args).await?;
        let mut commits = parse_log(&output)?;
        if let Some(ts) = since {
            commits.retain(|c| c.timestamp > ts);
        }
        // Stable, so topological order breaks timestamp ties.
        commits.sort_by_key(|c| c.timestamp);
        Ok(commits)
    }

    async fn branch_heads(&self) -> Result<Vec<BranchHead>, AppError> {
        let output = self
            .git(&[
                "for-each-ref",
                "--sort=refname",
                "--format=%(refname:short) %(objectname)",
                "refs/heads",
            ])
            .await?;
        parse_branch_heads(&output)
    }
}

/// Parse `git log` output produced with [`LOG_FORMAT`].
pub fn parse_log(output: &str) -> Result<Vec<Commit>, AppError> {
    let mut commits = Vec::new();
    for record in output.split(RECORD_SEP) {
        let record = record.trim_start_matches('\n');
        if record.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.splitn(5, FIELD_SEP).collect();
        if fields.len() != 5 {
            return Err(AppError::Repo(format!(
                "Malformed git log record: {:?}",
                record
            )));
        }
        let seconds: i64 = fields[3]
            .trim()
            .parse()
            .map_err(|e| AppError::Repo(format!("Bad commit timestamp {:?}: {}", fields[3], e)))?;
        let timestamp = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| AppError::Repo(format!("Commit timestamp out of range: {}", seconds)))?;

        commits.push(Commit {
            hash: fields[0].to_string(),
            parents: fields[1].split_whitespace().map(str::to_string).collect(),
            author: fields[2].to_string(),
            timestamp,
            message: fields[4].trim_end().to_string(),
        });
    }
    Ok(commits)
}

/// Parse `git for-each-ref` output of `<name> <hash>` lines.
pub fn parse_branch_heads(output: &str) -> Result<Vec<BranchHead>, AppError> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (name, head) = line
                .rsplit_once(' ')
                .ok_or_else(|| AppError::Repo(format!("Malformed ref line: {:?}", line)))?;
            Ok(BranchHead {
                name: name.to_string(),
                head: head.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn test_parse_log_records() {
        let output = "aaa\u{1f}\u{1f}Alice <a@example.com>\u{1f}1700000000\u{1f}Initial commit\n\u{1e}\n\
                      bbb\u{1f}aaa\u{1f}Bob <b@example.com>\u{1f}1700000100\u{1f}Second\n\nWith body\n\u{1e}\n";
        let commits = parse_log(output).unwrap();

        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, "aaa");
        assert!(commits[0].parents.is_empty());
        assert_eq!(commits[1].parents, vec!["aaa"]);
        assert_eq!(commits[1].author, "Bob <b@example.com>");
        assert_eq!(commits[1].timestamp.timestamp(), 1_700_000_100);
        assert_eq!(commits[1].message, "Second\n\nWith body");
        assert_eq!(commits[1].subject(), "Second");
    }

    #[test]
    fn test_parse_log_merge_parents() {
        let output = "ccc\u{1f}aaa bbb\u{1f}C <c@x>\u{1f}1700000200\u{1f}Merge\n\u{1e}";
        let commits = parse_log(output).unwrap();
        assert_eq!(commits[0].parents, vec!["aaa", "bbb"]);
    }

    #[test]
    fn test_parse_log_rejects_garbage() {
        let err = parse_log("not a log record\u{1e}").unwrap_err();
        assert!(matches!(err, AppError::Repo(_)));
        assert!(parse_log("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_branch_heads() {
        let heads = parse_branch_heads("feature/x 111\nmain 222\n").unwrap();
        assert_eq!(
            heads,
            vec![
                BranchHead {
                    name: "feature/x".to_string(),
                    head: "111".to_string()
                },
                BranchHead {
                    name: "main".to_string(),
                    head: "222".to_string()
                },
            ]
        );
    }

    async fn run_git(dir: &Path, args: &[&str], date: &str) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "Tester")
            .env("GIT_AUTHOR_EMAIL", "tester@example.com")
            .env("GIT_COMMITTER_NAME", "Tester")
            .env("GIT_COMMITTER_EMAIL", "tester@example.com")
            .env("GIT_AUTHOR_DATE", date)
            .env("GIT_COMMITTER_DATE", date)
            .status()
            .await
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    #[tokio::test]
    async fn test_git_repository_log_against_scratch_repo() {
        if Command::new("git").arg("--version").output().await.is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let path = dir.path();
        run_git(path, &["init", "--quiet", "-b", "main"], "1700000000 +0000").await;
        run_git(
            path,
            &["commit", "--allow-empty", "--quiet", "-m", "first"],
            "1700000000 +0000",
        )
        .await;
        run_git(
            path,
            &["commit", "--allow-empty", "--quiet", "-m", "second"],
            "1700000100 +0000",
        )
        .await;

        let log = GitRepositoryLog::new(path, true);
        log.sync().await.unwrap();

        let all = log.commits_since(None).await.unwrap();
        let subjects: Vec<_> = all.iter().map(|c| c.subject()).collect();
        assert_eq!(subjects, vec!["first", "second"]);
        assert_eq!(all[1].parents, vec![all[0].hash.clone()]);

        let newer = log.commits_since(Some(all[0].timestamp)).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].hash, all[1].hash);

        let heads = log.branch_heads().await.unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].name, "main");
        assert_eq!(heads[0].head, all[1].hash);
    }
}
